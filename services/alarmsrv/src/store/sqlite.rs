//! SQLite-backed alert store
//!
//! Shares its schema with the dashboard and the sensor logger, which write
//! rules, groups, policies and measurements. This service only opens,
//! resolves, acknowledges and reads.

use super::{
    format_timestamp, is_valid_phone_number, local_now, parse_timestamp, AlertHistoryRecord,
    AlertStore, DeviceInfo, Measurement,
};
use crate::error::Result;
use aqua_rules::{
    parse_conditions, AlertRule, AlertStatus, BuzzerMode, EscalationPolicy, Readings,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::{debug, info, warn};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS measurements (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        temperature REAL,
        ph REAL,
        tds REAL,
        turbidity REAL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        location TEXT,
        status TEXT NOT NULL DEFAULT 'Active'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        full_name TEXT NOT NULL,
        phone_number TEXT,
        status TEXT DEFAULT 'Active'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notification_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS group_members (
        group_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        PRIMARY KEY (group_id, user_id),
        FOREIGN KEY (group_id) REFERENCES notification_groups (id) ON DELETE CASCADE,
        FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS escalation_policies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        path TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alert_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        conditions TEXT NOT NULL,
        notification_group_id INTEGER,
        escalation_policy_id INTEGER,
        enabled INTEGER NOT NULL DEFAULT 1,
        activate_buzzer INTEGER NOT NULL DEFAULT 0,
        buzzer_duration_seconds INTEGER NOT NULL DEFAULT 0,
        buzzer_mode TEXT NOT NULL DEFAULT 'once',
        snoozed_until TEXT,
        FOREIGN KEY (notification_group_id) REFERENCES notification_groups (id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alert_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        rule_id INTEGER NOT NULL,
        details TEXT,
        status TEXT NOT NULL,
        acknowledged_by_user_id INTEGER,
        acknowledged_timestamp TEXT,
        FOREIGN KEY (rule_id) REFERENCES alert_rules (id),
        FOREIGN KEY (acknowledged_by_user_id) REFERENCES users (id)
    )
    "#,
];

/// Alert store on a SQLite pool
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database file at `path`
    pub async fn connect(path: &str, max_connections: u32) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("SQLite: {}", path);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&format!("sqlite:{}?mode=rwc", path))
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Private in-memory database; a single connection keeps it alive
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the tables this service uses if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Alert schema ready");
        Ok(())
    }
}

fn hydrate_rule(row: &SqliteRow) -> Result<AlertRule> {
    let conditions: String = row.try_get("conditions")?;
    let snoozed_until: Option<String> = row.try_get("snoozed_until")?;
    let duration: i64 = row.try_get("buzzer_duration_seconds")?;
    let mode: String = row.try_get("buzzer_mode")?;

    Ok(AlertRule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        conditions: parse_conditions(&conditions)?,
        notification_group_id: row.try_get("notification_group_id")?,
        escalation_policy_id: row.try_get("escalation_policy_id")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        activate_buzzer: row.try_get::<i64, _>("activate_buzzer")? != 0,
        buzzer_mode: BuzzerMode::parse_lossy(&mode),
        buzzer_duration_secs: duration.max(0) as u64,
        snoozed_until: snoozed_until.as_deref().and_then(parse_timestamp),
    })
}

fn hydrate_history(row: &SqliteRow) -> Result<AlertHistoryRecord> {
    let timestamp: String = row.try_get("timestamp")?;
    let status: String = row.try_get("status")?;
    let acknowledged_at: Option<String> = row.try_get("acknowledged_timestamp")?;

    Ok(AlertHistoryRecord {
        id: row.try_get("id")?,
        timestamp: parse_timestamp(&timestamp).unwrap_or_default(),
        rule_id: row.try_get("rule_id")?,
        details: row
            .try_get::<Option<String>, _>("details")?
            .unwrap_or_default(),
        status: status.parse()?,
        acknowledged_by: row.try_get("acknowledged_by_user_id")?,
        acknowledged_at: acknowledged_at.as_deref().and_then(parse_timestamp),
    })
}

#[async_trait]
impl AlertStore for SqliteStore {
    async fn active_rules(&self, now: NaiveDateTime) -> Result<Vec<AlertRule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, conditions, notification_group_id, escalation_policy_id,
                   enabled, activate_buzzer, buzzer_duration_seconds, buzzer_mode,
                   snoozed_until
            FROM alert_rules
            WHERE enabled = 1 AND (snoozed_until IS NULL OR snoozed_until < ?)
            ORDER BY id ASC
            "#,
        )
        .bind(format_timestamp(now))
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            match hydrate_rule(row) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    let id: i64 = row.try_get("id").unwrap_or_default();
                    warn!(rule_id = id, "Skipping invalid alert rule: {}", e);
                },
            }
        }
        Ok(rules)
    }

    async fn open_alert(&self, rule_id: i64, details: &str) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO alert_history (timestamp, rule_id, details, status)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(format_timestamp(local_now()))
        .bind(rule_id)
        .bind(details)
        .bind(AlertStatus::Triggered.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn resolve_alert(&self, history_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE alert_history
            SET status = 'Resolved'
            WHERE id = ? AND status IN ('Triggered', 'Acknowledged')
            "#,
        )
        .bind(history_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn alert_status(&self, history_id: i64) -> Result<Option<AlertStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM alert_history WHERE id = ?")
                .bind(history_id)
                .fetch_optional(&self.pool)
                .await?;

        match status {
            Some(s) => Ok(Some(s.parse()?)),
            None => Ok(None),
        }
    }

    async fn history_record(&self, history_id: i64) -> Result<Option<AlertHistoryRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, timestamp, rule_id, details, status,
                   acknowledged_by_user_id, acknowledged_timestamp
            FROM alert_history
            WHERE id = ?
            "#,
        )
        .bind(history_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(hydrate_history).transpose()
    }

    async fn acknowledge_alert(&self, history_id: i64, user_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE alert_history
            SET status = 'Acknowledged',
                acknowledged_by_user_id = ?,
                acknowledged_timestamp = ?
            WHERE id = ? AND status = 'Triggered'
            "#,
        )
        .bind(user_id)
        .bind(format_timestamp(local_now()))
        .bind(history_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn snooze_rule(&self, rule_id: i64, minutes: i64) -> Result<bool> {
        let until = local_now() + chrono::Duration::minutes(minutes);
        let result = sqlx::query("UPDATE alert_rules SET snoozed_until = ? WHERE id = ?")
            .bind(format_timestamp(until))
            .bind(rule_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn escalation_policy(&self, policy_id: i64) -> Result<Option<EscalationPolicy>> {
        let row = sqlx::query("SELECT id, name, path FROM escalation_policies WHERE id = ?")
            .bind(policy_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let id: i64 = row.try_get("id")?;
                let name: String = row.try_get("name")?;
                let path: String = row.try_get("path")?;
                Ok(Some(EscalationPolicy::from_json_path(id, name, &path)?))
            },
            None => Ok(None),
        }
    }

    async fn group_phone_numbers(&self, group_id: i64) -> Result<Vec<String>> {
        let numbers: Vec<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT u.phone_number
            FROM users u
            JOIN group_members gm ON u.id = gm.user_id
            WHERE gm.group_id = ?
            ORDER BY u.id ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(numbers
            .into_iter()
            .flatten()
            .filter(|n| is_valid_phone_number(n))
            .collect())
    }

    async fn device_info(&self, device_id: &str) -> Result<Option<DeviceInfo>> {
        let row = sqlx::query("SELECT id, name, location FROM devices WHERE id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(DeviceInfo {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                location: row.try_get("location")?,
            })),
            None => Ok(None),
        }
    }

    async fn latest_measurement(&self) -> Result<Option<Measurement>> {
        let row = sqlx::query(
            r#"
            SELECT id, temperature, ph, tds, turbidity
            FROM measurements
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut readings = Readings::new();
        for column in ["temperature", "ph", "tds", "turbidity"] {
            if let Some(value) = row.try_get::<Option<f64>, _>(column)? {
                readings.insert(column, value);
            }
        }
        Ok(Some(Measurement {
            id: row.try_get("id")?,
            readings,
        }))
    }
}
