//! SMS body formatting

use aqua_rules::Readings;
use chrono::NaiveDateTime;

const UNKNOWN_LOCATION: &str = "Unknown Location";

/// Parameters listed in the readings line, in order, with their short labels
const READING_LABELS: [(&str, &str); 4] = [
    ("temperature", "Temp"),
    ("ph", "pH"),
    ("tds", "TDS"),
    ("turbidity", "Turb"),
];

const CALL_TO_ACTION: &str = "Action: Please check the system and acknowledge the alert.\n\
Gawin: Paki-check ang system at i-acknowledge ang alert.";

/// Turn a device location field into one line of text
///
/// A JSON object contributes its non-empty `coordinates`, `municipality` and
/// `province` (in that order); anything else is used verbatim.
pub fn format_location(location: Option<&str>) -> String {
    let Some(raw) = location.map(str::trim).filter(|s| !s.is_empty()) else {
        return UNKNOWN_LOCATION.to_string();
    };

    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => {
            let parts: Vec<String> = ["coordinates", "municipality", "province"]
                .iter()
                .filter_map(|key| match map.get(*key)? {
                    serde_json::Value::String(s) if !s.trim().is_empty() => {
                        Some(s.trim().to_string())
                    },
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect();
            if parts.is_empty() {
                UNKNOWN_LOCATION.to_string()
            } else {
                parts.join(", ")
            }
        },
        _ => raw.to_string(),
    }
}

/// `Readings: Temp:25.10 pH:3.20` for the parameters that are present
pub fn format_readings(readings: &Readings) -> String {
    let parts: Vec<String> = READING_LABELS
        .iter()
        .filter_map(|(key, label)| readings.get(key).map(|v| format!("{}:{:.2}", label, v)))
        .collect();
    format!("Readings: {}", parts.join(" "))
}

/// Full SMS body for an alert or escalation
pub fn build_alert_message(
    product: &str,
    rule_name: &str,
    readings: &Readings,
    location: Option<&str>,
    is_escalation: bool,
    at: NaiveDateTime,
) -> String {
    let kind = if is_escalation { "ESCALATION" } else { "ALERT" };
    [
        format!("{} {}: {}", product, kind, rule_name),
        format!("Time: {}", at.format("%Y-%m-%d %I:%M:%S %p")),
        format!("Location: {}", format_location(location)),
        format_readings(readings),
        CALL_TO_ACTION.to_string(),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(14, 5, 7)
            .unwrap()
    }

    #[test]
    fn test_full_message() {
        let readings = Readings::new()
            .with("ph", 3.2)
            .with("temperature", 25.0)
            .with("turbidity", 4.567);
        let body = build_alert_message(
            "AquaWatch",
            "Acidic water",
            &readings,
            Some(r#"{"coordinates": "14.6,121.0", "municipality": "Lucban", "province": "Quezon"}"#),
            false,
            at(),
        );

        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines[0], "AquaWatch ALERT: Acidic water");
        assert_eq!(lines[1], "Time: 2024-03-09 02:05:07 PM");
        assert_eq!(lines[2], "Location: 14.6,121.0, Lucban, Quezon");
        assert_eq!(lines[3], "Readings: Temp:25.00 pH:3.20 Turb:4.57");
        assert_eq!(
            lines[4],
            "Action: Please check the system and acknowledge the alert."
        );
        assert!(lines[5].starts_with("Gawin:"));
    }

    #[test]
    fn test_escalation_title() {
        let body = build_alert_message("AquaWatch", "High TDS", &Readings::new(), None, true, at());
        assert!(body.starts_with("AquaWatch ESCALATION: High TDS\n"));
        assert!(body.contains("\nReadings: \n"));
    }

    #[test]
    fn test_location_variants() {
        assert_eq!(format_location(None), "Unknown Location");
        assert_eq!(format_location(Some("  ")), "Unknown Location");
        assert_eq!(format_location(Some("Barangay 4 pump house")), "Barangay 4 pump house");
        assert_eq!(
            format_location(Some(r#"{"municipality": "Lucban", "province": ""}"#)),
            "Lucban"
        );
        assert_eq!(format_location(Some(r#"{"other": 1}"#)), "Unknown Location");
    }
}
