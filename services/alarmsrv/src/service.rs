//! Service runner
//!
//! `AlarmEngine` wires the store, SMS sender and optional buzzer into the
//! dispatcher, escalation scheduler and lifecycle manager, then evaluates the
//! latest measurement on a fixed interval until cancelled.

use crate::buzzer::LocalAlarmController;
use crate::config::AlarmConfig;
use crate::dispatcher::{DisabledSmsSender, DispatchSettings, NotificationDispatcher};
use crate::error::Result;
use crate::escalation::EscalationScheduler;
use crate::events::EventBus;
use crate::lifecycle::AlertLifecycleManager;
use crate::store::{AlertStore, SqliteStore};
use aqua_io::{GpioDriver, ModemTransport, SmsSender, SysfsGpioDriver};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for the dispatcher worker after cancellation
const DISPATCHER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AlarmEngine {
    store: Arc<dyn AlertStore>,
    dispatcher: Arc<NotificationDispatcher>,
    escalation: Arc<EscalationScheduler>,
    lifecycle: Arc<AlertLifecycleManager>,
    buzzer: Option<Arc<LocalAlarmController>>,
    events: EventBus,
    poll_interval: Duration,
    /// Id of the last measurement row that completed an evaluation cycle
    last_measurement: Mutex<Option<i64>>,
    cancel: CancellationToken,
}

impl AlarmEngine {
    pub fn new(
        config: &AlarmConfig,
        store: Arc<dyn AlertStore>,
        sender: Arc<dyn SmsSender>,
        buzzer: Option<Arc<LocalAlarmController>>,
        cancel: CancellationToken,
    ) -> Self {
        let settings = DispatchSettings {
            device_id: config.device_id.clone(),
            product_name: config.product_name.clone(),
            queue_capacity: config.dispatch.queue_capacity,
            send_interval: Duration::from_secs(config.dispatch.send_interval_secs),
        };
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::clone(&store),
            sender,
            settings,
        ));
        let escalation = Arc::new(EscalationScheduler::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            cancel.clone(),
        ));
        let events = EventBus::default();

        let mut lifecycle = AlertLifecycleManager::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&escalation),
            events.clone(),
            Duration::from_secs(config.lifecycle.throttle_secs),
        );
        if let Some(buzzer) = &buzzer {
            lifecycle = lifecycle.with_buzzer(Arc::clone(buzzer));
        }

        Self {
            store,
            dispatcher,
            escalation,
            lifecycle: Arc::new(lifecycle),
            buzzer,
            events,
            poll_interval: Duration::from_secs(config.poll.interval_secs.max(1)),
            last_measurement: Mutex::new(None),
            cancel,
        }
    }

    pub fn lifecycle(&self) -> &Arc<AlertLifecycleManager> {
        &self.lifecycle
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn escalation(&self) -> &Arc<EscalationScheduler> {
        &self.escalation
    }

    /// Alert events for UI consumers
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Evaluate the newest measurement if it has not been evaluated yet.
    /// Returns false when there was no new measurement.
    pub async fn poll_once(&self) -> Result<bool> {
        let Some(measurement) = self.store.latest_measurement().await? else {
            return Ok(false);
        };
        if *self.last_measurement.lock() == Some(measurement.id) {
            return Ok(false);
        }
        if measurement.readings.is_empty() {
            *self.last_measurement.lock() = Some(measurement.id);
            return Ok(false);
        }

        self.lifecycle.evaluate_cycle(&measurement.readings).await?;
        *self.last_measurement.lock() = Some(measurement.id);
        Ok(true)
    }

    /// Run until the cancellation token fires
    pub async fn run(&self) -> Result<()> {
        info!("Starting alarm engine (poll every {:?})", self.poll_interval);
        let dispatcher = self.dispatcher.start(self.cancel.clone());

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(true) => {},
                        Ok(false) => debug!("No new measurement to evaluate"),
                        Err(e) => error!("Evaluation cycle failed: {}", e),
                    }
                }
            }
        }

        info!("Alarm engine stopping");
        if let Some(buzzer) = &self.buzzer {
            buzzer.shutdown().await;
        }
        match tokio::time::timeout(DISPATCHER_STOP_TIMEOUT, dispatcher).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!("SMS dispatcher task ended abnormally: {}", e),
            Err(_) => warn!(
                "SMS dispatcher did not stop within {:?}, abandoning it",
                DISPATCHER_STOP_TIMEOUT
            ),
        }
        info!(
            pending_sms = self.dispatcher.pending_len(),
            escalations = self.escalation.active_count(),
            "Alarm engine stopped"
        );
        Ok(())
    }
}

/// Set up the buzzer, or run without one when disabled or unavailable
fn open_buzzer(config: &AlarmConfig) -> Option<Arc<LocalAlarmController>> {
    if !config.buzzer.enabled {
        info!("Buzzer disabled by configuration");
        return None;
    }
    let driver: Arc<dyn GpioDriver> = Arc::new(SysfsGpioDriver::new(&config.buzzer.gpio_base_path));
    if !driver.is_available() {
        warn!(
            "GPIO not available at {}, running without buzzer",
            config.buzzer.gpio_base_path
        );
        return None;
    }

    let controller = LocalAlarmController::new(driver, config.buzzer.gpio_pin, config.buzzer.pause());
    match controller.setup() {
        Ok(()) => Some(Arc::new(controller)),
        Err(e) => {
            warn!("Buzzer setup failed, running without buzzer: {}", e);
            None
        },
    }
}

/// Open the database, hardware and engine, then run until `cancel` fires
pub async fn run(config: AlarmConfig, cancel: CancellationToken) -> Result<()> {
    info!("Starting AlarmSrv for device {}", config.device_id);

    let store = SqliteStore::connect(&config.database.path, config.database.max_connections).await?;
    store.migrate().await?;
    let store: Arc<dyn AlertStore> = Arc::new(store);

    let modem = if config.modem.enabled {
        // opening includes the modem warm-up delay
        let opened = tokio::select! {
            opened = ModemTransport::open(&config.modem) => opened,
            _ = cancel.cancelled() => {
                info!("Shutdown requested while opening modem");
                return Ok(());
            }
        };
        match opened {
            Ok(modem) => Some(Arc::new(modem)),
            Err(e) => {
                warn!("Modem unavailable, SMS disabled: {}", e);
                None
            },
        }
    } else {
        info!("Modem disabled by configuration");
        None
    };
    let sender: Arc<dyn SmsSender> = match &modem {
        Some(modem) => Arc::clone(modem) as Arc<dyn SmsSender>,
        None => Arc::new(DisabledSmsSender),
    };

    let buzzer = open_buzzer(&config);
    let engine = AlarmEngine::new(&config, store, sender, buzzer, cancel);
    engine.run().await?;

    if let Some(modem) = modem {
        modem.close().await;
    }
    info!("AlarmSrv stopped");
    Ok(())
}
