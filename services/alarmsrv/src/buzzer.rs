//! Local audible alarm
//!
//! Owns the buzzer GPIO pin. `reconcile` is called once per evaluation cycle
//! with the triggered rules and picks the most severe one:
//! - repeating mode: `duration` on, `pause` off, until stopped; an already
//!   running repeating pattern is left alone
//! - once mode: a single `duration` pulse when that rule's alert was opened
//!   in this cycle
//!
//! With nothing triggered (or a winner without a buzzer) the pin is driven low.

use aqua_io::{Direction, GpioDriver};
use aqua_rules::{AlertRule, BuzzerMode};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long `shutdown` waits for the pattern task to finish
const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Pulse,
    Repeating,
}

struct ActivePattern {
    kind: PatternKind,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl ActivePattern {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

pub struct LocalAlarmController {
    driver: Arc<dyn GpioDriver>,
    pin: u32,
    pause: Duration,
    active: Mutex<Option<ActivePattern>>,
}

impl LocalAlarmController {
    pub fn new(driver: Arc<dyn GpioDriver>, pin: u32, pause: Duration) -> Self {
        Self {
            driver,
            pin,
            pause,
            active: Mutex::new(None),
        }
    }

    /// Configure the pin as an output and drive it low
    pub fn setup(&self) -> Result<(), aqua_io::GpioError> {
        self.driver.setup(self.pin, Direction::Out)?;
        self.driver.write(self.pin, false)?;
        info!("Buzzer ready on GPIO {}", self.pin);
        Ok(())
    }

    /// Pattern currently sounding, if any
    pub fn current_pattern(&self) -> Option<PatternKind> {
        self.active
            .lock()
            .as_ref()
            .filter(|p| p.is_running())
            .map(|p| p.kind)
    }

    /// Bring the buzzer in line with the currently triggered rules
    pub fn reconcile(&self, triggered: &[&AlertRule], newly_opened: &HashSet<i64>) {
        let Some(winner) = triggered.iter().max_by_key(|r| r.buzzer_severity()) else {
            self.stop();
            return;
        };

        if !winner.activate_buzzer || winner.buzzer_duration_secs == 0 {
            self.stop();
            return;
        }

        let on = Duration::from_secs(winner.buzzer_duration_secs);
        let mut active = self.active.lock();
        let current = active.as_ref().filter(|p| p.is_running()).map(|p| p.kind);

        match winner.buzzer_mode {
            BuzzerMode::Repeating => {
                if current == Some(PatternKind::Repeating) {
                    return;
                }
                self.replace(&mut active, PatternKind::Repeating, on);
                info!(rule_id = winner.id, "Repeating buzzer started ({:?} on)", on);
            },
            BuzzerMode::Once => {
                if current == Some(PatternKind::Repeating) {
                    // left over from a rule that has cleared
                    self.halt(&mut active);
                }
                if newly_opened.contains(&winner.id) && current != Some(PatternKind::Pulse) {
                    self.replace(&mut active, PatternKind::Pulse, on);
                    info!(rule_id = winner.id, "Buzzer pulse ({:?})", on);
                }
            },
        }
    }

    /// Stop any pattern and drive the pin low; safe to call when idle
    pub fn stop(&self) {
        let mut active = self.active.lock();
        self.halt(&mut active);
    }

    /// Stop, wait briefly for the pattern task, and release the pin
    pub async fn shutdown(&self) {
        let pattern = self.active.lock().take();
        if let Some(pattern) = pattern {
            pattern.stop.cancel();
            if tokio::time::timeout(STOP_GRACE, pattern.handle).await.is_err() {
                warn!("Buzzer task did not stop in time");
            }
        }
        self.drive_low();
        if let Err(e) = self.driver.release(self.pin) {
            debug!("Failed to release buzzer GPIO: {}", e);
        }
    }

    fn halt(&self, active: &mut Option<ActivePattern>) {
        if let Some(pattern) = active.take() {
            pattern.stop.cancel();
            debug!("Buzzer pattern stopped");
        }
        self.drive_low();
    }

    fn replace(&self, active: &mut Option<ActivePattern>, kind: PatternKind, on: Duration) {
        if active.is_some() {
            self.halt(active);
        }
        let stop = CancellationToken::new();
        let handle = tokio::spawn(buzz(
            Arc::clone(&self.driver),
            self.pin,
            on,
            self.pause,
            kind == PatternKind::Repeating,
            stop.clone(),
        ));
        *active = Some(ActivePattern { kind, stop, handle });
    }

    fn drive_low(&self) {
        if let Err(e) = self.driver.write(self.pin, false) {
            warn!("Failed to silence buzzer: {}", e);
        }
    }
}

async fn buzz(
    driver: Arc<dyn GpioDriver>,
    pin: u32,
    on: Duration,
    pause: Duration,
    repeat: bool,
    stop: CancellationToken,
) {
    loop {
        if stop.is_cancelled() {
            return;
        }
        if let Err(e) = driver.write(pin, true) {
            warn!("Buzzer write failed: {}", e);
        }
        let stopped = tokio::select! {
            _ = tokio::time::sleep(on) => false,
            _ = stop.cancelled() => true,
        };
        if let Err(e) = driver.write(pin, false) {
            warn!("Buzzer write failed: {}", e);
        }
        if stopped || !repeat {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(pause) => {},
            _ = stop.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqua_io::MemoryGpioDriver;
    use aqua_rules::{Condition, Operator};

    const PIN: u32 = 17;

    fn rule(id: i64, mode: BuzzerMode, duration: u64) -> AlertRule {
        AlertRule::new(id, format!("rule-{}", id), vec![Condition::new("ph", Operator::Lt, 4.0)])
            .with_buzzer(mode, duration)
    }

    fn controller() -> (LocalAlarmController, Arc<MemoryGpioDriver>) {
        let driver = Arc::new(MemoryGpioDriver::new());
        let controller = LocalAlarmController::new(driver.clone(), PIN, Duration::from_secs(1));
        controller.setup().unwrap();
        (controller, driver)
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_pattern_timing() {
        let (controller, driver) = controller();
        let repeating = rule(1, BuzzerMode::Repeating, 5);
        let start = tokio::time::Instant::now();
        let setup_writes = driver.writes().len();

        controller.reconcile(&[&repeating], &HashSet::from([1]));
        tokio::time::sleep(Duration::from_millis(12_500)).await;

        let writes: Vec<(u64, bool)> = driver
            .writes()
            .into_iter()
            .skip(setup_writes)
            .map(|(at, _, level)| ((at - start).as_millis() as u64, level))
            .collect();
        assert_eq!(
            writes,
            vec![
                (0, true),
                (5_000, false),
                (6_000, true),
                (11_000, false),
                (12_000, true),
            ]
        );

        controller.reconcile(&[], &HashSet::new());
        assert!(!driver.level(PIN));
        assert_eq!(controller.current_pattern(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_repeating_pattern_not_restarted() {
        let (controller, driver) = controller();
        let repeating = rule(1, BuzzerMode::Repeating, 5);

        controller.reconcile(&[&repeating], &HashSet::from([1]));
        tokio::time::sleep(Duration::from_secs(2)).await;
        controller.reconcile(&[&repeating], &HashSet::new());
        tokio::time::sleep(Duration::from_secs(1)).await;

        // one rising edge only; a restart would have written low then high again
        let highs = driver.writes().iter().filter(|(_, _, level)| *level).count();
        assert_eq!(highs, 1);
        assert_eq!(controller.current_pattern(), Some(PatternKind::Repeating));
        controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_mode_single_pulse_for_new_alert() {
        let (controller, driver) = controller();
        let once = rule(2, BuzzerMode::Once, 3);

        controller.reconcile(&[&once], &HashSet::from([2]));
        assert_eq!(controller.current_pattern(), Some(PatternKind::Pulse));
        tokio::time::sleep(Duration::from_secs(10)).await;

        // still triggered but not new: no second pulse
        controller.reconcile(&[&once], &HashSet::new());
        tokio::time::sleep(Duration::from_secs(10)).await;

        let highs = driver.writes().iter().filter(|(_, _, level)| *level).count();
        assert_eq!(highs, 1);
        assert!(!driver.level(PIN));
    }

    #[tokio::test(start_paused = true)]
    async fn test_most_severe_rule_wins() {
        let (controller, _driver) = controller();
        let long_once = rule(1, BuzzerMode::Once, 30);
        let short_repeating = rule(2, BuzzerMode::Repeating, 2);
        let silent = AlertRule::new(3, "silent", vec![]);

        controller.reconcile(&[&silent, &long_once, &short_repeating], &HashSet::from([1, 2]));
        assert_eq!(controller.current_pattern(), Some(PatternKind::Repeating));
        controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_winner_without_buzzer_silences() {
        let (controller, driver) = controller();
        let repeating = rule(1, BuzzerMode::Repeating, 5);
        let silent = AlertRule::new(3, "silent", vec![]);

        controller.reconcile(&[&repeating], &HashSet::from([1]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(driver.level(PIN));

        controller.reconcile(&[&silent], &HashSet::new());
        assert!(!driver.level(PIN));
        assert_eq!(controller.current_pattern(), None);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_safe() {
        let (controller, driver) = controller();
        controller.stop();
        controller.stop();
        assert!(!driver.level(PIN));
        controller.shutdown().await;
    }
}
