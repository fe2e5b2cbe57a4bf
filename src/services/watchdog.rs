use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tokio::time::Instant;

use crate::config::WatchdogConfig;
use crate::events::UnitEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Starting,
    Running,
    Degraded,
    Restarting,
    Failed,
    /// Telemetry paused while the firmware updater owns the link.
    Suspended,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitState::Starting => "starting",
            UnitState::Running => "running",
            UnitState::Degraded => "degraded",
            UnitState::Restarting => "restarting",
            UnitState::Failed => "failed",
            UnitState::Suspended => "suspended",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogInput {
    Heartbeat,
    Tick,
    /// The unit task was (re)spawned after a restart or resume.
    Relaunched,
    /// The unit task ended on its own, by error or panic.
    Exited,
    LeaseHeld,
    LeaseReleased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Fatal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogAction {
    Restart {
        unit: String,
    },
    Suspend {
        unit: String,
    },
    Resume {
        unit: String,
    },
    Alert {
        unit: String,
        severity: AlertSeverity,
        message: String,
        last_good: Option<DateTime<Utc>>,
        failed_restarts: u32,
    },
    PowerCycleHint {
        unit: String,
    },
}

/// Supervision state of one acquisition unit.
///
/// `handle` is a pure transition function: the caller supplies the clock
/// and carries out the returned actions.
#[derive(Debug, Clone)]
pub struct Supervision {
    unit: String,
    config: WatchdogConfig,
    state: UnitState,
    entered_at: Instant,
    last_heartbeat: Option<Instant>,
    last_good: Option<DateTime<Utc>>,
    /// A restart was issued and the unit has not reached running since.
    restart_pending: bool,
    failed_restarts: VecDeque<Instant>,
}

impl Supervision {
    pub fn new(unit: &str, config: WatchdogConfig, now: Instant) -> Self {
        Self {
            unit: unit.to_string(),
            config,
            state: UnitState::Starting,
            entered_at: now,
            last_heartbeat: None,
            last_good: None,
            restart_pending: false,
            failed_restarts: VecDeque::new(),
        }
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn last_good(&self) -> Option<DateTime<Utc>> {
        self.last_good
    }

    pub fn failed_restarts(&self) -> u32 {
        self.failed_restarts.len() as u32
    }

    fn enter(&mut self, state: UnitState, now: Instant) {
        self.state = state;
        self.entered_at = now;
    }

    fn prune(&mut self, now: Instant) {
        let window = self.config.restart_window();
        while let Some(oldest) = self.failed_restarts.front() {
            if now.duration_since(*oldest) > window {
                self.failed_restarts.pop_front();
            } else {
                break;
            }
        }
    }

    fn alert(&self, severity: AlertSeverity, message: String) -> WatchdogAction {
        WatchdogAction::Alert {
            unit: self.unit.clone(),
            severity,
            message,
            last_good: self.last_good,
            failed_restarts: self.failed_restarts.len() as u32,
        }
    }

    /// Restarts the unit unless it already used up its failed restarts
    /// within the window, in which case it is marked failed for good.
    fn restart_or_fail(&mut self, now: Instant, reason: String) -> Vec<WatchdogAction> {
        self.prune(now);
        if self.failed_restarts.len() as u32 >= self.config.max_failed_restarts {
            self.enter(UnitState::Failed, now);
            vec![
                self.alert(
                    AlertSeverity::Fatal,
                    format!(
                        "{} restarts within {:?} did not bring the unit back",
                        self.failed_restarts.len(),
                        self.config.restart_window()
                    ),
                ),
                WatchdogAction::PowerCycleHint { unit: self.unit.clone() },
            ]
        } else {
            self.restart_pending = true;
            self.enter(UnitState::Restarting, now);
            vec![
                self.alert(AlertSeverity::Warning, format!("{}, restarting", reason)),
                WatchdogAction::Restart { unit: self.unit.clone() },
            ]
        }
    }

    pub fn handle(&mut self, input: WatchdogInput, now: Instant, wall: DateTime<Utc>) -> Vec<WatchdogAction> {
        let mut actions = Vec::new();
        let window = self.config.heartbeat_window();

        match (self.state, input) {
            (UnitState::Suspended, WatchdogInput::LeaseReleased) => {
                self.restart_pending = false;
                self.failed_restarts.clear();
                self.enter(UnitState::Restarting, now);
                actions.push(WatchdogAction::Resume { unit: self.unit.clone() });
            }
            (UnitState::Suspended, _) => {}
            (_, WatchdogInput::LeaseHeld) => {
                self.enter(UnitState::Suspended, now);
                actions.push(WatchdogAction::Suspend { unit: self.unit.clone() });
            }
            (_, WatchdogInput::LeaseReleased) => {}

            (UnitState::Restarting, WatchdogInput::Relaunched) => {
                self.enter(UnitState::Starting, now);
            }
            (_, WatchdogInput::Relaunched) => {}

            (UnitState::Restarting, WatchdogInput::Exited) | (UnitState::Failed, WatchdogInput::Exited) => {}
            (_, WatchdogInput::Exited) => {
                if self.restart_pending {
                    self.restart_pending = false;
                    self.failed_restarts.push_back(now);
                }
                actions.extend(self.restart_or_fail(now, "task exited".to_string()));
            }

            (UnitState::Restarting, WatchdogInput::Heartbeat) => {}
            (state, WatchdogInput::Heartbeat) => {
                self.last_heartbeat = Some(now);
                self.last_good = Some(wall);
                if state != UnitState::Running {
                    if state == UnitState::Failed {
                        actions.push(self.alert(AlertSeverity::Warning, "recovered without restart".to_string()));
                    }
                    self.restart_pending = false;
                    self.failed_restarts.clear();
                    self.enter(UnitState::Running, now);
                }
            }

            (UnitState::Starting, WatchdogInput::Tick) => {
                if now.duration_since(self.entered_at) >= window {
                    if self.restart_pending {
                        self.restart_pending = false;
                        self.failed_restarts.push_back(now);
                    }
                    self.enter(UnitState::Degraded, now);
                    actions.push(self.alert(
                        AlertSeverity::Warning,
                        format!("no heartbeat within {:?} of start", window),
                    ));
                }
            }
            (UnitState::Running, WatchdogInput::Tick) => {
                let silent_since = self.last_heartbeat.unwrap_or(self.entered_at);
                if now.duration_since(silent_since) >= window {
                    self.enter(UnitState::Degraded, now);
                    actions.push(self.alert(
                        AlertSeverity::Warning,
                        format!("no heartbeat for {:?}", window),
                    ));
                }
            }
            (UnitState::Degraded, WatchdogInput::Tick) => {
                if now.duration_since(self.entered_at) >= self.config.grace_period() {
                    actions.extend(self.restart_or_fail(now, format!("silent for {:?}", window)));
                }
            }
            (UnitState::Restarting, WatchdogInput::Tick) | (UnitState::Failed, WatchdogInput::Tick) => {}
        }

        actions
    }
}

/// Supervision of every acquisition unit.
pub struct Watchdog {
    config: WatchdogConfig,
    units: HashMap<String, Supervision>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            units: HashMap::new(),
        }
    }

    pub fn register(&mut self, unit: &str, now: Instant) {
        self.units
            .insert(unit.to_string(), Supervision::new(unit, self.config.clone(), now));
    }

    pub fn state(&self, unit: &str) -> Option<UnitState> {
        self.units.get(unit).map(Supervision::state)
    }

    pub fn handle(&mut self, unit: &str, input: WatchdogInput, now: Instant, wall: DateTime<Utc>) -> Vec<WatchdogAction> {
        match self.units.get_mut(unit) {
            Some(supervision) => supervision.handle(input, now, wall),
            None => Vec::new(),
        }
    }

    /// Feeds a unit event. Only heartbeats move the state machine.
    pub fn observe(&mut self, event: &UnitEvent, now: Instant, wall: DateTime<Utc>) -> Vec<WatchdogAction> {
        if event.is_heartbeat() {
            self.handle(event.unit(), WatchdogInput::Heartbeat, now, wall)
        } else {
            Vec::new()
        }
    }

    pub fn tick(&mut self, now: Instant, wall: DateTime<Utc>) -> Vec<WatchdogAction> {
        let mut names: Vec<String> = self.units.keys().cloned().collect();
        names.sort();
        names
            .iter()
            .flat_map(|name| self.handle(name, WatchdogInput::Tick, now, wall))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            heartbeat_window_secs: 60,
            grace_period_secs: 30,
            max_failed_restarts: 3,
            restart_window_secs: 900,
            ..WatchdogConfig::default()
        }
    }

    /// Ticks once a second until an action shows up or `limit` passes.
    fn tick_until_action(
        sup: &mut Supervision,
        now: &mut Instant,
        limit: Duration,
    ) -> Vec<WatchdogAction> {
        let end = *now + limit;
        while *now < end {
            *now += Duration::from_secs(1);
            let actions = sup.handle(WatchdogInput::Tick, *now, Utc::now());
            if !actions.is_empty() {
                return actions;
            }
        }
        Vec::new()
    }

    fn is_restart(actions: &[WatchdogAction]) -> bool {
        actions.iter().any(|a| matches!(a, WatchdogAction::Restart { .. }))
    }

    #[test]
    fn silent_unit_is_restarted_within_window_plus_grace() {
        let mut now = Instant::now();
        let mut sup = Supervision::new("meter", config(), now);
        sup.handle(WatchdogInput::Heartbeat, now, Utc::now());
        assert_eq!(sup.state(), UnitState::Running);

        let started = now;
        let degraded = tick_until_action(&mut sup, &mut now, Duration::from_secs(120));
        assert!(matches!(
            degraded[0],
            WatchdogAction::Alert {
                severity: AlertSeverity::Warning,
                ..
            }
        ));
        assert_eq!(sup.state(), UnitState::Degraded);

        let restart = tick_until_action(&mut sup, &mut now, Duration::from_secs(120));
        assert!(is_restart(&restart));
        assert!(now.duration_since(started) <= Duration::from_secs(60 + 30 + 1));
        assert_eq!(sup.state(), UnitState::Restarting);
    }

    #[test]
    fn heartbeat_during_grace_cancels_restart() {
        let mut now = Instant::now();
        let mut sup = Supervision::new("meter", config(), now);
        sup.handle(WatchdogInput::Heartbeat, now, Utc::now());
        tick_until_action(&mut sup, &mut now, Duration::from_secs(120));
        assert_eq!(sup.state(), UnitState::Degraded);

        now += Duration::from_secs(10);
        sup.handle(WatchdogInput::Heartbeat, now, Utc::now());
        assert_eq!(sup.state(), UnitState::Running);
        assert!(tick_until_action(&mut sup, &mut now, Duration::from_secs(50)).is_empty());
    }

    #[test]
    fn fails_after_exactly_k_failed_restarts() {
        let mut now = Instant::now();
        let mut sup = Supervision::new("meter", config(), now);
        sup.handle(WatchdogInput::Heartbeat, now, Utc::now());
        let last_good = sup.last_good();

        let mut restarts = 0;
        loop {
            let actions = tick_until_action(&mut sup, &mut now, Duration::from_secs(200));
            assert!(!actions.is_empty(), "watchdog went quiet in state {}", sup.state());
            if is_restart(&actions) {
                restarts += 1;
                sup.handle(WatchdogInput::Relaunched, now, Utc::now());
                continue;
            }
            if sup.state() == UnitState::Failed {
                assert!(actions.contains(&WatchdogAction::PowerCycleHint {
                    unit: "meter".to_string()
                }));
                match &actions[0] {
                    WatchdogAction::Alert {
                        severity,
                        last_good: reported,
                        failed_restarts,
                        ..
                    } => {
                        assert_eq!(*severity, AlertSeverity::Fatal);
                        assert_eq!(*reported, last_good);
                        assert_eq!(*failed_restarts, 3);
                    }
                    other => panic!("expected fatal alert, got {:?}", other),
                }
                break;
            }
        }

        assert_eq!(restarts, 3);
        assert!(tick_until_action(&mut sup, &mut now, Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn successful_restart_clears_failure_history() {
        let mut now = Instant::now();
        let mut sup = Supervision::new("meter", config(), now);

        for _ in 0..2 {
            // starting -> degraded -> restart, never heartbeating
            let mut actions = Vec::new();
            while !is_restart(&actions) {
                actions = tick_until_action(&mut sup, &mut now, Duration::from_secs(200));
            }
            sup.handle(WatchdogInput::Relaunched, now, Utc::now());
        }
        now += Duration::from_secs(70);
        sup.handle(WatchdogInput::Tick, now, Utc::now());
        assert_eq!(sup.failed_restarts(), 2);
        assert_eq!(sup.state(), UnitState::Degraded);

        sup.handle(WatchdogInput::Heartbeat, now, Utc::now());
        assert_eq!(sup.failed_restarts(), 0);
        assert_eq!(sup.state(), UnitState::Running);
    }

    #[test]
    fn silent_unit_reaches_failed_instead_of_looping() {
        let mut now = Instant::now();
        let mut sup = Supervision::new("module_m", config(), now);

        let mut restarts = 0;
        for _ in 0..10 {
            let actions = tick_until_action(&mut sup, &mut now, Duration::from_secs(200));
            if is_restart(&actions) {
                restarts += 1;
                sup.handle(WatchdogInput::Relaunched, now, Utc::now());
            }
            if sup.state() == UnitState::Failed {
                break;
            }
        }
        assert_eq!(sup.state(), UnitState::Failed);
        assert_eq!(sup.failed_restarts(), 3);
        assert_eq!(restarts, 3);
    }

    #[test]
    fn exited_task_restarts_without_waiting_for_silence() {
        let now = Instant::now();
        let mut sup = Supervision::new("meter", config(), now);
        sup.handle(WatchdogInput::Heartbeat, now, Utc::now());

        let actions = sup.handle(WatchdogInput::Exited, now, Utc::now());
        assert!(is_restart(&actions));
        assert_eq!(sup.state(), UnitState::Restarting);
        assert_eq!(sup.failed_restarts(), 0);

        // Exiting again before any heartbeat counts the restart as failed
        let mut at = now;
        for expected in 1..=3 {
            sup.handle(WatchdogInput::Relaunched, at, Utc::now());
            at += Duration::from_secs(1);
            let actions = sup.handle(WatchdogInput::Exited, at, Utc::now());
            assert_eq!(sup.failed_restarts(), expected);
            if expected < 3 {
                assert!(is_restart(&actions));
            } else {
                assert_eq!(sup.state(), UnitState::Failed);
                assert!(actions.contains(&WatchdogAction::PowerCycleHint {
                    unit: "meter".to_string()
                }));
            }
        }
    }

    #[test]
    fn lease_suspends_and_resumes() {
        let now = Instant::now();
        let mut sup = Supervision::new("module_m", config(), now);
        sup.handle(WatchdogInput::Heartbeat, now, Utc::now());

        let actions = sup.handle(WatchdogInput::LeaseHeld, now, Utc::now());
        assert_eq!(actions, vec![WatchdogAction::Suspend { unit: "module_m".to_string() }]);
        assert_eq!(sup.state(), UnitState::Suspended);

        // No restarts however long the update takes
        let later = now + Duration::from_secs(600);
        assert!(sup.handle(WatchdogInput::Tick, later, Utc::now()).is_empty());

        let actions = sup.handle(WatchdogInput::LeaseReleased, later, Utc::now());
        assert_eq!(actions, vec![WatchdogAction::Resume { unit: "module_m".to_string() }]);
        sup.handle(WatchdogInput::Relaunched, later, Utc::now());
        assert_eq!(sup.state(), UnitState::Starting);
    }

    #[test]
    fn watchdog_routes_heartbeats_by_unit() {
        let now = Instant::now();
        let mut watchdog = Watchdog::new(config());
        watchdog.register("meter", now);
        watchdog.register("module_m", now);

        let event = UnitEvent::SamplesProduced {
            unit: "meter".to_string(),
            count: 3,
            at: Utc::now(),
        };
        watchdog.observe(&event, now, Utc::now());
        assert_eq!(watchdog.state("meter"), Some(UnitState::Running));
        assert_eq!(watchdog.state("module_m"), Some(UnitState::Starting));
    }
}
