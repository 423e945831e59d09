//! AutoScaler — the periodic alarm evaluation loop.
//!
//! Every tick lists the stored alarms and runs the pipeline of each enabled
//! alarm concurrently:
//!
//! ```text
//! check ──false──▶ idle
//!   │true
//! should_wait ──true──▶ cooldown
//!   │false
//! for each action: ready? ──▶ open event ──▶ run (bounded) ──▶ close event
//! ```
//!
//! The pipeline of one alarm is serialized by a per-alarm async mutex; an
//! alarm whose previous pipeline is still running is skipped for the tick.
//! A failure in one alarm is logged and never affects the others.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use warden_expr::Evaluator;
use warden_state::{Alarm, Event, StateError, StateStore};

use crate::action::{Action, ActionContext, ActionError, ActionRegistry};
use crate::check::{CheckError, check};
use crate::clock::{Clock, SystemClock};
use crate::cooldown;
use crate::datasource::DataSource;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AutoScaleError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Check(#[from] CheckError),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("action {action:?} of alarm {alarm:?} is not registered")]
    UnknownAction { alarm: String, action: String },
}

/// Stage of the alarm pipeline an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Check,
    Cooldown,
    Dispatch,
    Record,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Check => "check",
            Phase::Cooldown => "cooldown",
            Phase::Dispatch => "dispatch",
            Phase::Record => "record",
        })
    }
}

/// What happened to one alarm during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum AlarmOutcome {
    Disabled,
    /// The previous pipeline of this alarm was still running.
    Busy,
    /// The condition did not hold.
    Idle,
    CooldownActive,
    /// Every action declined its precheck; nothing was recorded.
    NotReady,
    /// One closed event per action that ran.
    Fired(Vec<Event>),
    Failed { phase: Phase, error: String },
}

/// Outcomes of one tick, sorted by alarm name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub outcomes: Vec<(String, AlarmOutcome)>,
}

impl TickReport {
    pub fn outcome(&self, alarm: &str) -> Option<&AlarmOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == alarm)
            .map(|(_, outcome)| outcome)
    }

    /// Number of events recorded during the tick.
    pub fn fired(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                AlarmOutcome::Fired(events) => events.len(),
                _ => 0,
            })
            .sum()
    }
}

struct Inner {
    store: StateStore,
    datasource: Arc<dyn DataSource>,
    evaluator: Arc<dyn Evaluator>,
    actions: ActionRegistry,
    clock: Arc<dyn Clock>,
    action_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Drives alarm evaluation. Cheap to clone; clones share locks and collaborators.
#[derive(Clone)]
pub struct AutoScaler {
    inner: Arc<Inner>,
}

impl AutoScaler {
    pub fn new(
        store: StateStore,
        datasource: Arc<dyn DataSource>,
        evaluator: Arc<dyn Evaluator>,
        actions: ActionRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                datasource,
                evaluator,
                actions,
                clock: Arc::new(SystemClock),
                action_timeout: DEFAULT_ACTION_TIMEOUT,
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Replace the time source. Must be called before the scaler is cloned.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        self.rebuild(|inner| inner.clock = clock)
    }

    /// Bound every action run by `timeout`.
    pub fn with_action_timeout(self, timeout: Duration) -> Self {
        self.rebuild(|inner| inner.action_timeout = timeout)
    }

    fn rebuild(self, f: impl FnOnce(&mut Inner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                f(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(shared) => {
                warn!("autoscaler already shared, configuration change ignored");
                Self { inner: shared }
            }
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    /// Whether `alarm` is inside its cooldown window.
    pub fn should_wait(&self, alarm: &Alarm) -> Result<bool, AutoScaleError> {
        let latest = self.inner.store.latest_event_for_alarm(&alarm.name)?;
        Ok(cooldown::should_wait(
            latest.as_ref(),
            alarm.wait(),
            self.inner.clock.now_ms(),
        ))
    }

    /// Evaluate every stored alarm once.
    pub async fn tick(&self) -> Result<TickReport, AutoScaleError> {
        let alarms = self.inner.store.list_alarms()?;
        let listed: HashSet<String> = alarms.iter().map(|a| a.name.clone()).collect();
        let mut report = TickReport::default();
        let mut tasks = JoinSet::new();

        for alarm in alarms {
            if !alarm.enabled {
                debug!(alarm = %alarm.name, "alarm disabled, skipping");
                report.outcomes.push((alarm.name, AlarmOutcome::Disabled));
                continue;
            }
            let scaler = self.clone();
            tasks.spawn(async move {
                let name = alarm.name.clone();
                let outcome = scaler.process(alarm).await;
                (name, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => report.outcomes.push(entry),
                Err(e) => error!(error = %e, "alarm task panicked"),
            }
        }

        // Drop locks of alarms that are gone from the store.
        self.inner
            .locks
            .lock()
            .await
            .retain(|name, _| listed.contains(name));

        report.outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(alarms = report.outcomes.len(), fired = report.fired(), "tick finished");
        Ok(report)
    }

    /// Run ticks every `interval` until `shutdown` changes. The first tick
    /// runs immediately.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            action_timeout_secs = self.inner.action_timeout.as_secs(),
            "autoscaler started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "autoscaler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }

    async fn lock_for(&self, alarm: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.locks.lock().await;
        locks
            .entry(alarm.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn process(&self, alarm: Alarm) -> AlarmOutcome {
        let lock = self.lock_for(&alarm.name).await;
        let Ok(_guard) = lock.try_lock_owned() else {
            debug!(alarm = %alarm.name, "previous evaluation still running, skipping");
            return AlarmOutcome::Busy;
        };

        match self.pipeline(&alarm).await {
            Ok(outcome) => outcome,
            Err((phase, e)) => {
                error!(alarm = %alarm.name, instance = %alarm.instance, %phase, error = %e, "alarm evaluation failed");
                AlarmOutcome::Failed {
                    phase,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn pipeline(&self, alarm: &Alarm) -> Result<AlarmOutcome, (Phase, AutoScaleError)> {
        let inner = &self.inner;

        let fire = check(alarm, inner.datasource.as_ref(), inner.evaluator.as_ref())
            .await
            .map_err(|e| (Phase::Check, e.into()))?;
        if !fire {
            return Ok(AlarmOutcome::Idle);
        }

        if self.should_wait(alarm).map_err(|e| (Phase::Cooldown, e))? {
            debug!(alarm = %alarm.name, wait_secs = alarm.wait_secs, "cooldown active");
            return Ok(AlarmOutcome::CooldownActive);
        }

        let mut resolved: Vec<(&str, Arc<dyn Action>)> = Vec::with_capacity(alarm.actions.len());
        for name in &alarm.actions {
            let action = inner.actions.get(name).ok_or_else(|| {
                (
                    Phase::Dispatch,
                    AutoScaleError::UnknownAction {
                        alarm: alarm.name.clone(),
                        action: name.clone(),
                    },
                )
            })?;
            resolved.push((name, action));
        }

        let ctx = ActionContext::from(alarm);
        let mut events = Vec::new();
        for (name, action) in resolved {
            let ready = action
                .ready(&ctx)
                .await
                .map_err(|e| (Phase::Dispatch, e.into()))?;
            if !ready {
                debug!(alarm = %alarm.name, action = name, "action not ready, skipping");
                continue;
            }
            events.push(self.fire(alarm, name, action.as_ref(), &ctx).await?);
        }

        if events.is_empty() {
            Ok(AlarmOutcome::NotReady)
        } else {
            Ok(AlarmOutcome::Fired(events))
        }
    }

    async fn fire(
        &self,
        alarm: &Alarm,
        name: &str,
        action: &dyn Action,
        ctx: &ActionContext,
    ) -> Result<Event, (Phase, AutoScaleError)> {
        let inner = &self.inner;
        let record = |e: StateError| (Phase::Record, AutoScaleError::State(e));

        let mut event = Event::open(alarm, name, inner.clock.now_ms());
        inner.store.insert_event(&event).map_err(record)?;
        info!(alarm = %alarm.name, instance = %alarm.instance, action = name, event = %event.id, "firing action");

        let timeout = inner.action_timeout;
        let outcome = match tokio::time::timeout(timeout, action.run(ctx)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("action timed out after {timeout:?}")),
        };

        event.finish(inner.clock.now_ms(), outcome);
        inner.store.close_event(&event).map_err(record)?;

        if event.successful {
            info!(alarm = %alarm.name, action = name, event = %event.id, "action succeeded");
        } else {
            warn!(alarm = %alarm.name, action = name, event = %event.id, error = %event.error, "action failed");
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use warden_expr::ExprEngine;
    use warden_state::{DataSourceInstance, SCALE_DOWN, SCALE_UP};

    use crate::clock::ManualClock;
    use crate::datasource::{DataSourceError, StaticDataSource};
    use crate::scale::ScaleAction;
    use crate::scale::testing::FakeUnits;

    const T0: u64 = 1_700_000_000_000;

    /// Counts fetches; answers `{"id": "ble"}` for every datasource.
    #[derive(Default)]
    struct CountingDataSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl DataSource for CountingDataSource {
        async fn fetch(&self, _instance: &DataSourceInstance) -> Result<Value, DataSourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"id": "ble"}))
        }
    }

    /// Records runs; fails when `fail` is set; sleeps for `delay`.
    #[derive(Default)]
    struct RecordingAction {
        runs: AtomicUsize,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Action for RecordingAction {
        async fn run(&self, _ctx: &ActionContext) -> Result<(), ActionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                Err(ActionError::Failed("platform unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    fn alarm(name: &str, expression: &str, wait_secs: u64) -> Alarm {
        Alarm {
            name: name.into(),
            expression: expression.into(),
            enabled: true,
            data_sources: vec![DataSourceInstance::named("ds")],
            actions: vec![SCALE_UP.into()],
            instance: "api".into(),
            wait_secs,
            envs: BTreeMap::new(),
        }
    }

    struct Harness {
        store: StateStore,
        clock: ManualClock,
        datasource: Arc<CountingDataSource>,
        action: Arc<RecordingAction>,
        scaler: AutoScaler,
    }

    fn harness(action: RecordingAction) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::new(T0);
        let datasource = Arc::new(CountingDataSource::default());
        let action = Arc::new(action);
        let registry = ActionRegistry::new().with(SCALE_UP, action.clone());
        let scaler = AutoScaler::new(
            store.clone(),
            datasource.clone(),
            Arc::new(ExprEngine::new()),
            registry,
        )
        .with_clock(Arc::new(clock.clone()));
        Harness {
            store,
            clock,
            datasource,
            action,
            scaler,
        }
    }

    #[tokio::test]
    async fn true_condition_fires_and_records_event() {
        let h = harness(RecordingAction::default());
        h.store.insert_alarm(&alarm("name", r#"data.id == "ble""#, 0)).unwrap();

        let report = h.scaler.tick().await.unwrap();
        assert_eq!(report.fired(), 1);

        let events = h.store.events_for_alarm("name", 10).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.kind, SCALE_UP);
        assert_eq!(event.start_time, T0);
        assert_ne!(event.end_time, 0);
        assert!(event.successful);
        assert_eq!(event.error, "");
        assert_eq!(h.action.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn false_condition_is_idle() {
        let h = harness(RecordingAction::default());
        h.store.insert_alarm(&alarm("name", r#"data.id != "ble""#, 0)).unwrap();

        let report = h.scaler.tick().await.unwrap();
        assert_eq!(report.outcome("name"), Some(&AlarmOutcome::Idle));
        assert!(h.store.list_events().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_alarm_is_never_checked() {
        let h = harness(RecordingAction::default());
        let mut a = alarm("off", "true", 0);
        a.enabled = false;
        h.store.insert_alarm(&a).unwrap();

        for _ in 0..3 {
            let report = h.scaler.tick().await.unwrap();
            assert_eq!(report.outcome("off"), Some(&AlarmOutcome::Disabled));
        }
        assert_eq!(h.datasource.fetches.load(Ordering::SeqCst), 0);
        assert!(h.store.list_events().unwrap().is_empty());
    }

    #[tokio::test]
    async fn in_flight_event_blocks_firing() {
        let h = harness(RecordingAction::default());
        let a = alarm("rush", "true", 0);
        h.store.insert_alarm(&a).unwrap();
        h.store.insert_event(&Event::open(&a, SCALE_UP, T0 - 1_000)).unwrap();

        let report = h.scaler.tick().await.unwrap();
        assert_eq!(report.outcome("rush"), Some(&AlarmOutcome::CooldownActive));
        assert_eq!(h.store.events_for_alarm("rush", 10).unwrap().len(), 1);
        assert_eq!(h.action.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cooldown_boundary() {
        let h = harness(RecordingAction::default());
        let a = alarm("rush", "true", 300);
        h.store.insert_alarm(&a).unwrap();

        // Last event ended one minute ago.
        let mut previous = Event::open(&a, SCALE_UP, T0 - 120_000);
        previous.finish(T0 - 60_000, Ok(()));
        h.store.insert_event(&previous).unwrap();

        assert!(h.scaler.should_wait(&a).unwrap());
        assert_eq!(
            h.scaler.tick().await.unwrap().outcome("rush"),
            Some(&AlarmOutcome::CooldownActive)
        );

        // Exactly at the end of the wait period: still waiting.
        h.clock.set(T0 - 60_000 + 300_000);
        assert!(h.scaler.should_wait(&a).unwrap());

        // Ten minutes after the end: fires.
        h.clock.set(T0 - 60_000 + 600_000);
        assert!(!h.scaler.should_wait(&a).unwrap());
        assert_eq!(h.scaler.tick().await.unwrap().fired(), 1);
    }

    #[tokio::test]
    async fn failed_action_is_recorded_and_cooldown_applies() {
        let h = harness(RecordingAction {
            fail: true,
            ..Default::default()
        });
        h.store.insert_alarm(&alarm("rush", "true", 300)).unwrap();

        h.scaler.tick().await.unwrap();
        let events = h.store.events_for_alarm("rush", 10).unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].successful);
        assert_eq!(events[0].error, "platform unavailable");
        assert_ne!(events[0].end_time, 0);

        // Within the wait period nothing new is recorded.
        h.clock.advance(Duration::from_secs(60));
        assert_eq!(
            h.scaler.tick().await.unwrap().outcome("rush"),
            Some(&AlarmOutcome::CooldownActive)
        );
        assert_eq!(h.store.events_for_alarm("rush", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timed_out_action_closes_event_as_failed() {
        let store = StateStore::open_in_memory().unwrap();
        let action = Arc::new(RecordingAction {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let scaler = AutoScaler::new(
            store.clone(),
            Arc::new(CountingDataSource::default()),
            Arc::new(ExprEngine::new()),
            ActionRegistry::new().with(SCALE_UP, action),
        )
        .with_action_timeout(Duration::from_millis(50));
        store.insert_alarm(&alarm("slow", "true", 0)).unwrap();

        scaler.tick().await.unwrap();
        let event = store.latest_event_for_alarm("slow").unwrap().unwrap();
        assert!(!event.in_flight());
        assert!(!event.successful);
        assert_eq!(event.error, "action timed out after 50ms");
    }

    #[tokio::test]
    async fn unknown_action_records_nothing() {
        let h = harness(RecordingAction::default());
        let mut a = alarm("rush", "true", 0);
        a.actions = vec!["reboot".into()];
        h.store.insert_alarm(&a).unwrap();

        let report = h.scaler.tick().await.unwrap();
        assert!(matches!(
            report.outcome("rush"),
            Some(AlarmOutcome::Failed { phase: Phase::Dispatch, .. })
        ));
        assert!(h.store.list_events().unwrap().is_empty());
    }

    #[tokio::test]
    async fn check_failure_is_contained() {
        let h = harness(RecordingAction::default());
        h.store.insert_alarm(&alarm("broken", "data.missing > 1", 0)).unwrap();
        h.store.insert_alarm(&alarm("healthy", "true", 0)).unwrap();

        let report = h.scaler.tick().await.unwrap();
        assert!(matches!(
            report.outcome("broken"),
            Some(AlarmOutcome::Failed { phase: Phase::Check, .. })
        ));
        assert!(matches!(report.outcome("healthy"), Some(AlarmOutcome::Fired(_))));
    }

    #[tokio::test]
    async fn busy_alarm_is_skipped() {
        let h = harness(RecordingAction::default());
        h.store.insert_alarm(&alarm("rush", "true", 0)).unwrap();

        let lock = h.scaler.lock_for("rush").await;
        let _held = lock.lock().await;
        let report = h.scaler.tick().await.unwrap();
        assert_eq!(report.outcome("rush"), Some(&AlarmOutcome::Busy));
        assert_eq!(h.datasource.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn locks_of_removed_alarms_are_dropped() {
        let h = harness(RecordingAction::default());
        h.store.insert_alarm(&alarm("kept", "false", 0)).unwrap();
        h.store.insert_alarm(&alarm("gone", "false", 0)).unwrap();

        h.scaler.tick().await.unwrap();
        assert_eq!(h.scaler.inner.locks.lock().await.len(), 2);

        h.store.delete_alarm("gone").unwrap();
        h.scaler.tick().await.unwrap();
        let locks = h.scaler.inner.locks.lock().await;
        assert_eq!(locks.keys().collect::<Vec<_>>(), vec!["kept"]);
    }

    #[tokio::test]
    async fn scale_bounds_skip_without_event() {
        let store = StateStore::open_in_memory().unwrap();
        let units = Arc::new(FakeUnits::with("api", "web", 1));
        let registry = ActionRegistry::new()
            .with(SCALE_UP, Arc::new(ScaleAction::up(units.clone())))
            .with(SCALE_DOWN, Arc::new(ScaleAction::down(units.clone())));
        let datasource = StaticDataSource::new().with_document("ds", json!({}));
        let scaler = AutoScaler::new(store.clone(), Arc::new(datasource), Arc::new(ExprEngine::new()), registry);

        let mut down = alarm("scale_down_api", "true", 0);
        down.actions = vec![SCALE_DOWN.into()];
        down.envs.insert("minUnits".into(), "1".into());
        store.insert_alarm(&down).unwrap();

        let report = scaler.tick().await.unwrap();
        assert_eq!(report.outcome("scale_down_api"), Some(&AlarmOutcome::NotReady));
        assert!(store.list_events().unwrap().is_empty());

        let mut up = alarm("scale_up_api", "true", 0);
        up.envs.insert("step".into(), "2".into());
        store.insert_alarm(&up).unwrap();
        store.set_alarm_enabled("scale_down_api", false).unwrap();

        let report = scaler.tick().await.unwrap();
        assert_eq!(report.fired(), 1);
        assert_eq!(units.count("api", "web"), 3);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness(RecordingAction::default());
        h.store.insert_alarm(&alarm("rush", "true", 3600)).unwrap();

        let (tx, rx) = tokio::sync::watch::channel(false);
        let scaler = h.scaler.clone();
        let task = tokio::spawn(async move { scaler.run(Duration::from_millis(10), rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        // The wait period keeps repeated ticks from firing twice.
        assert_eq!(h.store.events_for_alarm("rush", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_ticks_before_the_first_interval() {
        let h = harness(RecordingAction::default());
        h.store.insert_alarm(&alarm("rush", "true", 0)).unwrap();

        let (tx, rx) = tokio::sync::watch::channel(false);
        let scaler = h.scaler.clone();
        let task = tokio::spawn(async move { scaler.run(Duration::from_secs(3600), rx).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.action.runs.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(h.action.runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.events_for_alarm("rush", 10).unwrap().len(), 1);
    }
}
