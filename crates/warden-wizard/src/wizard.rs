//! Wizard — compiles autoscale specifications into alarm pairs and manages
//! their lifecycle.
//!
//! An autoscale spec named `api` with no process produces the alarms
//! `scale_up_api` and `scale_down_api`; with process `worker` they become
//! `scale_up_api_worker` and `scale_down_api_worker`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use warden_expr::{Evaluator, ExprEngine};
use warden_state::{
    Alarm, AutoScale, DataSourceInstance, Event, SCALE_DOWN, SCALE_UP, ScaleAction, StateError,
    StateStore,
};

use crate::error::{WizardError, WizardResult};
use crate::template::{TemplateCatalog, UNITS_DATASOURCE, substitute};

/// Process scaled when the spec does not name one.
pub const DEFAULT_PROCESS: &str = "web";
/// Aggregation compared when the action does not name one.
pub const DEFAULT_AGGREGATOR: &str = "max";
/// Maximum number of events returned by [`Wizard::events`].
pub const EVENTS_LIMIT: usize = 200;

const OPERATORS: &[&str] = &[">", ">=", "<", "<=", "==", "!=", "===", "!=="];

/// An autoscale spec together with its derived enabled state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoScaleView {
    #[serde(flatten)]
    pub spec: AutoScale,
    pub enabled: bool,
}

/// Names of the alarms generated for `spec`: `[scale_up, scale_down]`.
pub fn alarm_names(spec: &AutoScale) -> [String; 2] {
    [alarm_name(spec, SCALE_UP), alarm_name(spec, SCALE_DOWN)]
}

fn alarm_name(spec: &AutoScale, kind: &str) -> String {
    if spec.process.is_empty() {
        format!("{kind}_{}", spec.name)
    } else {
        format!("{kind}_{}_{}", spec.name, spec.process)
    }
}

/// Fill in defaults: `min_units <= 0` becomes 1.
pub fn normalize(mut spec: AutoScale) -> AutoScale {
    if spec.min_units <= 0 {
        spec.min_units = 1;
    }
    spec
}

pub struct Wizard {
    store: StateStore,
    catalog: TemplateCatalog,
    evaluator: Arc<dyn Evaluator>,
}

impl Wizard {
    pub fn new(store: StateStore, catalog: TemplateCatalog) -> Self {
        Self {
            store,
            catalog,
            evaluator: Arc::new(ExprEngine::new()),
        }
    }

    /// Validate generated expressions with `evaluator` instead of the built-in engine.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Build the alarm for one direction of `spec` without storing it.
    pub fn compose(&self, spec: &AutoScale, kind: &str) -> WizardResult<Alarm> {
        let spec = normalize(spec.clone());
        let (action, datasources): (&ScaleAction, Vec<String>) = match kind {
            SCALE_UP => (&spec.scale_up, vec![spec.scale_up.metric.clone()]),
            SCALE_DOWN => (
                &spec.scale_down,
                vec![UNITS_DATASOURCE.to_string(), spec.scale_down.metric.clone()],
            ),
            other => return Err(WizardError::Config(format!("unknown scale kind {other:?}"))),
        };
        validate_action(kind, action)?;

        let process = if spec.process.is_empty() {
            DEFAULT_PROCESS
        } else {
            spec.process.as_str()
        };
        let aggregator = if action.aggregator.is_empty() {
            DEFAULT_AGGREGATOR
        } else {
            action.aggregator.as_str()
        };

        let mut values = BTreeMap::new();
        values.insert("aggregator", aggregator.to_string());
        values.insert("operator", action.operator.clone());
        values.insert("value", action.value.clone());
        values.insert("minUnits", spec.min_units.to_string());
        values.insert("metric", action.metric.clone());
        values.insert("process", process.to_string());

        let template = self.catalog.expression_for(&datasources);
        let expression = substitute(&template, &values)?;
        self.evaluator.validate(&expression)?;

        let mut envs = BTreeMap::new();
        envs.insert("step".to_string(), action.step.clone());
        envs.insert("process".to_string(), process.to_string());
        envs.insert("aggregator".to_string(), aggregator.to_string());
        envs.insert("minUnits".to_string(), spec.min_units.to_string());
        if spec.max_units > 0 {
            envs.insert("maxUnits".to_string(), spec.max_units.to_string());
        }

        let data_sources = datasources
            .iter()
            .map(|name| {
                let mut ds = DataSourceInstance::named(name);
                ds.metadata.insert("instance".to_string(), spec.name.clone());
                ds.metadata.insert("process".to_string(), process.to_string());
                ds
            })
            .collect();

        Ok(Alarm {
            name: alarm_name(&spec, kind),
            expression,
            enabled: true,
            data_sources,
            actions: vec![kind.to_string()],
            instance: spec.name.clone(),
            wait_secs: action.wait,
            envs,
        })
    }

    fn compose_pair(&self, spec: &AutoScale) -> WizardResult<[Alarm; 2]> {
        Ok([self.compose(spec, SCALE_UP)?, self.compose(spec, SCALE_DOWN)?])
    }

    /// Compile `spec` into its alarm pair and store everything.
    ///
    /// Either all of the spec and both alarms are stored, or none are.
    pub fn create(&self, spec: AutoScale) -> WizardResult<AutoScale> {
        let spec = normalize(spec);
        let [up, down] = self.compose_pair(&spec).inspect_err(|e| {
            error!(autoscale = %spec.name, error = %e, "autoscale rejected");
        })?;

        self.store.insert_alarm(&up)?;
        if let Err(e) = self.store.insert_alarm(&down) {
            error!(autoscale = %spec.name, alarm = %down.name, error = %e, "storing alarm failed");
            self.discard(&[up.name.as_str()]);
            return Err(e.into());
        }
        if let Err(e) = self.store.insert_autoscale(&spec) {
            error!(autoscale = %spec.name, error = %e, "storing autoscale failed");
            self.discard(&[up.name.as_str(), down.name.as_str()]);
            return Err(e.into());
        }

        info!(autoscale = %spec.name, scale_up = %up.name, scale_down = %down.name, "autoscale created");
        Ok(spec)
    }

    /// Replace the alarm pair of an existing spec.
    ///
    /// The enabled state of the previous pair carries over. On failure the
    /// previous alarms are restored. Both previous alarms must exist.
    pub fn update(&self, spec: AutoScale) -> WizardResult<AutoScale> {
        let spec = normalize(spec);
        let old = self.get(&spec.name)?;
        self.require_alarms(&alarm_names(&old))?;
        let mut pair = self.compose_pair(&spec)?;

        let old_alarms: Vec<Alarm> = alarm_names(&old)
            .iter()
            .map(|name| self.store.get_alarm(name))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();
        let was_enabled = old_alarms.iter().all(|a| a.enabled);
        for alarm in &mut pair {
            alarm.enabled = was_enabled;
        }

        for alarm in &old_alarms {
            self.store.delete_alarm(&alarm.name)?;
        }

        let mut stored: Vec<&str> = Vec::new();
        let result = (|| -> WizardResult<()> {
            for alarm in &pair {
                self.store.insert_alarm(alarm)?;
                stored.push(&alarm.name);
            }
            self.store.put_autoscale(&spec)?;
            Ok(())
        })();

        if let Err(e) = result {
            error!(autoscale = %spec.name, error = %e, "autoscale update failed, restoring previous alarms");
            self.discard(&stored);
            for alarm in &old_alarms {
                if let Err(e) = self.store.put_alarm(alarm) {
                    error!(alarm = %alarm.name, error = %e, "restoring alarm failed");
                }
            }
            return Err(e);
        }

        info!(autoscale = %spec.name, enabled = was_enabled, "autoscale updated");
        Ok(spec)
    }

    /// Delete a spec and its alarms. Recorded events are kept.
    pub fn remove(&self, name: &str) -> WizardResult<()> {
        let spec = self.get(name)?;
        let names = alarm_names(&spec);
        self.require_alarms(&names)?;
        for alarm in &names {
            self.store.delete_alarm(alarm)?;
        }
        self.store.delete_autoscale(&spec.name)?;
        info!(autoscale = %name, "autoscale removed");
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> WizardResult<AutoScaleView> {
        let spec = self.get(name)?;
        let enabled = self.is_enabled(&spec)?;
        Ok(AutoScaleView { spec, enabled })
    }

    pub fn list(&self) -> WizardResult<Vec<AutoScaleView>> {
        self.store
            .list_autoscales()?
            .into_iter()
            .map(|spec| {
                let enabled = self.is_enabled(&spec)?;
                Ok(AutoScaleView { spec, enabled })
            })
            .collect()
    }

    pub fn enable(&self, name: &str) -> WizardResult<()> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> WizardResult<()> {
        self.set_enabled(name, false)
    }

    /// True iff both alarms of `spec` exist and are enabled.
    pub fn is_enabled(&self, spec: &AutoScale) -> WizardResult<bool> {
        for name in alarm_names(spec) {
            match self.store.get_alarm(&name)? {
                Some(alarm) if alarm.enabled => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Scale events of the spec's instance, newest first.
    pub fn events(&self, name: &str) -> WizardResult<Vec<Event>> {
        let spec = self.get(name)?;
        Ok(self
            .store
            .events_for_instance(&spec.name, &[SCALE_UP, SCALE_DOWN], EVENTS_LIMIT)?)
    }

    fn get(&self, name: &str) -> WizardResult<AutoScale> {
        self.store
            .get_autoscale(name)?
            .ok_or_else(|| WizardError::NotFound(format!("autoscale {name}")))
    }

    fn require_alarms(&self, names: &[String]) -> WizardResult<()> {
        for name in names {
            if self.store.get_alarm(name)?.is_none() {
                return Err(WizardError::NotFound(format!("alarm {name}")));
            }
        }
        Ok(())
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> WizardResult<()> {
        let spec = self.get(name)?;
        let names = alarm_names(&spec);
        self.require_alarms(&names)?;
        for alarm in &names {
            self.store.set_alarm_enabled(alarm, enabled).map_err(|e| match e {
                StateError::NotFound(what) => WizardError::NotFound(what),
                other => other.into(),
            })?;
        }
        info!(autoscale = %name, enabled, "autoscale toggled");
        Ok(())
    }

    /// Best-effort removal of alarms written by a failed operation.
    fn discard(&self, names: &[&str]) {
        for name in names {
            if let Err(e) = self.store.delete_alarm(name) {
                warn!(alarm = %name, error = %e, "rollback of alarm failed");
            }
        }
    }
}

fn validate_action(kind: &str, action: &ScaleAction) -> WizardResult<()> {
    if action.metric.trim().is_empty() {
        return Err(WizardError::Config(format!("{kind}: metric is required")));
    }
    if !OPERATORS.contains(&action.operator.trim()) {
        return Err(WizardError::Config(format!(
            "{kind}: unsupported operator {:?}",
            action.operator
        )));
    }
    if action.value.trim().is_empty() {
        return Err(WizardError::Config(format!("{kind}: value is required")));
    }
    Ok(())
}
