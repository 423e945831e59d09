//! Assembles the autoscaler from configuration.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use warden_alarm::{ActionRegistry, HttpDataSource, HttpUnitController, ScaleAction, WebhookAction};
use warden_state::{AutoScale, SCALE_DOWN, SCALE_UP, StateStore};
use warden_wizard::{TemplateCatalog, Wizard};

use crate::config::{ActionConfig, ActionKind, DataSourceConfig};

/// Build the action registry. Scale actions and webhooks share the
/// daemon's action timeout for their HTTP calls.
pub fn build_registry(actions: &[ActionConfig], timeout: Duration) -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    for action in actions {
        match action.kind {
            ActionKind::ScaleUp | ActionKind::ScaleDown => {
                let controller = Arc::new(
                    HttpUnitController::new(&action.url)
                        .with_token(action.token.clone())
                        .with_timeout(timeout),
                );
                let scale = if action.kind == ActionKind::ScaleUp {
                    ScaleAction::up(controller)
                } else {
                    ScaleAction::down(controller)
                };
                registry.register(&action.name, Arc::new(scale));
            }
            ActionKind::Webhook => {
                let webhook = WebhookAction::new(&action.url)
                    .with_token(action.token.clone())
                    .with_timeout(timeout);
                registry.register(&action.name, Arc::new(webhook));
            }
        }
        info!(action = %action.name, kind = ?action.kind, url = %action.url, "action registered");
    }
    registry
}

pub fn build_datasource(datasources: &[DataSourceConfig]) -> HttpDataSource {
    datasources.iter().fold(HttpDataSource::new(), |ds, d| {
        ds.with_datasource(&d.name, d.metadata.clone())
    })
}

pub fn build_catalog(datasources: &[DataSourceConfig]) -> TemplateCatalog {
    let mut catalog = TemplateCatalog::new();
    for d in datasources {
        if let Some(template) = &d.expression_template {
            catalog.insert(&d.name, template);
        }
    }
    catalog
}

/// Create or update each configured autoscale. Returns how many were
/// stored; invalid entries are logged and skipped.
pub fn seed(store: &StateStore, wizard: &Wizard, specs: &[AutoScale]) -> anyhow::Result<usize> {
    let mut stored = 0;
    for spec in specs {
        let result = match store.get_autoscale(&spec.name)? {
            Some(_) => wizard.update(spec.clone()),
            None => wizard.create(spec.clone()),
        };
        match result {
            Ok(_) => stored += 1,
            Err(e) => warn!(autoscale = %spec.name, error = %e, "skipping configured autoscale"),
        }
    }
    Ok(stored)
}

/// Warn when autoscales exist but nothing can carry out their actions.
pub fn check_scale_actions(registry: &ActionRegistry, autoscales: usize) {
    if autoscales == 0 {
        return;
    }
    for name in [SCALE_UP, SCALE_DOWN] {
        if !registry.contains(name) {
            warn!(action = name, "no action configured; autoscale alarms will fail to dispatch");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use warden_state::ScaleAction as ScaleSpec;

    use super::*;

    fn action(name: &str, kind: ActionKind) -> ActionConfig {
        ActionConfig {
            name: name.into(),
            kind,
            url: "http://127.0.0.1:9".into(),
            token: None,
        }
    }

    fn spec(name: &str, threshold: &str) -> AutoScale {
        let direction = |operator: &str| ScaleSpec {
            aggregator: String::new(),
            metric: "cpu".into(),
            operator: operator.into(),
            value: threshold.into(),
            step: "1".into(),
            wait: 60,
        };
        AutoScale {
            name: name.into(),
            scale_up: direction(">"),
            scale_down: direction("<"),
            min_units: 1,
            max_units: 0,
            process: String::new(),
        }
    }

    #[test]
    fn registry_has_configured_actions() {
        let registry = build_registry(
            &[
                action(SCALE_UP, ActionKind::ScaleUp),
                action(SCALE_DOWN, ActionKind::ScaleDown),
                action("notify", ActionKind::Webhook),
            ],
            Duration::from_secs(1),
        );
        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["notify", SCALE_DOWN, SCALE_UP]);
    }

    #[test]
    fn catalog_takes_configured_templates() {
        let datasources = vec![
            DataSourceConfig {
                name: "cpu".into(),
                expression_template: Some("cpu.load {operator} {value}".into()),
                metadata: BTreeMap::new(),
            },
            DataSourceConfig {
                name: "mem".into(),
                expression_template: None,
                metadata: BTreeMap::new(),
            },
        ];
        let catalog = build_catalog(&datasources);
        assert_eq!(catalog.template_for("cpu"), "cpu.load {operator} {value}");
        assert_eq!(catalog.template_for("mem"), warden_wizard::DEFAULT_TEMPLATE);
    }

    #[test]
    fn seed_creates_then_updates() {
        let store = StateStore::open_in_memory().unwrap();
        let wizard = Wizard::new(store.clone(), TemplateCatalog::new());

        assert_eq!(seed(&store, &wizard, &[spec("api", "80")]).unwrap(), 1);
        wizard.disable("api").unwrap();

        // Re-seeding updates in place and keeps the disabled state.
        assert_eq!(seed(&store, &wizard, &[spec("api", "90")]).unwrap(), 1);
        let view = wizard.find_by_name("api").unwrap();
        assert_eq!(view.spec.scale_up.value, "90");
        assert!(!view.enabled);
        assert_eq!(store.list_autoscales().unwrap().len(), 1);
    }

    #[test]
    fn seed_skips_invalid_specs() {
        let store = StateStore::open_in_memory().unwrap();
        let wizard = Wizard::new(store.clone(), TemplateCatalog::new());
        let mut bad = spec("bad", "80");
        bad.scale_up.operator = "~".into();

        let stored = seed(&store, &wizard, &[bad, spec("good", "80")]).unwrap();
        assert_eq!(stored, 1);
        assert!(store.get_autoscale("bad").unwrap().is_none());
        assert!(store.get_autoscale("good").unwrap().is_some());
    }
}
