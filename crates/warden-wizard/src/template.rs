//! Expression templates and placeholder substitution.

use std::collections::{BTreeMap, HashMap};

use regex::{Captures, Regex};

use crate::error::{WizardError, WizardResult};

/// Datasource name that gets the built-in units template.
pub const UNITS_DATASOURCE: &str = "units";

/// Holds when the process has more units than the floor and the app is unlocked.
pub const UNITS_TEMPLATE: &str = r#"!units.lock.Locked && units.units.filter(unit => unit.ProcessName == "{process}").length > {minUnits}"#;

/// Compares the aggregation of the most recent date bucket of a metric.
pub const DEFAULT_TEMPLATE: &str = "{metric}.aggregations.range.buckets[0].date.buckets[{metric}.aggregations.range.buckets[0].date.buckets.length - 1].{aggregator}.value {operator} {value}";

const PLACEHOLDER: &str = r"\{([A-Za-z_][A-Za-z0-9_]*)\}";

/// Per-datasource expression templates, configured at startup.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: HashMap<String, String>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `template` for the datasource called `datasource`. An empty
    /// template falls back to the built-in ones.
    pub fn with_template(mut self, datasource: &str, template: &str) -> Self {
        self.insert(datasource, template);
        self
    }

    pub fn insert(&mut self, datasource: &str, template: &str) {
        if template.trim().is_empty() {
            self.templates.remove(datasource);
        } else {
            self.templates
                .insert(datasource.to_string(), template.to_string());
        }
    }

    /// The template for `datasource`, falling back to the built-ins.
    pub fn template_for(&self, datasource: &str) -> &str {
        match self.templates.get(datasource) {
            Some(template) => template,
            None if datasource == UNITS_DATASOURCE => UNITS_TEMPLATE,
            None => DEFAULT_TEMPLATE,
        }
    }

    /// Join the templates of `datasources` with `&&`, in order.
    pub fn expression_for(&self, datasources: &[String]) -> String {
        datasources
            .iter()
            .map(|d| self.template_for(d))
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

/// Replace every `{name}` with `values[name]` in a single pass.
///
/// Substituted values are never rescanned, so the result does not depend on
/// the order of `values`. A placeholder without a value is a config error.
pub fn substitute(template: &str, values: &BTreeMap<&str, String>) -> WizardResult<String> {
    let placeholder = Regex::new(PLACEHOLDER).map_err(|e| WizardError::Config(e.to_string()))?;
    let mut unresolved = Vec::new();
    let out = placeholder.replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        match values.get(name) {
            Some(value) => value.clone(),
            None => {
                unresolved.push(caps[0].to_string());
                caps[0].to_string()
            }
        }
    });
    if !unresolved.is_empty() {
        unresolved.sort();
        unresolved.dedup();
        return Err(WizardError::Config(format!(
            "unresolved placeholders: {}",
            unresolved.join(", ")
        )));
    }
    Ok(out.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&'static str, &str)]) -> BTreeMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn catalog_falls_back_to_builtins() {
        let catalog = TemplateCatalog::new().with_template("cpu", "cpu.value > {value}");
        assert_eq!(catalog.template_for("cpu"), "cpu.value > {value}");
        assert_eq!(catalog.template_for("units"), UNITS_TEMPLATE);
        assert_eq!(catalog.template_for("mem"), DEFAULT_TEMPLATE);
    }

    #[test]
    fn empty_template_means_builtin() {
        let catalog = TemplateCatalog::new()
            .with_template("cpu", "cpu.value > 1")
            .with_template("cpu", "  ");
        assert_eq!(catalog.template_for("cpu"), DEFAULT_TEMPLATE);
    }

    #[test]
    fn expression_joins_in_order() {
        let catalog = TemplateCatalog::new()
            .with_template("a", "a.x")
            .with_template("b", "b.y");
        assert_eq!(
            catalog.expression_for(&["b".to_string(), "a".to_string()]),
            "b.y && a.x"
        );
    }

    #[test]
    fn substitution_is_single_pass() {
        // A value that looks like a placeholder is not expanded again.
        let out = substitute(
            "{metric} > {value}",
            &values(&[("metric", "{value}"), ("value", "10")]),
        )
        .unwrap();
        assert_eq!(out, "{value} > 10");
        assert_eq!(
            substitute("{a}{b}", &values(&[("a", "{b}"), ("b", "x")])).unwrap(),
            "{b}x"
        );
    }

    #[test]
    fn unresolved_placeholder_is_config_error() {
        let err = substitute("{metric} > {threshold}", &values(&[("metric", "cpu")])).unwrap_err();
        match err {
            WizardError::Config(msg) => assert!(msg.contains("{threshold}")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn braces_that_are_not_placeholders_are_kept() {
        assert_eq!(substitute("{ 1 }", &values(&[])).unwrap(), "{ 1 }");
    }
}
