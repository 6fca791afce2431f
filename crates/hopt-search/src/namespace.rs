//! Turning a trial into a complete configuration.

use hopt_types::TrialConfig;

use crate::space::Trial;

/// Apply every assignment of `trial` on top of a copy of `base`.
///
/// Names absent from `base` are added. `base` itself is never touched.
pub fn build_config(trial: &Trial, base: &TrialConfig) -> TrialConfig {
    let mut config = base.clone();
    for assignment in trial.assignments() {
        config.set(assignment.name.clone(), assignment.value.to_json());
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{Assignment, ParameterValue};
    use serde_json::json;

    fn base() -> TrialConfig {
        TrialConfig::new().with("a", 1).with("b", 2).with("c", 3)
    }

    fn trial(name: &str, value: ParameterValue) -> Trial {
        Trial::new(vec![Assignment {
            index: 0,
            name: name.to_string(),
            value,
        }])
    }

    #[test]
    fn overrides_named_entries_only() {
        let base = base();
        let config = build_config(&trial("b", ParameterValue::Int(5)), &base);

        assert_eq!(config, TrialConfig::new().with("a", 1).with("b", 5).with("c", 3));
        assert_eq!(base, TrialConfig::new().with("a", 1).with("b", 2).with("c", 3));
    }

    #[test]
    fn repeated_builds_leave_base_untouched() {
        let base = base();
        let first = build_config(&trial("a", ParameterValue::Float(0.5)), &base);
        let second = build_config(&trial("c", ParameterValue::from("adam")), &base);

        assert_eq!(first.get("a"), Some(&json!(0.5)));
        assert_eq!(first.get("c"), Some(&json!(3)));
        assert_eq!(second.get("a"), Some(&json!(1)));
        assert_eq!(second.get("c"), Some(&json!("adam")));
        assert_eq!(base, TrialConfig::new().with("a", 1).with("b", 2).with("c", 3));
    }

    #[test]
    fn unknown_names_are_added() {
        let config = build_config(&trial("dropout", ParameterValue::Float(0.1)), &base());
        assert_eq!(config.len(), 4);
        assert_eq!(config.get_f64("dropout"), Some(0.1));
    }
}
