//! Parameter building.
//!
//! Turns the declared gear config into the ordered parameter map that the
//! command composer translates into flags. Rules, in order:
//! - `pipeline_file`, when given, is always the first entry.
//! - Excluded keys never appear.
//! - Booleans appear only when `true`.
//! - Single-letter keys always appear, whatever their value.
//! - Other keys appear only when their value is set: numbers greater than
//!   zero, non-empty strings. Zero means "use the pipeline's default".

use crate::types::{ConfigMap, ExclusionSet, OptionValue, ParamMap};
use std::path::Path;

/// Key under which the optional pipeline file input is stored.
pub const PIPELINE_FILE_KEY: &str = "pipeline_file";

/// Build the parameter map from config, skipping excluded keys.
pub fn build(config: &ConfigMap, exclude: &ExclusionSet, pipeline_file: Option<&Path>) -> ParamMap {
    let mut params = ParamMap::new();

    if let Some(path) = pipeline_file {
        params.insert(
            PIPELINE_FILE_KEY.to_string(),
            OptionValue::Text(path.display().to_string()),
        );
    }

    for (key, value) in config {
        if exclude.contains(key) {
            continue;
        }
        if include(key, value) {
            params.insert(key.clone(), value.clone());
        }
    }

    params
}

fn include(key: &str, value: &OptionValue) -> bool {
    match value {
        OptionValue::Bool(b) => *b,
        _ if key.chars().count() == 1 => true,
        OptionValue::Number(n) => n.is_positive(),
        OptionValue::Text(s) => !s.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(entries: &[(&str, OptionValue)]) -> ConfigMap {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn exclude(keys: &[&str]) -> ExclusionSet {
        keys.iter().map(|k| (*k).to_string()).collect()
    }

    #[test]
    fn false_booleans_are_dropped() {
        let cfg = config(&[
            ("skip_bids_validator", false.into()),
            ("save_working_dir", true.into()),
            ("x", false.into()),
        ]);
        let params = build(&cfg, &ExclusionSet::new(), None);
        assert!(!params.contains_key("skip_bids_validator"));
        assert!(!params.contains_key("x"));
        assert_eq!(params["save_working_dir"], OptionValue::Bool(true));
    }

    #[test]
    fn zero_and_negative_long_numbers_are_dropped() {
        let cfg = config(&[
            ("n_cpus", 0i64.into()),
            ("mem_gb", 0.0f64.into()),
            ("num_ants_threads", (-1i64).into()),
            ("max_threads", 4i64.into()),
        ]);
        let params = build(&cfg, &ExclusionSet::new(), None);
        assert!(!params.contains_key("n_cpus"));
        assert!(!params.contains_key("mem_gb"));
        assert!(!params.contains_key("num_ants_threads"));
        assert_eq!(params["max_threads"], OptionValue::int(4));
    }

    #[test]
    fn single_letter_keys_are_always_kept() {
        let cfg = config(&[
            ("a", 0i64.into()),
            ("b", "".into()),
            ("c", (-3i64).into()),
        ]);
        let params = build(&cfg, &ExclusionSet::new(), None);
        assert_eq!(params["a"], OptionValue::int(0));
        assert_eq!(params["b"], OptionValue::text(""));
        assert_eq!(params["c"], OptionValue::int(-3));
    }

    #[test]
    fn empty_long_text_is_dropped() {
        let cfg = config(&[("preconfig", "".into()), ("pipeline", "fmriprep".into())]);
        let params = build(&cfg, &ExclusionSet::new(), None);
        assert!(!params.contains_key("preconfig"));
        assert_eq!(params["pipeline"], OptionValue::text("fmriprep"));
    }

    #[test]
    fn excluded_keys_never_appear() {
        let cfg = config(&[
            ("gear-save-output-on-error", true.into()),
            ("gear-abort-on-bids-error", true.into()),
            ("n_cpus", 2i64.into()),
        ]);
        let params = build(
            &cfg,
            &exclude(&["gear-save-output-on-error", "gear-abort-on-bids-error"]),
            None,
        );
        assert_eq!(params.len(), 1);
        assert!(params.contains_key("n_cpus"));
    }

    #[test]
    fn pipeline_file_comes_first_then_declaration_order() {
        let cfg = config(&[
            ("zeta", true.into()),
            ("n_cpus", 2i64.into()),
            ("alpha", "x".into()),
        ]);
        let pipeline = PathBuf::from("/flywheel/v0/input/pipeline_file/pipe.yml");
        let params = build(&cfg, &ExclusionSet::new(), Some(&pipeline));

        let keys: Vec<&str> = params.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["pipeline_file", "zeta", "n_cpus", "alpha"]);
        assert_eq!(
            params["pipeline_file"],
            OptionValue::text("/flywheel/v0/input/pipeline_file/pipe.yml")
        );
    }

    #[test]
    fn build_is_idempotent() {
        let cfg = config(&[("verbose", false.into()), ("n_cpus", 3i64.into())]);
        let excl = exclude(&["gear-run-bids-validation"]);
        assert_eq!(build(&cfg, &excl, None), build(&cfg, &excl, None));
    }
}
