//! Command-line composition.
//!
//! Each parameter becomes one or two tokens:
//! - single-letter key: `-k`, followed by the value as its own token
//!   unless the value renders empty
//! - boolean long key: `--key`
//! - other long key: `--key=value`, or `--key` alone for an empty value
//!
//! Tokens are handed to the child as an argument vector, never through a
//! shell, so no quoting happens here.

use crate::types::{CommandSpec, OptionValue, ParamMap};

/// Translate parameters into flag tokens, in parameter order.
pub fn param_tokens(params: &ParamMap) -> Vec<String> {
    let mut tokens = Vec::with_capacity(params.len() * 2);

    for (key, value) in params {
        if key.chars().count() == 1 {
            tokens.push(format!("-{key}"));
            let rendered = value.to_string();
            if !rendered.is_empty() {
                tokens.push(rendered);
            }
            continue;
        }

        match value {
            OptionValue::Bool(true) => tokens.push(format!("--{key}")),
            OptionValue::Bool(false) => {}
            _ => {
                let rendered = value.to_string();
                if rendered.is_empty() {
                    tokens.push(format!("--{key}"));
                } else {
                    tokens.push(format!("--{key}={rendered}"));
                }
            }
        }
    }

    tokens
}

/// `prefix ++ param tokens ++ suffix`.
pub fn compose(prefix: &[String], params: &ParamMap, suffix: &[String]) -> Vec<String> {
    let mut command = prefix.to_vec();
    command.extend(param_tokens(params));
    command.extend(suffix.iter().cloned());
    command
}

impl CommandSpec {
    pub fn new(prefix: Vec<String>, suffix: Vec<String>) -> Self {
        Self { prefix, suffix }
    }

    /// Compose the full argument vector for these parameters.
    pub fn compose(&self, params: &ParamMap) -> Vec<String> {
        compose(&self.prefix, params, &self.suffix)
    }
}

/// Space-joined rendering for logs.
pub fn display_command(command: &[String]) -> String {
    command.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn params(entries: &[(&str, OptionValue)]) -> ParamMap {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn short_option_takes_separate_value_token() {
        let cmd = compose(&strings(&["/x"]), &params(&[("a", OptionValue::int(5))]), &strings(&["S"]));
        assert_eq!(cmd, strings(&["/x", "-a", "5", "S"]));
    }

    #[test]
    fn short_option_with_empty_value_is_bare() {
        let cmd = compose(&strings(&["/x"]), &params(&[("v", OptionValue::text(""))]), &[]);
        assert_eq!(cmd, strings(&["/x", "-v"]));
    }

    #[test]
    fn true_boolean_is_bare_long_flag() {
        let cmd = compose(
            &strings(&["/x"]),
            &params(&[("verbose", OptionValue::Bool(true))]),
            &strings(&["S"]),
        );
        assert_eq!(cmd, strings(&["/x", "--verbose", "S"]));
    }

    #[test]
    fn false_boolean_emits_nothing() {
        let cmd = compose(&strings(&["/x"]), &params(&[("verbose", OptionValue::Bool(false))]), &[]);
        assert_eq!(cmd, strings(&["/x"]));
    }

    #[test]
    fn long_value_is_joined_with_equals() {
        let cmd = compose(
            &strings(&["/x"]),
            &params(&[("n_cpus", OptionValue::int(8))]),
            &strings(&["S"]),
        );
        assert_eq!(cmd, strings(&["/x", "--n_cpus=8", "S"]));
    }

    #[test]
    fn long_empty_value_is_bare_flag() {
        let cmd = compose(&strings(&["/x"]), &params(&[("preconfig", OptionValue::text(""))]), &[]);
        assert_eq!(cmd, strings(&["/x", "--preconfig"]));
    }

    #[test]
    fn values_with_spaces_stay_one_token() {
        let cmd = compose(
            &strings(&["/x"]),
            &params(&[("pipeline_file", OptionValue::text("/in/my pipe.yml"))]),
            &[],
        );
        assert_eq!(cmd, strings(&["/x", "--pipeline_file=/in/my pipe.yml"]));
    }

    #[test]
    fn tokens_follow_parameter_order() {
        let spec = CommandSpec::new(
            strings(&["/code/run.py"]),
            strings(&["/work/bids", "/work/ses", "participant"]),
        );
        let p = params(&[
            ("pipeline_file", OptionValue::text("/in/p.yml")),
            ("n", OptionValue::int(2)),
            ("save_working_dir", OptionValue::Bool(true)),
            ("mem_gb", OptionValue::float(14.4)),
        ]);
        assert_eq!(
            spec.compose(&p),
            strings(&[
                "/code/run.py",
                "--pipeline_file=/in/p.yml",
                "-n",
                "2",
                "--save_working_dir",
                "--mem_gb=14.4",
                "/work/bids",
                "/work/ses",
                "participant",
            ])
        );
    }

    #[test]
    fn display_joins_with_spaces() {
        assert_eq!(display_command(&strings(&["/x", "-a", "5"])), "/x -a 5");
    }
}
