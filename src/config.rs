use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classfile::STATIC_INITIALIZER;
use crate::rule::Rule;

/// One registration rule as written in a rule file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct RuleConfig {
    #[serde(default)]
    pub(crate) scan_interface: String,
    #[serde(default)]
    pub(crate) scan_super_classes: Vec<String>,
    #[serde(default)]
    pub(crate) include: Vec<String>,
    #[serde(default)]
    pub(crate) exclude: Vec<String>,
    #[serde(alias = "targetClassName")]
    pub(crate) code_insert_to_class_name: String,
    #[serde(alias = "targetMethodName", default = "default_target_method")]
    pub(crate) code_insert_to_method_name: String,
    #[serde(alias = "registerMethod")]
    pub(crate) register_method_name: String,
}

fn default_target_method() -> String {
    STATIC_INITIALIZER.to_string()
}

/// Load and compile rules from every file, keeping file order then rule order.
pub(crate) fn load_rules(paths: &[PathBuf]) -> Result<Vec<Rule>> {
    let mut rules = Vec::new();
    for path in paths {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let configs = parse_rule_file(&content, path)?;
        tracing::debug!(path = %path.display(), rules = configs.len(), "loaded rule file");
        for (index, config) in configs.into_iter().enumerate() {
            let rule = Rule::from_config(config)
                .with_context(|| format!("invalid rule #{} in {}", index, path.display()))?;
            if rule.matches_nothing() {
                tracing::warn!(
                    rule = %rule.label(),
                    "rule sets neither scanInterface nor scanSuperClasses and will match nothing"
                );
            }
            rules.push(rule);
        }
    }
    Ok(rules)
}

/// A rule file holds either a bare array or `{ "registerInfo": [...] }`.
pub(crate) fn parse_rule_file(content: &str, origin: &Path) -> Result<Vec<RuleConfig>> {
    let value: Value = serde_json::from_str(content)
        .with_context(|| format!("failed to parse {}", origin.display()))?;
    let list = match value {
        list @ Value::Array(_) => list,
        Value::Object(mut map) => map
            .remove("registerInfo")
            .with_context(|| format!("{} has no registerInfo list", origin.display()))?,
        _ => anyhow::bail!("{} must contain a list of rules", origin.display()),
    };
    serde_path_to_error::deserialize(list)
        .map_err(|err| {
            let path = err.path().to_string();
            anyhow::Error::new(err.into_inner()).context(format!("at {path}"))
        })
        .with_context(|| format!("invalid rule in {}", origin.display()))
}
