use std::collections::BTreeSet;

use anyhow::{Context, Result};
use regex::Regex;

use crate::classfile::STATIC_INITIALIZER;
use crate::config::RuleConfig;
use crate::metadata::ClassMetadata;

/// Compiled matching and injection directive.
#[derive(Clone, Debug)]
pub(crate) struct Rule {
    pub(crate) config: RuleConfig,
    /// Internal name of the interface a class must implement directly.
    pub(crate) scan_interface: Option<String>,
    /// Internal names; consulted only when `scan_interface` is unset.
    pub(crate) scan_super_classes: BTreeSet<String>,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    pub(crate) target_class: String,
    pub(crate) target_method: String,
    pub(crate) register_method: String,
}

impl Rule {
    pub(crate) fn from_config(config: RuleConfig) -> Result<Self> {
        let target_class = internal_name(&config.code_insert_to_class_name);
        if target_class.is_empty() {
            anyhow::bail!("codeInsertToClassName must not be empty");
        }
        let register_method = config.register_method_name.trim().to_string();
        if register_method.is_empty() {
            anyhow::bail!("registerMethodName must not be empty");
        }
        let target_method = match config.code_insert_to_method_name.trim() {
            "" => STATIC_INITIALIZER.to_string(),
            name => name.to_string(),
        };
        let scan_interface = Some(internal_name(&config.scan_interface))
            .filter(|name| !name.is_empty());
        let scan_super_classes = config
            .scan_super_classes
            .iter()
            .map(|name| internal_name(name))
            .filter(|name| !name.is_empty())
            .collect();
        let include = compile_patterns(&config.include).context("compile include patterns")?;
        let exclude = compile_patterns(&config.exclude).context("compile exclude patterns")?;

        Ok(Self {
            config,
            scan_interface,
            scan_super_classes,
            include,
            exclude,
            target_class,
            target_method,
            register_method,
        })
    }

    /// Whether `class` should be registered by this rule.
    pub(crate) fn accepts(&self, class: &ClassMetadata) -> bool {
        if class.is_interface || class.is_abstract {
            return false;
        }
        if !class.has_public_no_arg_constructor {
            return false;
        }
        let dotted = class.name.replace('/', ".");
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(&dotted)) {
            return false;
        }
        if self.exclude.iter().any(|re| re.is_match(&dotted)) {
            return false;
        }
        if let Some(interface) = &self.scan_interface {
            return class.interfaces.contains(interface);
        }
        if !self.scan_super_classes.is_empty() {
            return self.scan_super_classes.contains(&class.super_name);
        }
        false
    }

    /// True when neither an interface nor superclasses are configured.
    pub(crate) fn matches_nothing(&self) -> bool {
        self.scan_interface.is_none() && self.scan_super_classes.is_empty()
    }

    pub(crate) fn label(&self) -> String {
        let scanned = match &self.scan_interface {
            Some(interface) => interface.clone(),
            None => self
                .scan_super_classes
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join("|"),
        };
        format!(
            "{} -> {}.{}#{}",
            scanned, self.target_class, self.target_method, self.register_method
        )
    }
}

/// Convert `com.example.Foo` or `com/example/Foo` to the internal form.
pub(crate) fn internal_name(name: &str) -> String {
    name.trim().replace('.', "/")
}

/// Patterns must match the whole dotted class name.
fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(&format!("^(?:{pattern})$"))
                .with_context(|| format!("invalid pattern {pattern:?}"))
        })
        .collect()
}
