use std::collections::BTreeSet;
use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::assemble::AssemblyReport;
use crate::config::RuleConfig;
use crate::inject::{InjectionOutcome, InjectionOutput};
use crate::rule::Rule;
use crate::scan::ScanOutput;

/// JSON summary of one run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Report<'a> {
    pub(crate) rules: Vec<RuleReport<'a>>,
    pub(crate) scan: ScanSummary<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) assembly: Option<&'a AssemblyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) trace_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RuleReport<'a> {
    pub(crate) config: &'a RuleConfig,
    pub(crate) target_class: &'a str,
    pub(crate) target_method: &'a str,
    pub(crate) matched: &'a BTreeSet<String>,
    pub(crate) injection: &'a InjectionOutcome,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ScanSummary<'a> {
    pub(crate) classes: usize,
    pub(crate) duplicates_skipped: usize,
    pub(crate) malformed_skipped: usize,
    pub(crate) malformed: &'a [String],
}

pub(crate) fn build_report<'a>(
    rules: &'a [Rule],
    scan: &'a ScanOutput,
    injection: &'a InjectionOutput,
    assembly: Option<&'a AssemblyReport>,
    trace_id: Option<String>,
) -> Report<'a> {
    let rules = rules
        .iter()
        .zip(&injection.outcomes)
        .enumerate()
        .map(|(index, (rule, outcome))| RuleReport {
            config: &rule.config,
            target_class: &rule.target_class,
            target_method: &rule.target_method,
            matched: scan.result.matches(index),
            injection: outcome,
        })
        .collect();
    Report {
        rules,
        scan: ScanSummary {
            classes: scan.class_count,
            duplicates_skipped: scan.duplicate_count,
            malformed_skipped: scan.malformed.len(),
            malformed: &scan.malformed,
        },
        assembly,
        trace_id,
    }
}

pub(crate) fn write_report(report: &Report<'_>, writer: &mut dyn Write) -> Result<()> {
    serde_json::to_writer_pretty(&mut *writer, report).context("failed to serialize report")?;
    writer
        .write_all(b"\n")
        .context("failed to write report")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::scan::ScanResult;

    fn rule() -> Rule {
        Rule::from_config(RuleConfig {
            scan_interface: "com.example.Greeter".to_string(),
            code_insert_to_class_name: "com.example.Registry".to_string(),
            register_method_name: "add".to_string(),
            ..RuleConfig::default()
        })
        .expect("rule")
    }

    #[test]
    fn report_lists_rules_in_configured_order() {
        let rules = vec![rule(), rule()];
        let scan = ScanOutput {
            result: ScanResult::from_matches(vec![
                BTreeSet::from(["com/example/Hello".to_string()]),
                BTreeSet::new(),
            ]),
            class_count: 3,
            duplicate_count: 1,
            malformed: vec!["Broken.class".to_string()],
        };
        let injection = InjectionOutput {
            outcomes: vec![
                InjectionOutcome::Injected {
                    entry_name: "com/example/Registry.class".to_string(),
                    scratch_path: PathBuf::from("work/classes/com/example/Registry.class"),
                    registered: 1,
                    methods: 1,
                },
                InjectionOutcome::NoMatches,
            ],
        };

        let report = build_report(&rules, &scan, &injection, None, None);
        let value = serde_json::to_value(&report).expect("serialize");

        assert_eq!(value["rules"][0]["matched"][0], "com/example/Hello");
        assert_eq!(value["rules"][0]["injection"]["status"], "injected");
        assert_eq!(
            value["rules"][0]["injection"]["entryName"],
            "com/example/Registry.class"
        );
        assert_eq!(value["rules"][0]["config"]["scanInterface"], "com.example.Greeter");
        assert_eq!(value["rules"][0]["targetMethod"], "<clinit>");
        assert_eq!(value["rules"][1]["injection"]["status"], "noMatches");
        assert_eq!(value["scan"]["malformedSkipped"], 1);
        assert_eq!(value["scan"]["duplicatesSkipped"], 1);
        assert!(value.get("assembly").is_none());
    }

    #[test]
    fn skipped_outcome_carries_kind_and_reason() {
        let outcome = InjectionOutcome::Skipped {
            kind: "targetClassNotFound",
            reason: "target class com/example/Gone not found in any input root".to_string(),
        };

        let value = serde_json::to_value(&outcome).expect("serialize");

        assert_eq!(value["status"], "skipped");
        assert_eq!(value["kind"], "targetClassNotFound");
    }

    #[test]
    fn write_report_ends_with_newline() {
        let rules = Vec::new();
        let scan = ScanOutput {
            result: ScanResult::from_matches(Vec::new()),
            class_count: 0,
            duplicate_count: 0,
            malformed: Vec::new(),
        };
        let injection = InjectionOutput {
            outcomes: Vec::new(),
        };
        let report = build_report(&rules, &scan, &injection, None, None);
        let mut buffer = Vec::new();

        write_report(&report, &mut buffer).expect("write");

        let text = String::from_utf8(buffer).expect("utf8");
        assert!(text.ends_with("}\n"));
        assert!(text.contains("\"rules\": []"));
    }
}
