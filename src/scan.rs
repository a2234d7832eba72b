use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use opentelemetry::{Context as OtelContext, KeyValue};
use rayon::prelude::*;

use crate::error::AutoRegisterError;
use crate::inputs::{
    Inputs, Root, archive_file_names, is_scannable_class_entry, open_archive,
    read_entry, readable_relative_files,
};
use crate::metadata::read_class_metadata;
use crate::rule::Rule;
use crate::telemetry::{Telemetry, with_child_span};

/// Matched class names per configured rule, in rule order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ScanResult {
    matches: Vec<BTreeSet<String>>,
}

impl ScanResult {
    fn empty(rule_count: usize) -> Self {
        Self {
            matches: vec![BTreeSet::new(); rule_count],
        }
    }

    #[cfg(test)]
    pub(crate) fn from_matches(matches: Vec<BTreeSet<String>>) -> Self {
        Self { matches }
    }

    /// Internal names matched by the rule at `rule_index`, sorted.
    pub(crate) fn matches(&self, rule_index: usize) -> &BTreeSet<String> {
        &self.matches[rule_index]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &BTreeSet<String>)> {
        self.matches.iter().enumerate()
    }
}

/// Scan result plus counters for diagnostics.
pub(crate) struct ScanOutput {
    pub(crate) result: ScanResult,
    pub(crate) class_count: usize,
    pub(crate) duplicate_count: usize,
    pub(crate) malformed: Vec<String>,
}

/// Outcome of scanning the entries one root owns.
#[derive(Default)]
struct RootScan {
    matched: Vec<(usize, String)>,
    class_count: usize,
    malformed: Vec<String>,
}

/// Scan every class reachable from `inputs` and evaluate each against all rules.
///
/// Roots are listed and scanned in parallel. A class name seen in more than
/// one root is owned by the first root in input order; later copies are skipped.
pub(crate) fn scan_inputs(
    inputs: &Inputs,
    rules: &[Rule],
    telemetry: Option<&Telemetry>,
) -> ScanOutput {
    let roots = inputs.roots();

    let listings: Vec<Vec<String>> = roots
        .par_iter()
        .map(|root| match list_class_entries(root) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(root = %root.path().display(), "failed to list classes: {err:#}");
                Vec::new()
            }
        })
        .collect();

    let mut seen = HashSet::new();
    let mut duplicate_count = 0;
    let owned: Vec<Vec<String>> = listings
        .into_iter()
        .map(|entries| {
            entries
                .into_iter()
                .filter(|entry| {
                    let claimed = seen.insert(entry.trim_end_matches(".class").to_string());
                    if !claimed {
                        duplicate_count += 1;
                    }
                    claimed
                })
                .collect()
        })
        .collect();

    let parent = OtelContext::current();
    let scans: Vec<RootScan> = roots
        .par_iter()
        .zip(owned.par_iter())
        .map(|(root, entries)| {
            let attributes = [
                KeyValue::new("autoreg.root", root.path().display().to_string()),
                KeyValue::new("autoreg.class_count", entries.len() as i64),
            ];
            with_child_span(telemetry, "scan.root", &attributes, &parent, || {
                scan_root(root, entries, rules)
            })
        })
        .collect();

    let mut result = ScanResult::empty(rules.len());
    let mut class_count = 0;
    let mut malformed = Vec::new();
    for scan in scans {
        class_count += scan.class_count;
        malformed.extend(scan.malformed);
        for (rule_index, class_name) in scan.matched {
            result.matches[rule_index].insert(class_name);
        }
    }
    malformed.sort();

    ScanOutput {
        result,
        class_count,
        duplicate_count,
        malformed,
    }
}

/// Class entry names (relative, `/`-separated) under one root.
fn list_class_entries(root: &Root<'_>) -> Result<Vec<String>> {
    let names = match root {
        Root::Directory(path) => {
            if !path.is_dir() {
                tracing::warn!(root = %path.display(), "directory root does not exist");
                return Ok(Vec::new());
            }
            readable_relative_files(path)?
        }
        Root::Archive(path) => {
            let mut names = archive_file_names(path)?;
            names.sort();
            names
        }
    };
    Ok(names
        .into_iter()
        .filter(|name| is_scannable_class_entry(name))
        .collect())
}

fn scan_root(root: &Root<'_>, entries: &[String], rules: &[Rule]) -> RootScan {
    match root {
        Root::Directory(path) => entries
            .par_iter()
            .map(|entry| {
                let origin = path.join(entry).display().to_string();
                let data = std::fs::read(path.join(entry))
                    .with_context(|| format!("failed to read {origin}"));
                (origin, data)
            })
            .map(|(origin, data)| {
                let mut scan = RootScan::default();
                record_class(&mut scan, &origin, data, rules);
                scan
            })
            .reduce(RootScan::default, merge_scans),
        Root::Archive(path) => scan_archive(path, entries, rules),
    }
}

fn scan_archive(path: &Path, entries: &[String], rules: &[Rule]) -> RootScan {
    let mut scan = RootScan::default();
    if entries.is_empty() {
        return scan;
    }
    let mut archive = match open_archive(path) {
        Ok(archive) => archive,
        Err(err) => {
            tracing::error!(archive = %path.display(), "failed to scan archive: {err:#}");
            return scan;
        }
    };
    for entry in entries {
        let origin = format!("{}!/{}", path.display(), entry);
        let data = read_entry(&mut archive, path, entry);
        record_class(&mut scan, &origin, data, rules);
    }
    scan
}

fn record_class(scan: &mut RootScan, origin: &str, data: Result<Vec<u8>>, rules: &[Rule]) {
    let data = match data {
        Ok(data) => data,
        Err(err) => {
            tracing::warn!(class = origin, "skipping unreadable class: {err:#}");
            scan.malformed.push(origin.to_string());
            return;
        }
    };
    match evaluate_class(&data, origin, rules) {
        Ok((class_name, matched_rules)) => {
            scan.class_count += 1;
            for rule_index in matched_rules {
                scan.matched.push((rule_index, class_name.clone()));
            }
        }
        Err(err) => {
            tracing::warn!("skipping class: {err}");
            scan.malformed.push(origin.to_string());
        }
    }
}

/// Parse one class and return its name with the indices of every rule it satisfies.
pub(crate) fn evaluate_class(
    data: &[u8],
    origin: &str,
    rules: &[Rule],
) -> Result<(String, Vec<usize>), AutoRegisterError> {
    let metadata = read_class_metadata(data, origin)?;
    let matched = rules
        .iter()
        .enumerate()
        .filter(|(_, rule)| rule.accepts(&metadata))
        .map(|(index, _)| index)
        .collect();
    Ok((metadata.name, matched))
}

fn merge_scans(mut left: RootScan, right: RootScan) -> RootScan {
    left.matched.extend(right.matched);
    left.class_count += right.class_count;
    left.malformed.extend(right.malformed);
    left
}
