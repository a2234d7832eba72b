mod assemble;
mod bytecode;
mod classfile;
mod config;
mod descriptor;
mod error;
mod inject;
mod inputs;
mod locate;
mod metadata;
mod opcodes;
mod report;
mod rule;
mod scan;
mod telemetry;
#[cfg(test)]
mod test_harness;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::KeyValue;

use crate::assemble::assemble_archive;
use crate::config::load_rules;
use crate::inject::inject_all;
use crate::inputs::Inputs;
use crate::report::{build_report, write_report};
use crate::scan::scan_inputs;
use crate::telemetry::{Telemetry, current_trace_id, init_logging, with_span};

/// CLI arguments for autoreg execution.
#[derive(Parser, Debug)]
#[command(
    name = "autoreg",
    about = "Find JVM classes by interface or superclass and register them in a target class's initializer.",
    version
)]
struct Cli {
    /// Directory of compiled classes; repeat to scan several, in order.
    #[arg(long = "dir", value_name = "PATH")]
    dirs: Vec<PathBuf>,
    /// Jar or zip archive; repeat to scan several, in order.
    #[arg(long = "jar", value_name = "PATH")]
    jars: Vec<PathBuf>,
    /// JSON rule file; rules from several files are concatenated.
    #[arg(long = "config", value_name = "PATH", required = true)]
    configs: Vec<PathBuf>,
    /// Scratch directory for rewritten target classes.
    #[arg(long, value_name = "PATH", default_value = "build/autoreg")]
    work_dir: PathBuf,
    /// Write a merged archive with rewritten classes substituted.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Report destination; `-` or absent writes to stdout.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
    /// OTLP/HTTP endpoint for trace export.
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let telemetry = match cli.otel.clone() {
        Some(endpoint) => Some(Telemetry::new(endpoint)?),
        None => None,
    };
    let result = with_span(telemetry.as_ref(), "autoreg", &[], || {
        run(cli, telemetry.as_ref())
    });
    if let Some(telemetry) = &telemetry {
        if let Err(err) = telemetry.shutdown() {
            tracing::warn!("{err:#}");
        }
    }
    result
}

fn run(cli: Cli, telemetry: Option<&Telemetry>) -> Result<()> {
    for path in cli.dirs.iter().chain(&cli.jars) {
        if !path.exists() {
            anyhow::bail!("input not found: {}", path.display());
        }
    }
    let rules = load_rules(&cli.configs)?;
    let inputs = Inputs {
        directories: cli.dirs,
        archives: cli.jars,
    };

    let started_at = Instant::now();
    let scan_attributes = [
        KeyValue::new("autoreg.rule_count", rules.len() as i64),
        KeyValue::new(
            "autoreg.root_count",
            (inputs.directories.len() + inputs.archives.len()) as i64,
        ),
    ];
    let scan = with_span(telemetry, "scan", &scan_attributes, || {
        scan_inputs(&inputs, &rules, telemetry)
    });
    let scan_duration_ms = started_at.elapsed().as_millis();
    for (index, matched) in scan.result.iter() {
        tracing::info!(rule = %rules[index].label(), matched = matched.len(), "scanned");
    }

    let inject_started_at = Instant::now();
    let injection = with_span(telemetry, "inject", &[], || {
        inject_all(&inputs, &rules, &scan.result, &cli.work_dir, telemetry)
    });
    let inject_duration_ms = inject_started_at.elapsed().as_millis();

    let assemble_started_at = Instant::now();
    let assembly = match &cli.output {
        Some(output) => Some(with_span(telemetry, "assemble", &[], || {
            assemble_archive(&inputs, &injection.substitutions(), output)
        })?),
        None => None,
    };
    let assemble_duration_ms = assemble_started_at.elapsed().as_millis();

    if !cli.quiet {
        let report = build_report(
            &rules,
            &scan,
            &injection,
            assembly.as_ref(),
            current_trace_id(),
        );
        let mut writer = report_writer(cli.report.as_deref())?;
        write_report(&report, &mut writer)?;
    }

    if cli.timing {
        eprintln!(
            "timing: total_ms={} scan_ms={} inject_ms={} assemble_ms={} classes={} injected={}",
            started_at.elapsed().as_millis(),
            scan_duration_ms,
            inject_duration_ms,
            assemble_duration_ms,
            scan.class_count,
            injection.injected_count()
        );
    }

    Ok(())
}

fn report_writer(report: Option<&Path>) -> Result<Box<dyn Write>> {
    match report {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}
