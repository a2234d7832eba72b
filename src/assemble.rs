use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::inputs::{Inputs, open_archive, relative_files};

/// What went into the output archive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AssemblyReport {
    pub(crate) output: PathBuf,
    pub(crate) entry_count: usize,
    pub(crate) substituted: Vec<String>,
    /// Entry names dropped because an earlier input already wrote them.
    pub(crate) duplicates: Vec<String>,
}

struct ArchiveBuilder<'a> {
    writer: ZipWriter<fs::File>,
    options: SimpleFileOptions,
    substitutions: &'a BTreeMap<String, PathBuf>,
    written: HashSet<String>,
    report: AssemblyReport,
}

impl ArchiveBuilder<'_> {
    /// Whether `name` is still free; records a duplicate otherwise.
    fn claim(&mut self, name: &str, source: &Path) -> bool {
        if self.written.contains(name) {
            tracing::warn!(entry = name, source = %source.display(), "dropping duplicate entry");
            self.report.duplicates.push(name.to_string());
            return false;
        }
        true
    }

    fn write_entry(&mut self, name: &str, original: impl FnOnce() -> Result<Vec<u8>>) -> Result<()> {
        let data = match self.substitutions.get(name) {
            Some(scratch) => {
                self.report.substituted.push(name.to_string());
                fs::read(scratch).with_context(|| format!("failed to read {}", scratch.display()))?
            }
            None => original()?,
        };
        self.writer
            .start_file(name, self.options)
            .with_context(|| format!("failed to start entry {name}"))?;
        self.writer
            .write_all(&data)
            .with_context(|| format!("failed to write entry {name}"))?;
        self.written.insert(name.to_string());
        self.report.entry_count += 1;
        Ok(())
    }
}

/// Merge every input into one archive at `output`, substituting rewritten classes.
///
/// Directories are copied before archives. The first entry written under a
/// name wins.
pub(crate) fn assemble_archive(
    inputs: &Inputs,
    substitutions: &BTreeMap<String, PathBuf>,
    output: &Path,
) -> Result<AssemblyReport> {
    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = fs::File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut builder = ArchiveBuilder {
        writer: ZipWriter::new(file),
        options: SimpleFileOptions::default(),
        substitutions,
        written: HashSet::new(),
        report: AssemblyReport {
            output: output.to_path_buf(),
            ..AssemblyReport::default()
        },
    };

    for directory in &inputs.directories {
        if !directory.is_dir() {
            tracing::warn!(directory = %directory.display(), "skipping missing directory");
            continue;
        }
        for name in relative_files(directory)? {
            if !builder.claim(&name, directory) {
                continue;
            }
            let path = directory.join(&name);
            builder.write_entry(&name, || {
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
            })?;
        }
    }

    for archive_path in &inputs.archives {
        let mut archive = open_archive(archive_path)?;
        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .with_context(|| format!("failed to read {}", archive_path.display()))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            if !builder.claim(&name, archive_path) {
                continue;
            }
            builder.write_entry(&name, || {
                let mut data = Vec::new();
                entry
                    .read_to_end(&mut data)
                    .with_context(|| format!("failed to read {}:{}", archive_path.display(), name))?;
                Ok(data)
            })?;
        }
    }

    builder
        .writer
        .finish()
        .with_context(|| format!("failed to finish {}", output.display()))?;
    tracing::info!(
        output = %output.display(),
        entries = builder.report.entry_count,
        duplicates = builder.report.duplicates.len(),
        "assembled output archive"
    );
    Ok(builder.report)
}
