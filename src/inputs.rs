use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use zip::ZipArchive;

use crate::error::AutoRegisterError;

/// Every compiled class in scope: directory roots first, then archives.
#[derive(Clone, Debug, Default)]
pub(crate) struct Inputs {
    pub(crate) directories: Vec<PathBuf>,
    pub(crate) archives: Vec<PathBuf>,
}

/// One input root.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Root<'a> {
    Directory(&'a Path),
    Archive(&'a Path),
}

impl Root<'_> {
    pub(crate) fn path(&self) -> &Path {
        match self {
            Root::Directory(path) | Root::Archive(path) => *path,
        }
    }
}

/// Root that holds a given class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ClassLocation {
    Directory(PathBuf),
    Archive(PathBuf),
}

impl fmt::Display for ClassLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassLocation::Directory(path) => write!(f, "directory {}", path.display()),
            ClassLocation::Archive(path) => write!(f, "archive {}", path.display()),
        }
    }
}

impl ClassLocation {
    /// Read the bytes of `class_name` (internal form) from this root.
    pub(crate) fn read_class(&self, class_name: &str) -> Result<Vec<u8>, AutoRegisterError> {
        let entry = class_entry_name(class_name);
        let result = match self {
            ClassLocation::Directory(root) => {
                let path = root.join(&entry);
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
            }
            ClassLocation::Archive(path) => read_archive_entry(path, &entry),
        };
        result.map_err(|err| AutoRegisterError::ClassExtraction {
            class: class_name.to_string(),
            location: self.to_string(),
            reason: format!("{err:#}"),
        })
    }
}

impl Inputs {
    pub(crate) fn roots(&self) -> Vec<Root<'_>> {
        self.directories
            .iter()
            .map(|path| Root::Directory(path.as_path()))
            .chain(self.archives.iter().map(|path| Root::Archive(path.as_path())))
            .collect()
    }

    /// Find the root holding `class_name`, trying directories before archives.
    pub(crate) fn locate(&self, class_name: &str) -> Option<ClassLocation> {
        let entry = class_entry_name(class_name);
        for directory in &self.directories {
            let candidate = directory.join(&entry);
            let found = candidate.is_file();
            tracing::debug!(class = class_name, path = %candidate.display(), found, "probe directory");
            if found {
                return Some(ClassLocation::Directory(directory.clone()));
            }
        }
        for archive in &self.archives {
            match archive_contains(archive, &entry) {
                Ok(true) => {
                    tracing::debug!(class = class_name, archive = %archive.display(), "found in archive");
                    return Some(ClassLocation::Archive(archive.clone()));
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(archive = %archive.display(), "failed to probe archive: {err:#}");
                }
            }
        }
        None
    }
}

/// `com/example/Foo` -> `com/example/Foo.class`.
pub(crate) fn class_entry_name(class_name: &str) -> String {
    format!("{class_name}.class")
}

/// Archive or relative directory entry that should be scanned as a class.
pub(crate) fn is_scannable_class_entry(name: &str) -> bool {
    name.ends_with(".class")
        && !name.ends_with("module-info.class")
        && !name.starts_with("META-INF/versions/")
}

/// Relative `/`-separated paths of every file under `root`, sorted per directory.
pub(crate) fn relative_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    walk_dir(root, root, &mut files, false)?;
    Ok(files)
}

/// Like [`relative_files`], but an unreadable subdirectory is logged and
/// skipped instead of failing the whole root.
pub(crate) fn readable_relative_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    walk_dir(root, root, &mut files, true)?;
    Ok(files)
}

fn walk_dir(root: &Path, path: &Path, files: &mut Vec<String>, lenient: bool) -> Result<()> {
    let entries = match sorted_entries(path) {
        Ok(entries) => entries,
        Err(err) if lenient && path != root => {
            tracing::warn!(directory = %path.display(), "skipping unreadable directory: {err:#}");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    for entry in entries {
        if entry.is_dir() {
            walk_dir(root, &entry, files, lenient)?;
        } else if let Ok(relative) = entry.strip_prefix(root) {
            let name = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(name);
        }
    }
    Ok(())
}

fn sorted_entries(path: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }
    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));
    Ok(entries)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

pub(crate) fn open_archive(path: &Path) -> Result<ZipArchive<fs::File>> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))
}

/// File entry names of an archive in stored order.
pub(crate) fn archive_file_names(path: &Path) -> Result<Vec<String>> {
    let mut archive = open_archive(path)?;
    let mut names = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        names.push(entry.name().to_string());
    }
    Ok(names)
}

pub(crate) fn read_entry(
    archive: &mut ZipArchive<fs::File>,
    path: &Path,
    name: &str,
) -> Result<Vec<u8>> {
    let mut entry = archive
        .by_name(name)
        .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
    let mut data = Vec::new();
    entry
        .read_to_end(&mut data)
        .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
    Ok(data)
}

fn read_archive_entry(path: &Path, name: &str) -> Result<Vec<u8>> {
    let mut archive = open_archive(path)?;
    read_entry(&mut archive, path, name)
}

fn archive_contains(path: &Path, name: &str) -> Result<bool> {
    let mut archive = open_archive(path)?;
    let found = archive.by_name(name).is_ok();
    Ok(found)
}
