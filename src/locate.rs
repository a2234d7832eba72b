use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AutoRegisterError;
use crate::inputs::{ClassLocation, Inputs, class_entry_name};

/// Target class bytes copied out of the inputs for rewriting.
#[derive(Clone, Debug)]
pub(crate) struct MaterializedTarget {
    pub(crate) location: ClassLocation,
    /// Entry name substituted in the assembled archive, e.g. `com/example/Registry.class`.
    pub(crate) entry_name: String,
    pub(crate) scratch_path: PathBuf,
    pub(crate) bytes: Vec<u8>,
}

/// Locate `class_name` and copy its bytes to `<work_dir>/classes/<class_name>.class`.
pub(crate) fn materialize_target(
    inputs: &Inputs,
    class_name: &str,
    work_dir: &Path,
) -> Result<MaterializedTarget, AutoRegisterError> {
    let location = inputs
        .locate(class_name)
        .ok_or_else(|| AutoRegisterError::TargetClassNotFound {
            class: class_name.to_string(),
        })?;
    let bytes = location.read_class(class_name)?;
    let entry_name = class_entry_name(class_name);
    let scratch_path = scratch_path(work_dir, &entry_name);
    write_scratch(&scratch_path, &bytes).map_err(|reason| AutoRegisterError::ClassExtraction {
        class: class_name.to_string(),
        location: location.to_string(),
        reason,
    })?;
    tracing::debug!(
        class = class_name,
        location = %location,
        scratch = %scratch_path.display(),
        "materialized target class"
    );
    Ok(MaterializedTarget {
        location,
        entry_name,
        scratch_path,
        bytes,
    })
}

pub(crate) fn scratch_path(work_dir: &Path, entry_name: &str) -> PathBuf {
    entry_name
        .split('/')
        .fold(work_dir.join("classes"), |path, part| path.join(part))
}

/// Write `bytes` to `path`, creating parent directories.
pub(crate) fn write_scratch(path: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed to create {}: {err}", parent.display()))?;
    }
    fs::write(path, bytes).map_err(|err| format!("failed to write {}: {err}", path.display()))
}
