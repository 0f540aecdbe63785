//! Build a spec from a directory of numbered step files.
//!
//! A protocol root holding `01-scaffold.md`, `02-implement.md`, ... becomes a
//! spec with one step per file, in file-name order.

use glob::glob;
use std::fs;
use std::path::Path;

use crate::error::{ProtoflowError, Result};
use crate::spec::model::{ProtocolSpec, SpecDefaults, StepSpec};

/// Collect `NN-*.md` files under `protocol_root` into a spec.
///
/// Files whose name does not start with two digits (README, plan notes) are
/// ignored. Each file's content becomes the step prompt.
pub fn build_spec_from_files(protocol_root: &Path, defaults: SpecDefaults) -> Result<ProtocolSpec> {
    let pattern = protocol_root.join("*.md");
    let pattern = pattern
        .to_str()
        .ok_or_else(|| ProtoflowError::Storage(format!("non UTF-8 path: {}", protocol_root.display())))?;

    let mut files = Vec::new();
    for entry in glob(pattern).map_err(|e| ProtoflowError::Storage(e.to_string()))? {
        let path = entry.map_err(|e| ProtoflowError::Storage(e.to_string()))?;
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.len() >= 2 && name.as_bytes()[..2].iter().all(u8::is_ascii_digit) {
            files.push((name.to_string(), path));
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut steps = Vec::with_capacity(files.len());
    for (name, path) in files {
        let content = fs::read_to_string(&path)?;
        let mut step = StepSpec::new(name).with_prompt(content);
        step.description = Some(path.display().to_string());
        steps.push(step);
    }

    log::debug!("Built spec with {} step(s) from {}", steps.len(), protocol_root.display());
    Ok(ProtocolSpec { defaults, steps })
}
