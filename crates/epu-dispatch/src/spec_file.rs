use std::{fs, path::Path};

use epu_core::ProcessSpec;
use serde_json::Value;

use crate::SpecLoadError;

/// Reads a process spec document: a non-empty JSON object.
pub fn load_process_spec(path: impl AsRef<Path>) -> Result<ProcessSpec, SpecLoadError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| SpecLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let document: Value = serde_json::from_slice(&bytes).map_err(|source| SpecLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let Value::Object(fields) = document else {
        return Err(SpecLoadError::NotAnObject {
            path: path.to_path_buf(),
        });
    };
    if fields.is_empty() {
        return Err(SpecLoadError::Empty {
            path: path.to_path_buf(),
        });
    }

    Ok(ProcessSpec::from(fields))
}
