//! Resume state for both engines.
//!
//! The segmented engine persists a `ResumeDescriptor` at `<dest>.state`; the
//! single-stream engine persists a `SingleStreamRecord` at `<dest>.resume`.
//! Before reusing either, the stored URL, size and validators are compared
//! with a fresh probe. Any mismatch means the state is archived and the
//! download starts over.

mod descriptor;
mod single;
mod validate;

pub use descriptor::{ResumeDescriptor, SegmentRecord, SCHEMA_VERSION};
pub use single::SingleStreamRecord;
pub use validate::{
    resume_offset, validate_layout, validate_remote, ValidationError, ValidationErrorKind,
};

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::FetchError;

/// Reads a versioned JSON state file. `Ok(None)` if the file does not exist.
/// Unparseable files and unknown schema versions are `ResumeStateInvalid`.
fn load_versioned<T: DeserializeOwned>(
    path: &Path,
    version_of: impl Fn(&T) -> u32,
) -> Result<Option<T>, FetchError> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value: T = serde_json::from_slice(&data).map_err(|e| {
        FetchError::ResumeStateInvalid(format!("{}: {}", path.display(), e))
    })?;
    let version = version_of(&value);
    if version != SCHEMA_VERSION {
        return Err(FetchError::ResumeStateInvalid(format!(
            "{}: schema version {} (expected {})",
            path.display(),
            version,
            SCHEMA_VERSION
        )));
    }
    Ok(Some(value))
}
