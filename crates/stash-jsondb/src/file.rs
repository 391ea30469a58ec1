//! The on-disk format: one JSON object from flattened key to value,
//! tab-indented. An empty value is stored as `null` and `null` loads back as
//! an empty value.

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use stash_core::{Logger, StoreError, StoreResult};

/// Read `path` into `(key, json bytes)` pairs. A missing file is empty.
pub fn load(path: &Path) -> StoreResult<Vec<(String, Vec<u8>)>> {
    let text = match std::fs::read(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if text.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let object: Map<String, Value> = serde_json::from_slice(&text).map_err(|e| {
        StoreError::Serialization(format!("{}: {e}", path.display()))
    })?;
    object
        .into_iter()
        .map(|(key, value)| -> StoreResult<(String, Vec<u8>)> {
            match value {
                Value::Null => Ok((key, Vec::new())),
                value => Ok((key, serde_json::to_vec(&value)?)),
            }
        })
        .collect()
}

/// Render entries as the tab-indented JSON document.
///
/// A value that is not JSON is logged and written as `null`; the other keys
/// are saved regardless.
pub fn render<'a>(
    entries: impl IntoIterator<Item = (&'a String, &'a Vec<u8>)>,
    logger: &dyn Logger,
) -> StoreResult<Vec<u8>> {
    let mut object = Map::new();
    for (key, raw) in entries {
        let value = if raw.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(raw).unwrap_or_else(|e| {
                logger.warn(format_args!("value of {key:?} is not JSON, saved as null: {e}"));
                Value::Null
            })
        };
        object.insert(key.clone(), value);
    }

    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"\t"));
    object.serialize(&mut ser)?;
    Ok(out)
}

/// Replace `path` with `contents` through a temporary file in the same
/// directory, so readers never see a partial document.
pub fn write_atomic(path: &Path, contents: &[u8]) -> StoreResult<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}
