//! Tool descriptors and the persisted catalog snapshot.
//!
//! The bridge supervisor writes a snapshot of every discovered tool to a
//! well-known path after discovery. The write is atomic (temp file +
//! rename) so readers observe either the previous document or the full
//! new one, never a truncated file.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool advertised by a tool server via `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name, unique within its server.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool's arguments, passed through untouched.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Extract descriptors from a `tools/list` response `result`.
    ///
    /// Unparseable entries are skipped; a missing `tools` member yields
    /// an empty list.
    #[must_use]
    pub fn from_list_result(result: &Value) -> Vec<Self> {
        result
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| serde_json::from_value(t.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Errors reading or writing the catalog snapshot.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Filesystem failure.
    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The snapshot document was not valid JSON.
    #[error("catalog JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The on-disk snapshot: `server name → advertised tools`.
///
/// Keys are ordered so repeated writes of the same catalog are
/// byte-identical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    /// Tools grouped by the server that advertises them.
    pub servers: BTreeMap<String, Vec<ToolDescriptor>>,
}

impl CatalogSnapshot {
    /// Read a snapshot from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if the file is unreadable or not a valid
    /// snapshot document.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let content = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Write the snapshot atomically to `path`.
    ///
    /// The document is written to a temp file in the same directory and
    /// renamed over the target, so concurrent readers never see a
    /// partial write.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if the directory cannot be created, the
    /// temp file cannot be written, or the rename fails.
    pub fn write_atomic(&self, path: impl AsRef<Path>) -> Result<(), CatalogError> {
        let path = path.as_ref();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.persist(path).map_err(|e| CatalogError::Io(e.error))?;
        Ok(())
    }
}
