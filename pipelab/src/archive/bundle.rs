//! Portable transfer bundles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::core::{Edge, LogEntry, PipelineRecord};
use crate::errors::EngineResult;
use crate::utils::Timestamp;

/// Bundle layout version written by this crate.
pub const BUNDLE_FORMAT_VERSION: u32 = 1;

/// Describes where a bundle came from and what it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// Layout version.
    pub format_version: u32,
    /// `t_YYYYmmdd_HHMMSS_<6 hex>` identifier of this transfer.
    pub transfer_id: String,
    /// Lab that produced the bundle.
    #[serde(default)]
    pub origin_lab_id: Option<String>,
    /// When the bundle was produced.
    pub created_at: Timestamp,
    /// Pipelines in the bundle, dependencies first.
    pub pplids: Vec<String>,
    /// Component locations the destination should resolve instead.
    #[serde(default)]
    pub component_map: BTreeMap<String, String>,
    /// Path prefixes the destination should rewrite in path arguments.
    #[serde(default)]
    pub path_map: BTreeMap<String, String>,
}

/// One pipeline and its log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundledPipeline {
    /// The record as it was in the source store.
    pub record: PipelineRecord,
    /// Its log entries in append order.
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

/// A self-contained export of pipelines, their edges and logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    /// Provenance and contents.
    pub manifest: BundleManifest,
    /// The exported pipelines.
    pub pipelines: Vec<BundledPipeline>,
    /// Edges whose endpoints are both in the bundle.
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Bundle {
    /// Returns the number of pipelines in the bundle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Returns true if the bundle holds no pipelines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Looks up a bundled pipeline by its source identifier.
    #[must_use]
    pub fn pipeline(&self, pplid: &str) -> Option<&BundledPipeline> {
        self.pipelines.iter().find(|p| p.record.pplid == pplid)
    }

    /// Serializes the bundle as JSON.
    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a bundle from JSON.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Writes the bundle to a file, creating parent directories.
    pub fn write_to(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a bundle from a file.
    pub fn read_from(path: impl AsRef<Path>) -> EngineResult<Self> {
        let reader = BufReader::new(fs::File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_utc;
    use pretty_assertions::assert_eq;

    fn empty_bundle() -> Bundle {
        Bundle {
            manifest: BundleManifest {
                format_version: BUNDLE_FORMAT_VERSION,
                transfer_id: "t_20240101_000000_00ff00".to_string(),
                origin_lab_id: None,
                created_at: now_utc(),
                pplids: Vec::new(),
                component_map: BTreeMap::new(),
                path_map: BTreeMap::from([("/base".to_string(), "/remote".to_string())]),
            },
            pipelines: Vec::new(),
            edges: Vec::new(),
        }
    }

    #[test]
    fn test_json_keeps_manifest() {
        let bundle = empty_bundle();
        let parsed = Bundle::from_json(&bundle.to_json().unwrap()).unwrap();
        assert_eq!(parsed, bundle);
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_optional_sections_default() {
        let json = r#"{
            "manifest": {
                "format_version": 1,
                "transfer_id": "t_20240101_000000_abcdef",
                "created_at": "2024-01-01T00:00:00Z",
                "pplids": []
            },
            "pipelines": []
        }"#;
        let bundle = Bundle::from_json(json).unwrap();
        assert!(bundle.edges.is_empty());
        assert!(bundle.manifest.component_map.is_empty());
        assert!(bundle.manifest.path_map.is_empty());
        assert_eq!(bundle.manifest.origin_lab_id, None);
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(Bundle::from_json("{\"manifest\": 3}").is_err());
    }
}
