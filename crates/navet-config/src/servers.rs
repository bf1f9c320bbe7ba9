// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Persistent tool-server registry file.
//!
//! A human-editable JSON file mapping service names to their URLs (plus an
//! optional environment block for servers the operator launches out of band):
//!
//! ```json
//! {
//!   "servers": {
//!     "weather": { "url": "http://127.0.0.1:8001/sse" },
//!     "vehicle": { "url": "http://127.0.0.1:8002/sse", "env": { "KEY": "…" } }
//!   }
//! }
//! ```
//!
//! The file drives nothing but startup attachment: every entry is attached on
//! boot, and a successful `/register` appends its entry here.  Writes are
//! additive; removing an entry is an explicit operation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One configured tool server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEntry {
    pub url: String,
    /// Environment variables for out-of-band server launch; opaque to the hub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

/// The on-disk file: `{name → entry}` under a single `servers` key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerFile {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerEntry>,
}

/// Default location: `~/.config/navet/servers.json`.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/navet/servers.json")
}

/// Load the server file.  A missing file is an empty registry, not an error;
/// a malformed file is reported and treated as empty so a typo cannot keep
/// the hub from starting.
pub fn load(path: &Path) -> ServerFile {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return ServerFile::default(),
    };
    match serde_json::from_str(&text) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed server file; ignoring");
            ServerFile::default()
        }
    }
}

/// Write the server file, creating parent directories as needed.
pub fn save(path: &Path, file: &ServerFile) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(file)?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

/// Add (or replace) one entry and persist.  Load-modify-save so concurrent
/// manual edits to other entries are preserved.
pub fn add_server(path: &Path, name: &str, url: &str) -> anyhow::Result<()> {
    let mut file = load(path);
    file.servers.insert(
        name.to_string(),
        ServerEntry {
            url: url.to_string(),
            env: None,
        },
    );
    save(path, &file)
}

/// Remove one entry and persist.  Returns whether the entry existed.
pub fn remove_server(path: &Path, name: &str) -> anyhow::Result<bool> {
    let mut file = load(path);
    let existed = file.servers.remove(name).is_some();
    if existed {
        save(path, &file)?;
    }
    Ok(existed)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = load(&dir.path().join("servers.json"));
        assert!(file.servers.is_empty());
    }

    #[test]
    fn malformed_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load(&path).servers.is_empty());
    }

    #[test]
    fn add_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        add_server(&path, "weather", "http://127.0.0.1:8001/sse").unwrap();
        let file = load(&path);
        assert_eq!(
            file.servers["weather"].url,
            "http://127.0.0.1:8001/sse".to_string()
        );
    }

    #[test]
    fn add_is_additive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        add_server(&path, "a", "http://a/sse").unwrap();
        add_server(&path, "b", "http://b/sse").unwrap();
        let file = load(&path);
        assert_eq!(file.servers.len(), 2);
        assert_eq!(file.servers["a"].url, "http://a/sse");
    }

    #[test]
    fn add_same_name_replaces_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        add_server(&path, "a", "http://old/sse").unwrap();
        add_server(&path, "a", "http://new/sse").unwrap();
        let file = load(&path);
        assert_eq!(file.servers.len(), 1);
        assert_eq!(file.servers["a"].url, "http://new/sse");
    }

    #[test]
    fn remove_reports_existence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        add_server(&path, "a", "http://a/sse").unwrap();
        assert!(remove_server(&path, "a").unwrap());
        assert!(!remove_server(&path, "a").unwrap());
        assert!(load(&path).servers.is_empty());
    }

    #[test]
    fn env_block_survives_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        let mut file = ServerFile::default();
        let mut env = BTreeMap::new();
        env.insert("API_KEY".to_string(), "secret".to_string());
        file.servers.insert(
            "svc".to_string(),
            ServerEntry {
                url: "http://svc/sse".to_string(),
                env: Some(env),
            },
        );
        save(&path, &file).unwrap();
        assert_eq!(load(&path), file);
    }
}
