//! Step result caching: fingerprints and cache collaborator payloads.
//!
//! A fingerprint is a stable digest of everything that determines a step's
//! output: the resolved command, resolved parameters, and the identity and
//! mtimes of its input artifacts.

use std::collections::BTreeMap;
use std::sync::Arc;

use ring::digest::{digest, SHA256};

use crate::error::Result;
use crate::fs::FsClient;

/// Lookup key for the cache collaborator.
#[derive(Debug, Clone)]
pub struct CacheQuery {
    pub fingerprint: String,
    pub fs_id: String,
    pub step_name: String,
    pub source: String,
}

/// A completed step offered to the cache collaborator.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub fingerprint: String,
    pub run_id: String,
    pub step_name: String,
    pub fs_id: String,
    pub source: String,
    /// Seconds of validity; negative means never expires.
    pub expired_time: i64,
}

/// Compute the fingerprint for one step.
///
/// Input artifact and fs-scope mtimes are read through the filesystem client
/// so that changed inputs invalidate prior results.
pub async fn step_fingerprint(
    fs: &Arc<dyn FsClient>,
    fs_id: &str,
    command: &str,
    parameters: &BTreeMap<String, String>,
    input_artifacts: &BTreeMap<String, String>,
    fs_scope: &str,
) -> Result<String> {
    let mut lines = Vec::new();
    lines.push(format!("fs:{}", fs_id));
    lines.push(format!("command:{}", command));
    for (key, value) in parameters {
        lines.push(format!("param:{}={}", key, value));
    }
    for (key, path) in input_artifacts {
        let mtime = fs.mtime(fs_id, path).await?;
        lines.push(format!("input:{}={}@{}", key, path, mtime));
    }
    for path in fs_scope.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mtime = fs.mtime(fs_id, path).await?;
        lines.push(format!("scope:{}@{}", path, mtime));
    }

    let joined = lines.join("\n");
    let hash = digest(&SHA256, joined.as_bytes());
    Ok(hex_encode(hash.as_ref()))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
