//! Data model: Project, Release, Release File, Serial.

use crate::normalize::normalize;
use crate::pep440::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Serial = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digests {
    pub sha256: String,
    #[serde(default)]
    pub md5: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseFile {
    pub url: String,
    pub filename: String,
    pub packagetype: String,
    #[serde(default)]
    pub requires_python: Option<String>,
    pub size: u64,
    pub digests: Digests,
    #[serde(default)]
    pub yanked: bool,
    #[serde(default)]
    pub upload_time: Option<String>,
}

impl ReleaseFile {
    /// `packages/<b1b2>/<b3b4>/<rest-of-sha256>/<filename>`
    pub fn canonical_path(&self) -> String {
        content_addressed_path(&self.digests.sha256, &self.filename)
    }
}

pub fn content_addressed_path(sha256: &str, filename: &str) -> String {
    let sha256 = sha256.to_ascii_lowercase();
    let b1b2 = &sha256[0..2];
    let b3b4 = &sha256[2..4];
    let rest = &sha256[4..];
    format!("packages/{b1b2}/{b3b4}/{rest}/{filename}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub version: String,
    #[serde(default)]
    pub upload_time: Option<String>,
    /// Mirrored but flagged in index output with `data-yanked`.
    /// Warehouse reports yanked status per-file; a release is treated as
    /// yanked when every one of its files is.
    #[serde(default)]
    pub yanked: bool,
    pub files: Vec<ReleaseFile>,
}

impl Release {
    /// PEP 440: any non-empty pre, dev, or explicit marker.
    pub fn is_prerelease(&self) -> bool {
        self.version
            .parse::<Version>()
            .map(|v| v.is_prerelease())
            .unwrap_or(false)
    }

    pub fn parsed_version(&self) -> Option<Version> {
        self.version.parse().ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// PEP 503-normalized name.
    pub name: String,
    pub last_serial: Serial,
    pub releases: BTreeMap<String, Release>,
}

impl Project {
    pub fn from_upstream(raw_name: &str, last_serial: Serial, releases: BTreeMap<String, Release>) -> Self {
        Self {
            name: normalize(raw_name),
            last_serial,
            releases,
        }
    }

    pub fn all_files(&self) -> impl Iterator<Item = &ReleaseFile> {
        self.releases.values().flat_map(|r| r.files.iter())
    }

    pub fn total_size(&self) -> u64 {
        self.all_files().map(|f| f.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_path_splits_sha256() {
        let path = content_addressed_path(
            "bc9430dae93f8bc53728773545cbb646a6b5327f98de31bdd6e1a2b2c6e805a",
            "peerme-1.0.0-py36-none-any.whl",
        );
        assert_eq!(
            path,
            "packages/bc/94/30dae93f8bc53728773545cbb646a6b5327f98de31bdd6e1a2b2c6e805a/peerme-1.0.0-py36-none-any.whl"
        );
    }

    #[test]
    fn project_name_is_normalized_on_construction() {
        let project = Project::from_upstream("My_Package.Name", 1, BTreeMap::new());
        assert_eq!(project.name, "my-package-name");
    }
}
