//! Index document publication: legacy HTML and JSON simple-index writers.
//!
//! Generates the three representations of a project's simple index (legacy
//! HTML, versioned HTML, versioned JSON) plus the project's JSON metadata
//! mirror, and the root simple index that lists every mirrored project.
//! Every write goes through the storage abstraction's atomic `write`/`mv`,
//! so a reader never observes a half-written index.

use crate::config::{MirrorConfig, SimpleFormat};
use crate::model::{Release, Serial};
use crate::normalize::normalize;
use crate::storage::{Storage, StorageError};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, IndexError>;

fn web_path(relative: &str) -> String {
    format!("web/{relative}")
}

/// `simple/<first-letter>/<project>/` under `hash-index`, else
/// `simple/<project>/` (the two layouts are mutually
/// exclusive per mirror). Always web-rooted.
pub fn project_dir(cfg: &MirrorConfig, project: &str) -> String {
    let name = normalize(project);
    if cfg.hash_index {
        let first = name.chars().next().unwrap_or('_');
        web_path(&format!("simple/{first}/{name}/"))
    } else {
        web_path(&format!("simple/{name}/"))
    }
}

fn file_url(cfg: &MirrorConfig, relative_canonical_path: &str) -> String {
    if cfg.release_files {
        // project_dir() puts the index 2 levels below web/ (simple/<name>/)
        // in the flat layout, 3 levels below under hash-index
        // (simple/<letter>/<name>/); the "../" count must match.
        let up = if cfg.hash_index { "../../../" } else { "../../" };
        format!("{up}{relative_canonical_path}")
    } else {
        format!("{}{relative_canonical_path}", cfg.root_uri)
    }
}

fn build_legacy_html(cfg: &MirrorConfig, project: &str, releases: &BTreeMap<String, Release>) -> String {
    let mut out = String::new();
    out.push_str("<!DOCTYPE html>\n<html>\n<head><title>Links for ");
    out.push_str(project);
    out.push_str("</title></head>\n<body>\n<h1>Links for ");
    out.push_str(project);
    out.push_str("</h1>\n");
    for release in releases.values() {
        for file in &release.files {
            let url = file_url(cfg, &file.canonical_path());
            out.push_str(&format!(
                "<a href=\"{url}#sha256={sha}\"{req}{yanked}>{name}</a><br/>\n",
                url = url,
                sha = file.digests.sha256,
                req = file
                    .requires_python
                    .as_ref()
                    .map(|r| format!(" data-requires-python=\"{}\"", html_escape(r)))
                    .unwrap_or_default(),
                yanked = if file.yanked { " data-yanked=\"\"".to_string() } else { String::new() },
                name = file.filename,
            ));
        }
    }
    out.push_str("</body>\n</html>\n");
    out
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;").replace('>', "&gt;")
}

fn build_json(project: &str, releases: &BTreeMap<String, Release>) -> serde_json::Value {
    let files: Vec<serde_json::Value> = releases
        .values()
        .flat_map(|r| r.files.iter())
        .map(|f| {
            let mut hashes = serde_json::Map::new();
            hashes.insert("sha256".into(), serde_json::Value::String(f.digests.sha256.clone()));
            if let Some(md5) = &f.digests.md5 {
                hashes.insert("md5".into(), serde_json::Value::String(md5.clone()));
            }
            serde_json::json!({
                "filename": f.filename,
                "url": f.url,
                "hashes": hashes,
                "requires-python": f.requires_python,
                "yanked": f.yanked,
                "size": f.size,
                "upload-time": f.upload_time,
            })
        })
        .collect();
    serde_json::json!({
        "meta": {"api-version": "1.0"},
        "name": normalize(project),
        "files": files,
    })
}

/// Writes `index.html`/`index.v1_html`/`index.v1_json` for one project,
/// subject to `simple-format`, with `keep_index_versions` rotation
/// when configured. `serial` is the project's just-fetched `last_serial`,
/// recorded in rotated version filenames.
pub async fn write_project_index(
    storage: &dyn Storage,
    cfg: &MirrorConfig,
    project: &str,
    releases: &BTreeMap<String, Release>,
    serial: Serial,
) -> Result<()> {
    let dir = project_dir(cfg, project);
    let html = build_legacy_html(cfg, project, releases);
    let json = build_json(project, releases);
    let json_text = serde_json::to_string_pretty(&json).unwrap_or_default();

    if matches!(cfg.simple_format, SimpleFormat::Html | SimpleFormat::All) {
        publish_one(storage, cfg, &dir, "index.html", html.clone(), serial).await?;
        publish_one(storage, cfg, &dir, "index.v1_html", html, serial).await?;
    }
    if matches!(cfg.simple_format, SimpleFormat::Json | SimpleFormat::All) {
        publish_one(storage, cfg, &dir, "index.v1_json", json_text, serial).await?;
    }
    Ok(())
}

/// Writes `contents` to `<dir><name>` directly, or — when
/// `keep_index_versions > 0` — rotates the previous version into
/// `versions/index_<serial>_<timestamp>.<ext>` and makes `<name>` a pointer
/// (symlink, emulated where unsupported) to the new version.
async fn publish_one(
    storage: &dyn Storage,
    cfg: &MirrorConfig,
    dir: &str,
    name: &str,
    contents: String,
    serial: Serial,
) -> Result<()> {
    let path = format!("{dir}{name}");
    if cfg.keep_index_versions == 0 {
        storage.write(&path, contents).await?;
        return Ok(());
    }

    let ext = name.rsplit('.').next().unwrap_or("html");
    let timestamp = unix_now();
    let versioned_name = format!("index_{serial}_{timestamp}.{ext}");
    let versioned = format!("{dir}versions/{versioned_name}");
    storage.write(&versioned, contents).await?;
    prune_old_versions(storage, dir, ext, cfg.keep_index_versions).await?;
    storage.symlink(&format!("versions/{versioned_name}"), &path).await?;
    Ok(())
}

async fn prune_old_versions(storage: &dyn Storage, dir: &str, ext: &str, keep: u32) -> Result<()> {
    let versions_dir = format!("{dir}versions/");
    let mut entries: Vec<String> = storage
        .scandir(&versions_dir)
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|e| e.ends_with(&format!(".{ext}")))
        .collect();
    entries.sort();
    if entries.len() as u32 > keep {
        let drop_count = entries.len() - keep as usize;
        for stale in entries.drain(0..drop_count) {
            let _ = storage.delete(&format!("{versions_dir}{stale}")).await;
        }
    }
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// `web/json/<project>` plus a `web/pypi/<project>/json` pointer
/// the project's last release is mirrored.
pub async fn write_project_json(storage: &dyn Storage, project: &str, raw: &serde_json::Value) -> Result<()> {
    let name = normalize(project);
    let json_path = web_path(&format!("json/{name}"));
    let text = serde_json::to_string(raw).unwrap_or_default();
    storage.write(&json_path, text).await?;

    let pypi_dir = web_path(&format!("pypi/{name}/"));
    storage.mkdir(&pypi_dir).await?;
    storage
        .symlink(&format!("../../json/{name}"), &format!("{pypi_dir}json"))
        .await?;
    Ok(())
}

/// Regenerates the root simple index listing every mirrored project, by
/// walking `web/simple/` (honoring `hash-index` layout) rather than
/// tracking project names separately — the on-disk tree is authoritative.
pub async fn regenerate_root_index(storage: &dyn Storage, cfg: &MirrorConfig) -> Result<()> {
    let projects = discover_mirrored_projects(storage, cfg).await?;

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head><title>Simple Index</title></head>\n<body>\n");
    for project in &projects {
        html.push_str(&format!("<a href=\"{project}/\">{project}</a><br/>\n"));
    }
    html.push_str("</body>\n</html>\n");

    let json = serde_json::json!({
        "meta": {"api-version": "1.0"},
        "projects": projects.iter().map(|p| serde_json::json!({"name": p})).collect::<Vec<_>>(),
    });

    if matches!(cfg.simple_format, SimpleFormat::Html | SimpleFormat::All) {
        storage.write(&web_path("simple/index.html"), html.clone()).await?;
        storage.write(&web_path("simple/index.v1_html"), html).await?;
    }
    if matches!(cfg.simple_format, SimpleFormat::Json | SimpleFormat::All) {
        storage
            .write(&web_path("simple/index.v1_json"), serde_json::to_string_pretty(&json).unwrap_or_default())
            .await?;
    }
    Ok(())
}

pub(crate) async fn discover_mirrored_projects(storage: &dyn Storage, cfg: &MirrorConfig) -> Result<Vec<String>> {
    let mut projects = Vec::new();
    if cfg.hash_index {
        for letter in storage.scandir(&web_path("simple/")).await.unwrap_or_default() {
            if letter.len() != 1 {
                continue;
            }
            for entry in storage.scandir(&web_path(&format!("simple/{letter}/"))).await.unwrap_or_default() {
                projects.push(entry);
            }
        }
    } else {
        for entry in storage.scandir(&web_path("simple/")).await.unwrap_or_default() {
            if entry.contains('.') {
                // top-level files (index.html etc.) sit alongside project dirs.
                continue;
            }
            projects.push(entry);
        }
    }
    projects.sort();
    projects.dedup();
    Ok(projects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Digests, ReleaseFile};

    fn cfg() -> MirrorConfig {
        MirrorConfig::from_str("[mirror]\ndirectory=/tmp/m\nmaster=https://pypi.org\n").unwrap()
    }

    #[test]
    fn project_dir_uses_flat_layout_by_default() {
        assert_eq!(project_dir(&cfg(), "PeerMe"), "web/simple/peerme/");
    }

    #[test]
    fn file_url_href_depth_matches_flat_project_dir() {
        // web/simple/<name>/index.html is 2 levels below web/.
        assert_eq!(file_url(&cfg(), "packages/bc/94/rest/x.whl"), "../../packages/bc/94/rest/x.whl");
    }

    #[test]
    fn file_url_href_depth_matches_hash_project_dir() {
        // web/simple/<letter>/<name>/index.html is 3 levels below web/.
        let text = "[mirror]\ndirectory=/tmp/m\nmaster=https://pypi.org\nhash-index=true\n";
        let cfg = MirrorConfig::from_str(text).unwrap();
        assert_eq!(file_url(&cfg, "packages/bc/94/rest/x.whl"), "../../../packages/bc/94/rest/x.whl");
    }

    #[test]
    fn project_dir_uses_hash_layout_when_enabled() {
        let text = "[mirror]\ndirectory=/tmp/m\nmaster=https://pypi.org\nhash-index=true\n";
        let cfg = MirrorConfig::from_str(text).unwrap();
        assert_eq!(project_dir(&cfg, "peerme"), "web/simple/p/peerme/");
    }

    #[test]
    fn legacy_html_includes_sha256_fragment_and_yanked_marker() {
        let cfg = cfg();
        let mut releases = BTreeMap::new();
        releases.insert(
            "1.0.0".to_string(),
            Release {
                version: "1.0.0".into(),
                upload_time: None,
                yanked: true,
                files: vec![ReleaseFile {
                    url: "https://files.pythonhosted.org/packages/bc/94/x.whl".into(),
                    filename: "peerme-1.0.0-py36-none-any.whl".into(),
                    packagetype: "bdist_wheel".into(),
                    requires_python: None,
                    size: 10,
                    digests: Digests { sha256: "bc94".repeat(16), md5: None },
                    yanked: true,
                    upload_time: None,
                }],
            },
        );
        let html = build_legacy_html(&cfg, "peerme", &releases);
        assert!(html.contains("#sha256=bc94"));
        assert!(html.contains("data-yanked"));
    }

    #[test]
    fn json_index_carries_sha256_hash() {
        let mut releases = BTreeMap::new();
        releases.insert(
            "1.0.0".to_string(),
            Release {
                version: "1.0.0".into(),
                upload_time: None,
                yanked: false,
                files: vec![ReleaseFile {
                    url: "https://example.test/x.whl".into(),
                    filename: "peerme-1.0.0-py36-none-any.whl".into(),
                    packagetype: "bdist_wheel".into(),
                    requires_python: Some(">=3.6".into()),
                    size: 10,
                    digests: Digests { sha256: "abc123".into(), md5: None },
                    yanked: false,
                    upload_time: Some("2023-01-01T00:00:00Z".into()),
                }],
            },
        );
        let json = build_json("peerme", &releases);
        assert_eq!(json["files"][0]["hashes"]["sha256"], "abc123");
        assert_eq!(json["name"], "peerme");
    }

    #[tokio::test]
    async fn rotated_version_filename_carries_the_serial() {
        let text = "[mirror]\ndirectory=/tmp/m\nmaster=https://pypi.org\nkeep_index_versions=1\n";
        let cfg = MirrorConfig::from_str(text).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage = crate::storage::FilesystemStorage::new(dir.path().to_path_buf());

        let mut releases = BTreeMap::new();
        releases.insert(
            "1.0.0".to_string(),
            Release { version: "1.0.0".into(), upload_time: None, yanked: false, files: vec![] },
        );

        write_project_index(&storage, &cfg, "peerme", &releases, 77).await.unwrap();

        let versions = storage.scandir("web/simple/peerme/versions/").await.unwrap();
        assert!(versions.iter().any(|v| v.starts_with("index_77_") && v.ends_with(".html")));
    }
}
