//! `[mirror]` / `[plugins]` / filter-specific section parsing for the
//! INI-style configuration file. Configuration loading is treated as
//! an external collaborator — the interface here is the
//! contract other components depend on, not a general-purpose INI layer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse ini syntax: {0}")]
    Parse(#[from] ini::Error),
    #[error("missing required key [{section}] {key}")]
    MissingKey { section: String, key: String },
    #[error("invalid value for [{section}] {key} = {value}: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleFormat {
    Html,
    Json,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareMethod {
    Hash,
    Stat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestName {
    Sha256,
    Md5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    Filesystem,
    S3,
    Swift,
}

/// Strongly typed `[mirror]` section, validated at load time.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub directory: PathBuf,
    pub master: String,
    pub download_mirror: Option<String>,
    pub download_mirror_no_fallback: bool,
    pub proxy: Option<String>,
    pub workers: usize,
    pub verifiers: usize,
    pub timeout_secs: u64,
    pub global_timeout_secs: u64,
    pub stop_on_error: bool,
    pub hash_index: bool,
    pub json: bool,
    pub release_files: bool,
    pub simple_format: SimpleFormat,
    pub root_uri: String,
    pub compare_method: CompareMethod,
    pub digest_name: DigestName,
    pub keep_index_versions: u32,
    pub diff_file: Option<PathBuf>,
    pub diff_append_epoch: bool,
    pub cleanup: bool,
    pub storage_backend: StorageBackendKind,
    pub log_config: Option<PathBuf>,
    pub plugins_enabled: PluginsEnabled,
    /// Raw filter-specific sections, handed to the filter registry.
    pub filter_sections: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone)]
pub enum PluginsEnabled {
    All,
    Named(Vec<String>),
}

const DEFAULT_ROOT_URI_NO_FILES: &str = "https://files.pythonhosted.org/";

impl MirrorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self> {
        let ini = ini::Ini::load_from_str(text)?;

        let mirror = section(&ini, "mirror");
        let directory = required(&mirror, "mirror", "directory")?;
        let master = required(&mirror, "mirror", "master")?;
        if !master.starts_with("https:") {
            return Err(ConfigError::InvalidValue {
                section: "mirror".into(),
                key: "master".into(),
                value: master.clone(),
                reason: "master must be an https:// URL".into(),
            });
        }

        let release_files = bool_opt(&mirror, "release-files", true);
        let workers = int_opt(&mirror, "mirror", "workers", 3)?;
        if !(1..=10).contains(&workers) {
            return Err(ConfigError::InvalidValue {
                section: "mirror".into(),
                key: "workers".into(),
                value: workers.to_string(),
                reason: "workers must be between 1 and 10".into(),
            });
        }
        let verifiers = int_opt(&mirror, "mirror", "verifiers", 3)?;
        if verifiers == 0 {
            return Err(ConfigError::InvalidValue {
                section: "mirror".into(),
                key: "verifiers".into(),
                value: verifiers.to_string(),
                reason: "verifiers must be at least 1".into(),
            });
        }
        let keep_index_versions = int_opt(&mirror, "mirror", "keep_index_versions", 0)?;

        let root_uri = mirror
            .get("root_uri")
            .cloned()
            .unwrap_or_else(|| {
                if release_files {
                    String::new()
                } else {
                    DEFAULT_ROOT_URI_NO_FILES.to_string()
                }
            });

        let simple_format = match mirror
            .get("simple-format")
            .map(|s| s.to_ascii_uppercase())
            .as_deref()
        {
            None | Some("ALL") => SimpleFormat::All,
            Some("HTML") => SimpleFormat::Html,
            Some("JSON") => SimpleFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    section: "mirror".into(),
                    key: "simple-format".into(),
                    value: other.into(),
                    reason: "expected HTML, JSON, or ALL".into(),
                });
            }
        };

        let compare_method = match mirror.get("compare-method").map(String::as_str) {
            None | Some("hash") => CompareMethod::Hash,
            Some("stat") => CompareMethod::Stat,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    section: "mirror".into(),
                    key: "compare-method".into(),
                    value: other.into(),
                    reason: "expected hash or stat".into(),
                });
            }
        };

        let digest_name = match mirror.get("digest_name").map(String::as_str) {
            None | Some("sha256") => DigestName::Sha256,
            Some("md5") => DigestName::Md5,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    section: "mirror".into(),
                    key: "digest_name".into(),
                    value: other.into(),
                    reason: "expected sha256 or md5".into(),
                });
            }
        };

        let storage_backend = match mirror.get("storage-backend").map(String::as_str) {
            None | Some("filesystem") => StorageBackendKind::Filesystem,
            Some("s3") => StorageBackendKind::S3,
            Some("swift") => StorageBackendKind::Swift,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    section: "mirror".into(),
                    key: "storage-backend".into(),
                    value: other.into(),
                    reason: "expected filesystem, s3, or swift".into(),
                });
            }
        };

        let plugins_section = section(&ini, "plugins");
        let plugins_enabled = match plugins_section.get("enabled").map(String::as_str) {
            None | Some("all") => PluginsEnabled::All,
            Some(list) => PluginsEnabled::Named(
                list.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
        };

        let mut filter_sections = HashMap::new();
        for (section_name, properties) in ini.iter() {
            let Some(section_name) = section_name else {
                continue;
            };
            if section_name == "mirror" || section_name == "plugins" {
                continue;
            }
            let mut map = HashMap::new();
            for (k, v) in properties.iter() {
                map.insert(k.to_string(), v.to_string());
            }
            filter_sections.insert(section_name.to_string(), map);
        }

        Ok(MirrorConfig {
            directory: PathBuf::from(directory),
            master,
            download_mirror: mirror.get("download-mirror").cloned(),
            download_mirror_no_fallback: bool_opt(&mirror, "download-mirror-no-fallback", false),
            proxy: mirror.get("proxy").cloned(),
            workers,
            verifiers,
            timeout_secs: int_opt(&mirror, "mirror", "timeout", 10)? as u64,
            global_timeout_secs: int_opt(&mirror, "mirror", "global-timeout", 18_000)? as u64,
            stop_on_error: bool_opt(&mirror, "stop-on-error", false),
            hash_index: bool_opt(&mirror, "hash-index", false),
            json: bool_opt(&mirror, "json", false),
            release_files,
            simple_format,
            root_uri,
            compare_method,
            digest_name,
            keep_index_versions: keep_index_versions as u32,
            diff_file: mirror.get("diff-file").map(PathBuf::from),
            diff_append_epoch: bool_opt(&mirror, "diff-append-epoch", false),
            cleanup: bool_opt(&mirror, "cleanup", false),
            storage_backend,
            log_config: mirror.get("log-config").map(PathBuf::from),
            plugins_enabled,
            filter_sections,
        })
    }

    pub fn filter_enabled(&self, name: &str) -> bool {
        match &self.plugins_enabled {
            PluginsEnabled::All => true,
            PluginsEnabled::Named(names) => names.iter().any(|n| n == name),
        }
    }
}

fn section(ini: &ini::Ini, name: &str) -> HashMap<String, String> {
    ini.section(Some(name))
        .map(|props| {
            props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn required(map: &HashMap<String, String>, section: &str, key: &str) -> Result<String> {
    map.get(key).cloned().ok_or_else(|| ConfigError::MissingKey {
        section: section.into(),
        key: key.into(),
    })
}

fn bool_opt(map: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match map.get(key).map(|v| v.to_ascii_lowercase()) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn int_opt(map: &HashMap<String, String>, section: &str, key: &str, default: i64) -> Result<i64> {
    match map.get(key) {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::InvalidValue {
            section: section.into(),
            key: key.into(),
            value: v.clone(),
            reason: "expected an integer".into(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "\
[mirror]
directory = /tmp/mirror
master = https://pypi.org
";

    #[test]
    fn loads_minimal_config_with_defaults() {
        let cfg = MirrorConfig::from_str(MINIMAL).unwrap();
        assert_eq!(cfg.directory, PathBuf::from("/tmp/mirror"));
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.verifiers, 3);
        assert!(cfg.release_files);
        assert!(matches!(cfg.simple_format, SimpleFormat::All));
        assert!(matches!(cfg.compare_method, CompareMethod::Hash));
        assert!(matches!(cfg.plugins_enabled, PluginsEnabled::All));
    }

    #[test]
    fn rejects_non_https_master() {
        let text = "[mirror]\ndirectory = /tmp/m\nmaster = http://pypi.org\n";
        let err = MirrorConfig::from_str(text).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_missing_directory() {
        let text = "[mirror]\nmaster = https://pypi.org\n";
        let err = MirrorConfig::from_str(text).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { .. }));
    }

    #[test]
    fn rejects_out_of_range_workers() {
        let text = format!("{MINIMAL}workers = 11\n");
        let err = MirrorConfig::from_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn parses_plugin_list_and_filter_sections() {
        let text = "\
[mirror]
directory = /tmp/m
master = https://pypi.org

[plugins]
enabled = allowlist_project, blocklist_project

[allowlist]
packages = peerme
";
        let cfg = MirrorConfig::from_str(text).unwrap();
        match cfg.plugins_enabled {
            PluginsEnabled::Named(names) => {
                assert_eq!(names, vec!["allowlist_project", "blocklist_project"]);
            }
            PluginsEnabled::All => panic!("expected named plugin list"),
        }
        assert_eq!(
            cfg.filter_sections.get("allowlist").unwrap().get("packages"),
            Some(&"peerme".to_string())
        );
    }

    #[test]
    fn root_uri_defaults_when_release_files_disabled() {
        let text = "[mirror]\ndirectory = /tmp/m\nmaster = https://pypi.org\nrelease-files = false\n";
        let cfg = MirrorConfig::from_str(text).unwrap();
        assert_eq!(cfg.root_uri, DEFAULT_ROOT_URI_NO_FILES);
    }
}
