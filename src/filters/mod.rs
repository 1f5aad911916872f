//! Filter chain: ordered project/release/file filters. Built
//! once per run from a static registry keyed by filter name — matching the
//! Design Notes' "avoid runtime plugin discovery" guidance — and driven by
//! the `[plugins] enabled` list plus each filter's own config section.

pub mod file;
pub mod project;
pub mod release;

use crate::config::{MirrorConfig, PluginsEnabled};
use crate::error::ErrorKind;
use crate::model::{Project, Release, ReleaseFile};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Keep,
    Drop,
    DropProject,
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("malformed regex in [{section}] {key}: {source}")]
    MalformedRegex {
        section: String,
        key: String,
        source: regex::Error,
    },
    #[error("unknown filter '{0}' in [plugins] enabled")]
    UnknownPlugin(String),
    #[error("filter '{name}' is enabled but has no [{name}] section")]
    MissingSection { name: String },
    #[error("invalid PEP 440 specifier in [{section}] {key}: {value}")]
    InvalidSpecifier {
        section: String,
        key: String,
        value: String,
    },
    #[error("invalid size in [{section}] {key}: {value}")]
    InvalidSize {
        section: String,
        key: String,
        value: String,
    },
}

impl FilterError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Filter
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;

pub struct ProjectContext<'a> {
    pub name: &'a str,
    pub total_size: u64,
    pub raw: &'a serde_json::Value,
}

pub struct ReleaseContext<'a> {
    pub project: &'a str,
    pub version: &'a str,
    pub release: &'a Release,
    /// The version already present in the local mirror from a prior run, if
    /// any — always kept even if it would otherwise fall outside latest-N.
    pub currently_mirrored: bool,
}

pub struct FileContext<'a> {
    pub project: &'a str,
    pub version: &'a str,
    pub file: &'a ReleaseFile,
}

pub trait ProjectFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, ctx: &ProjectContext<'_>) -> FilterDecision;
}

pub trait ReleaseFilter: Send + Sync {
    fn name(&self) -> &'static str;
    /// Called once per remaining release; implementations that need the
    /// full set (latest-N) take a second pass via `plan`.
    fn evaluate(&self, ctx: &ReleaseContext<'_>) -> FilterDecision;
    /// Non-`None` only for `pinned_release`: when a project has a pinned
    /// specifier, it short-circuits every other release filter for that
    /// project instead of competing with them release-by-release.
    fn pinned_specifier(&self, _project: &str) -> Option<crate::pep440::SpecifierSet> {
        None
    }
    /// Whole-release-set filters (latest-N) override this to select a
    /// subset instead of deciding release-by-release.
    fn plan<'a>(&self, releases: Vec<(&'a str, &'a Release, bool)>) -> Vec<&'a str> {
        releases
            .into_iter()
            .filter(|(version, release, mirrored)| {
                self.evaluate(&ReleaseContext {
                    project: "",
                    version,
                    release,
                    currently_mirrored: *mirrored,
                }) == FilterDecision::Keep
            })
            .map(|(version, _, _)| version)
            .collect()
    }
}

pub trait FileFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, ctx: &FileContext<'_>) -> FilterDecision;
}

/// The assembled, ordered chain for one run.
pub struct FilterChain {
    project_filters: Vec<Box<dyn ProjectFilter>>,
    release_filters: Vec<Box<dyn ReleaseFilter>>,
    file_filters: Vec<Box<dyn FileFilter>>,
}

impl FilterChain {
    pub fn build(cfg: &MirrorConfig) -> Result<Self> {
        let mut project_filters: Vec<Box<dyn ProjectFilter>> = Vec::new();
        let mut release_filters: Vec<Box<dyn ReleaseFilter>> = Vec::new();
        let mut file_filters: Vec<Box<dyn FileFilter>> = Vec::new();

        // `[plugins] enabled = all` (the default, absent `[plugins]`
        // included) activates a filter only when its own section is also
        // present — "all" opts every filter in, it doesn't conjure config
        // for ones nobody set up. An explicit `enabled = name, ...` list
        // means the operator asked for that filter by name, so a missing
        // section there is a real misconfiguration and `from_section`
        // reports `MissingSection` instead of silently skipping it.
        macro_rules! active {
            ($name:literal, $section:literal) => {
                match &cfg.plugins_enabled {
                    PluginsEnabled::All => cfg.filter_sections.contains_key($section),
                    PluginsEnabled::Named(names) => names.iter().any(|n| n == $name),
                }
            };
        }

        if active!("allowlist_project", "allowlist") {
            project_filters.push(Box::new(project::AllowList::from_section(cfg, "allowlist")?));
        }
        if active!("blocklist_project", "blocklist") {
            project_filters.push(Box::new(project::DenyList::from_section(cfg, "blocklist")?));
        }
        if active!("regex_project", "regex_project") {
            project_filters.push(Box::new(project::RegexFilter::from_section(
                cfg,
                "regex_project",
            )?));
        }
        if active!("size_project", "sizecap") {
            project_filters.push(Box::new(project::SizeCap::from_section(cfg, "sizecap")?));
        }
        if active!("requirements_project", "requirements_project") {
            project_filters.push(Box::new(project::RequirementsFile::from_section(
                cfg,
                "requirements_project",
            )?));
        }
        if active!("metadata_regex_project", "metadata_regex_project") {
            project_filters.push(Box::new(project::MetadataRegex::from_section(
                cfg,
                "metadata_regex_project",
            )?));
        }

        if active!("pinned_release", "requirements_project") {
            release_filters.push(Box::new(release::RequirementsPinned::from_section(
                cfg,
                "requirements_project",
            )?));
        }
        if active!("prerelease_release", "prerelease_release") {
            release_filters.push(Box::new(release::PreReleaseFilter::from_section(
                cfg,
                "prerelease_release",
            )?));
        }
        if active!("upload_time_release", "upload_time_release") {
            release_filters.push(Box::new(release::UploadTimeWindow::from_section(
                cfg,
                "upload_time_release",
            )?));
        }
        // `SpecifierFilter` reads both `allowlist_release` and
        // `blocklist_release` itself and tolerates either being absent, so
        // it only needs at least one of the two present under `All`.
        let specifier_active = match &cfg.plugins_enabled {
            PluginsEnabled::All => {
                cfg.filter_sections.contains_key("allowlist_release")
                    || cfg.filter_sections.contains_key("blocklist_release")
            }
            PluginsEnabled::Named(names) => {
                names.iter().any(|n| n == "allowlist_release" || n == "blocklist_release")
            }
        };
        if specifier_active {
            release_filters.push(Box::new(release::SpecifierFilter::from_section(cfg)?));
        }
        if active!("regex_release", "regex_release") {
            release_filters.push(Box::new(release::RegexFilter::from_section(
                cfg,
                "regex_release",
            )?));
        }
        // latest-N always runs last among release filters so it trims what
        // survives every other release-level decision.
        if active!("latest_release", "latest_release") {
            release_filters.push(Box::new(release::LatestN::from_section(
                cfg,
                "latest_release",
            )?));
        }

        if active!("platform_file", "platform_file") {
            file_filters.push(Box::new(file::PlatformExclusion::from_section(
                cfg,
                "platform_file",
            )?));
        }
        if active!("regex_file", "regex_file") {
            file_filters.push(Box::new(file::RegexFilter::from_section(cfg, "regex_file")?));
        }

        Ok(FilterChain {
            project_filters,
            release_filters,
            file_filters,
        })
    }

    /// Applies the full chain to a freshly fetched project, returning the
    /// filtered releases (with files already pruned) or `None` if the whole
    /// project should be dropped.
    pub fn apply(
        &self,
        project: &Project,
        raw: &serde_json::Value,
        previously_mirrored: &std::collections::HashSet<String>,
    ) -> Option<std::collections::BTreeMap<String, Release>> {
        let project_ctx = ProjectContext {
            name: &project.name,
            total_size: project.total_size(),
            raw,
        };
        for filter in &self.project_filters {
            match filter.evaluate(&project_ctx) {
                FilterDecision::Keep => {}
                FilterDecision::Drop | FilterDecision::DropProject => return None,
            }
        }

        let pin = self
            .release_filters
            .iter()
            .find_map(|f| f.pinned_specifier(&project.name));

        let mut surviving: Vec<(String, Release)> = Vec::new();
        'release: for (version, release) in &project.releases {
            if let Some(set) = &pin {
                if release.parsed_version().is_some_and(|v| set.matches(&v)) {
                    surviving.push((version.clone(), release.clone()));
                }
                continue 'release;
            }
            let ctx = ReleaseContext {
                project: &project.name,
                version,
                release,
                currently_mirrored: previously_mirrored.contains(version),
            };
            for filter in &self.release_filters {
                match filter.evaluate(&ctx) {
                    FilterDecision::Keep => {}
                    FilterDecision::Drop => continue 'release,
                    FilterDecision::DropProject => return None,
                }
            }
            surviving.push((version.clone(), release.clone()));
        }

        // Whole-set release filters (latest-N) run after per-release ones,
        // unless a pin is active — the pin alone decides which releases
        // survive for that project.
        if pin.is_none() {
            for filter in &self.release_filters {
                let refs: Vec<(&str, &Release, bool)> = surviving
                    .iter()
                    .map(|(v, r)| (v.as_str(), r, previously_mirrored.contains(v.as_str())))
                    .collect();
                if filter.name() == "latest_release" {
                    let kept: std::collections::HashSet<&str> =
                        filter.plan(refs).into_iter().collect();
                    surviving.retain(|(v, _)| kept.contains(v.as_str()));
                }
            }
        }

        let mut out = std::collections::BTreeMap::new();
        for (version, mut release) in surviving {
            release.files.retain(|file| {
                let ctx = FileContext {
                    project: &project.name,
                    version: &version,
                    file,
                };
                self.file_filters
                    .iter()
                    .all(|f| f.evaluate(&ctx) == FilterDecision::Keep)
            });
            out.insert(version, release);
        }
        Some(out)
    }
}

pub fn parse_size_spec(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    let (number, multiplier) = if let Some(n) = value.strip_suffix(['G', 'g']) {
        (n, 1024u64.pow(3))
    } else if let Some(n) = value.strip_suffix(['M', 'm']) {
        (n, 1024u64.pow(2))
    } else if let Some(n) = value.strip_suffix(['K', 'k']) {
        (n, 1024u64)
    } else {
        (value, 1)
    };
    number
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("'{value}' is not a valid size"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_size_suffixes() {
        assert_eq!(parse_size_spec("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size_spec("500M").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_size_spec("2048").unwrap(), 2048);
    }

    #[test]
    fn build_succeeds_on_a_vanilla_config_with_no_filter_sections() {
        let cfg = MirrorConfig::from_str("[mirror]\ndirectory=/tmp/m\nmaster=https://pypi.org\n").unwrap();
        let chain = FilterChain::build(&cfg).unwrap();
        assert!(chain.project_filters.is_empty());
        assert!(chain.release_filters.is_empty());
        assert!(chain.file_filters.is_empty());
    }

    #[test]
    fn build_activates_a_filter_under_all_once_its_section_appears() {
        let text = "\
[mirror]
directory = /tmp/m
master = https://pypi.org

[allowlist]
packages = peerme
";
        let cfg = MirrorConfig::from_str(text).unwrap();
        let chain = FilterChain::build(&cfg).unwrap();
        assert_eq!(chain.project_filters.len(), 1);
    }

    #[test]
    fn build_reports_missing_section_when_explicitly_named() {
        let text = "\
[mirror]
directory = /tmp/m
master = https://pypi.org

[plugins]
enabled = allowlist_project
";
        let cfg = MirrorConfig::from_str(text).unwrap();
        let err = FilterChain::build(&cfg).unwrap_err();
        assert!(matches!(err, FilterError::MissingSection { .. }));
    }
}
