use super::{FilterDecision, FilterError, ProjectContext, ProjectFilter, Result};
use crate::config::MirrorConfig;
use crate::normalize::normalize;
use crate::pep440::SpecifierSet;
use regex::Regex;
use std::collections::HashMap;
use std::str::FromStr;

fn require_section<'a>(
    cfg: &'a MirrorConfig,
    name: &str,
) -> Result<&'a HashMap<String, String>> {
    cfg.filter_sections
        .get(name)
        .ok_or_else(|| FilterError::MissingSection { name: name.to_string() })
}

/// `packages = name[==specifier], ...` — keep only listed projects,
/// optionally gated by a PEP 440 specifier.
pub struct AllowList {
    entries: Vec<(String, Option<SpecifierSet>)>,
}

impl AllowList {
    pub fn from_section(cfg: &MirrorConfig, section: &str) -> Result<Self> {
        let section = require_section(cfg, section)?;
        Ok(Self {
            entries: parse_package_list(section, "packages")?,
        })
    }
}

impl ProjectFilter for AllowList {
    fn name(&self) -> &'static str {
        "allowlist_project"
    }

    fn evaluate(&self, ctx: &ProjectContext<'_>) -> FilterDecision {
        let name = normalize(ctx.name);
        if self.entries.iter().any(|(n, _)| *n == name) {
            FilterDecision::Keep
        } else {
            FilterDecision::DropProject
        }
    }
}

pub struct DenyList {
    entries: Vec<String>,
}

impl DenyList {
    pub fn from_section(cfg: &MirrorConfig, section: &str) -> Result<Self> {
        let section = require_section(cfg, section)?;
        let raw = section.get("packages").cloned().unwrap_or_default();
        Ok(Self {
            entries: raw
                .split(',')
                .map(|s| normalize(s.trim()))
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

impl ProjectFilter for DenyList {
    fn name(&self) -> &'static str {
        "blocklist_project"
    }

    fn evaluate(&self, ctx: &ProjectContext<'_>) -> FilterDecision {
        if self.entries.iter().any(|n| n == &normalize(ctx.name)) {
            FilterDecision::DropProject
        } else {
            FilterDecision::Keep
        }
    }
}

pub struct RegexFilter {
    pattern: Regex,
}

impl RegexFilter {
    pub fn from_section(cfg: &MirrorConfig, section: &str) -> Result<Self> {
        let section = require_section(cfg, section)?;
        let pattern = section
            .get("pattern")
            .ok_or_else(|| FilterError::MissingSection { name: "pattern".into() })?;
        let compiled = Regex::new(pattern).map_err(|source| FilterError::MalformedRegex {
            section: "regex_project".into(),
            key: "pattern".into(),
            source,
        })?;
        Ok(Self { pattern: compiled })
    }
}

impl ProjectFilter for RegexFilter {
    fn name(&self) -> &'static str {
        "regex_project"
    }

    fn evaluate(&self, ctx: &ProjectContext<'_>) -> FilterDecision {
        if self.pattern.is_match(ctx.name) {
            FilterDecision::DropProject
        } else {
            FilterDecision::Keep
        }
    }
}

/// `max_package_size` (human size, e.g. `1G`), optionally OR'd with an
/// allow-list so "allow OR <= cap" holds.
pub struct SizeCap {
    max_bytes: u64,
    allow: Vec<String>,
}

impl SizeCap {
    pub fn from_section(cfg: &MirrorConfig, section: &str) -> Result<Self> {
        let section_map = require_section(cfg, section)?;
        let raw = section_map
            .get("max_package_size")
            .ok_or_else(|| FilterError::MissingSection { name: "max_package_size".into() })?;
        let max_bytes = super::parse_size_spec(raw).map_err(|_| FilterError::InvalidSize {
            section: section.to_string(),
            key: "max_package_size".into(),
            value: raw.clone(),
        })?;
        let allow = cfg
            .filter_sections
            .get("allowlist")
            .and_then(|m| m.get("packages"))
            .map(|v| {
                v.split(',')
                    .map(|s| normalize(s.trim()))
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self { max_bytes, allow })
    }
}

impl ProjectFilter for SizeCap {
    fn name(&self) -> &'static str {
        "size_project"
    }

    fn evaluate(&self, ctx: &ProjectContext<'_>) -> FilterDecision {
        if self.allow.contains(&normalize(ctx.name)) || ctx.total_size <= self.max_bytes {
            FilterDecision::Keep
        } else {
            FilterDecision::DropProject
        }
    }
}

/// Allow-list sourced from `requirements*.txt` glob(s).
pub struct RequirementsFile {
    names: Vec<String>,
}

impl RequirementsFile {
    pub fn from_section(cfg: &MirrorConfig, section: &str) -> Result<Self> {
        let section_map = require_section(cfg, section)?;
        let pattern = section_map
            .get("requirements_glob")
            .ok_or_else(|| FilterError::MissingSection { name: "requirements_glob".into() })?;
        let mut names = Vec::new();
        for entry in glob::glob(pattern).into_iter().flatten().flatten() {
            if let Ok(contents) = std::fs::read_to_string(&entry) {
                for line in contents.lines() {
                    let line = line.split('#').next().unwrap_or("").trim();
                    if line.is_empty() {
                        continue;
                    }
                    let name = line
                        .split(|c: char| "=<>!~;[".contains(c))
                        .next()
                        .unwrap_or(line)
                        .trim();
                    if !name.is_empty() {
                        names.push(normalize(name));
                    }
                }
            }
        }
        Ok(Self { names })
    }
}

impl ProjectFilter for RequirementsFile {
    fn name(&self) -> &'static str {
        "requirements_project"
    }

    fn evaluate(&self, ctx: &ProjectContext<'_>) -> FilterDecision {
        if self.names.iter().any(|n| n == &normalize(ctx.name)) {
            FilterDecision::Keep
        } else {
            FilterDecision::DropProject
        }
    }
}

/// JSON-path selector over the raw Warehouse document with a tag qualifier.
pub struct MetadataRegex {
    path: Vec<String>,
    pattern: Regex,
    qualifier: Qualifier,
}

#[derive(Clone, Copy)]
enum Qualifier {
    All,
    Any,
    None,
    MatchNull,
    NotNull,
}

impl FromStr for Qualifier {
    type Err = ();
    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "all" => Ok(Qualifier::All),
            "any" => Ok(Qualifier::Any),
            "none" => Ok(Qualifier::None),
            "match-null" => Ok(Qualifier::MatchNull),
            "not-null" => Ok(Qualifier::NotNull),
            _ => Err(()),
        }
    }
}

impl MetadataRegex {
    pub fn from_section(cfg: &MirrorConfig, section: &str) -> Result<Self> {
        let section_map = require_section(cfg, section)?;
        let path = section_map
            .get("path")
            .ok_or_else(|| FilterError::MissingSection { name: "path".into() })?;
        let pattern = section_map
            .get("pattern")
            .ok_or_else(|| FilterError::MissingSection { name: "pattern".into() })?;
        let qualifier = section_map
            .get("qualifier")
            .and_then(|q| Qualifier::from_str(q).ok())
            .unwrap_or(Qualifier::Any);
        let compiled = Regex::new(pattern).map_err(|source| FilterError::MalformedRegex {
            section: section.to_string(),
            key: "pattern".into(),
            source,
        })?;
        Ok(Self {
            path: path.split('.').map(str::to_string).collect(),
            pattern: compiled,
            qualifier,
        })
    }

    fn select<'a>(&self, value: &'a serde_json::Value) -> Vec<&'a serde_json::Value> {
        let mut current = vec![value];
        for segment in &self.path {
            current = current
                .into_iter()
                .filter_map(|v| v.get(segment))
                .flat_map(|v| match v {
                    serde_json::Value::Array(items) => items.iter().collect(),
                    other => vec![other],
                })
                .collect();
        }
        current
    }
}

impl ProjectFilter for MetadataRegex {
    fn name(&self) -> &'static str {
        "metadata_regex_project"
    }

    fn evaluate(&self, ctx: &ProjectContext<'_>) -> FilterDecision {
        let selected = self.select(ctx.raw);
        let matches = |v: &serde_json::Value| v.as_str().is_some_and(|s| self.pattern.is_match(s));
        let decision = match self.qualifier {
            Qualifier::All => selected.iter().all(|v| matches(v)),
            Qualifier::Any => selected.iter().any(|v| matches(v)),
            Qualifier::None => !selected.iter().any(|v| matches(v)),
            Qualifier::MatchNull => selected.is_empty(),
            Qualifier::NotNull => !selected.is_empty(),
        };
        if decision {
            FilterDecision::DropProject
        } else {
            FilterDecision::Keep
        }
    }
}

fn parse_package_list(
    section: &HashMap<String, String>,
    key: &str,
) -> Result<Vec<(String, Option<SpecifierSet>)>> {
    let raw = section.get(key).cloned().unwrap_or_default();
    let mut entries = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (name, spec) = split_name_and_specifier(token);
        let specifier_set = match spec {
            Some(s) => Some(SpecifierSet::from_str(s).map_err(|_| FilterError::InvalidSpecifier {
                section: "allowlist".into(),
                key: key.to_string(),
                value: token.to_string(),
            })?),
            None => None,
        };
        entries.push((normalize(name), specifier_set));
    }
    Ok(entries)
}

fn split_name_and_specifier(token: &str) -> (&str, Option<&str>) {
    for op in ["==", "~=", ">=", "<=", "!=", ">", "<"] {
        if let Some(idx) = token.find(op) {
            return (token[..idx].trim(), Some(token[idx..].trim()));
        }
    }
    (token, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with(section: &str, key: &str, value: &str) -> MirrorConfig {
        let text = format!(
            "[mirror]\ndirectory = /tmp/m\nmaster = https://pypi.org\n\n[{section}]\n{key} = {value}\n"
        );
        MirrorConfig::from_str(&text).unwrap()
    }

    #[test]
    fn allowlist_keeps_listed_project_only() {
        let cfg = cfg_with("allowlist", "packages", "peerme");
        let filter = AllowList::from_section(&cfg, "allowlist").unwrap();
        let empty = serde_json::json!({});
        let keep = ProjectContext { name: "PeerMe", total_size: 0, raw: &empty };
        let drop = ProjectContext { name: "other", total_size: 0, raw: &empty };
        assert_eq!(filter.evaluate(&keep), FilterDecision::Keep);
        assert_eq!(filter.evaluate(&drop), FilterDecision::DropProject);
    }

    #[test]
    fn denylist_drops_listed_project() {
        let cfg = cfg_with("blocklist", "packages", "pyaib");
        let filter = DenyList::from_section(&cfg, "blocklist").unwrap();
        let empty = serde_json::json!({});
        let dropped = ProjectContext { name: "pyaib", total_size: 0, raw: &empty };
        assert_eq!(filter.evaluate(&dropped), FilterDecision::DropProject);
    }

    #[test]
    fn size_cap_allows_under_cap_or_allowlisted() {
        let text = "\
[mirror]
directory = /tmp/m
master = https://pypi.org

[sizecap]
max_package_size = 1G

[allowlist]
packages = numpy
";
        let cfg = MirrorConfig::from_str(text).unwrap();
        let filter = SizeCap::from_section(&cfg, "sizecap").unwrap();
        let empty = serde_json::json!({});
        let huge_allowed = ProjectContext {
            name: "numpy",
            total_size: 5 * 1024 * 1024 * 1024,
            raw: &empty,
        };
        let huge_other = ProjectContext {
            name: "tensorflow",
            total_size: 5 * 1024 * 1024 * 1024,
            raw: &empty,
        };
        assert_eq!(filter.evaluate(&huge_allowed), FilterDecision::Keep);
        assert_eq!(filter.evaluate(&huge_other), FilterDecision::DropProject);
    }

    #[test]
    fn metadata_regex_any_qualifier_matches_classifier() {
        let text = "\
[mirror]
directory = /tmp/m
master = https://pypi.org

[metadata_regex_project]
path = info.classifiers
pattern = Private
qualifier = any
";
        let cfg = MirrorConfig::from_str(text).unwrap();
        let filter = MetadataRegex::from_section(&cfg, "metadata_regex_project").unwrap();
        let raw = serde_json::json!({"info": {"classifiers": ["Private :: Do Not Upload"]}});
        let ctx = ProjectContext { name: "secret", total_size: 0, raw: &raw };
        assert_eq!(filter.evaluate(&ctx), FilterDecision::DropProject);
    }
}
