use super::{FilterDecision, FilterError, ReleaseContext, ReleaseFilter, Result};
use crate::config::MirrorConfig;
use crate::normalize::normalize;
use crate::pep440::SpecifierSet;
use regex::Regex;
use std::collections::HashMap;
use std::str::FromStr;

fn require_section<'a>(cfg: &'a MirrorConfig, name: &str) -> Result<&'a HashMap<String, String>> {
    cfg.filter_sections
        .get(name)
        .ok_or_else(|| FilterError::MissingSection { name: name.to_string() })
}

/// Pins individual projects to a version range sourced from the same
/// `requirements*.txt` glob the project-level requirements filter reads, but
/// keeping the specifier instead of discarding it. When a project has a pin,
/// it short-circuits every other release filter for that project —
/// `FilterChain::apply` asks every release filter for a `pinned_specifier`
/// before running its normal per-release loop.
pub struct RequirementsPinned {
    pins: HashMap<String, SpecifierSet>,
}

impl RequirementsPinned {
    pub fn from_section(cfg: &MirrorConfig, section: &str) -> Result<Self> {
        let section_map = require_section(cfg, section)?;
        let pattern = section_map
            .get("requirements_glob")
            .ok_or_else(|| FilterError::MissingSection { name: "requirements_glob".into() })?;
        let mut pins = HashMap::new();
        for entry in glob::glob(pattern).into_iter().flatten().flatten() {
            let Ok(contents) = std::fs::read_to_string(&entry) else {
                continue;
            };
            for line in contents.lines() {
                let line = line.split('#').next().unwrap_or("").trim();
                if line.is_empty() {
                    continue;
                }
                let Some(idx) = line.find(['=', '<', '>', '!', '~']) else {
                    continue;
                };
                let (name, spec) = line.split_at(idx);
                let name = name.trim();
                let spec = spec.trim();
                if name.is_empty() || spec.is_empty() {
                    continue;
                }
                if let Ok(set) = SpecifierSet::from_str(spec) {
                    pins.insert(normalize(name), set);
                }
            }
        }
        Ok(Self { pins })
    }
}

impl ReleaseFilter for RequirementsPinned {
    fn name(&self) -> &'static str {
        "pinned_release"
    }

    fn evaluate(&self, ctx: &ReleaseContext<'_>) -> FilterDecision {
        match self.pins.get(&normalize(ctx.project)) {
            Some(set) => match ctx.release.parsed_version() {
                Some(v) if set.matches(&v) => FilterDecision::Keep,
                _ => FilterDecision::Drop,
            },
            None => FilterDecision::Keep,
        }
    }

    fn pinned_specifier(&self, project: &str) -> Option<SpecifierSet> {
        self.pins.get(&normalize(project)).cloned()
    }
}

/// Drops pre-releases (`a`/`b`/`rc`/`.dev`), optionally restricted to a
/// `packages` list so other projects keep shipping pre-releases as usual.
pub struct PreReleaseFilter {
    only: Vec<String>,
}

impl PreReleaseFilter {
    pub fn from_section(cfg: &MirrorConfig, section: &str) -> Result<Self> {
        let section_map = require_section(cfg, section)?;
        let only = section_map
            .get("packages")
            .map(|v| {
                v.split(',')
                    .map(|s| normalize(s.trim()))
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self { only })
    }

    fn applies_to(&self, project: &str) -> bool {
        self.only.is_empty() || self.only.iter().any(|n| n == &normalize(project))
    }
}

impl ReleaseFilter for PreReleaseFilter {
    fn name(&self) -> &'static str {
        "prerelease_release"
    }

    fn evaluate(&self, ctx: &ReleaseContext<'_>) -> FilterDecision {
        if !self.applies_to(ctx.project) {
            return FilterDecision::Keep;
        }
        if ctx.release.is_prerelease() {
            FilterDecision::Drop
        } else {
            FilterDecision::Keep
        }
    }
}

/// Keeps only releases uploaded on or after a cutoff, expressed either as an
/// absolute `after` timestamp (`YYYY-MM-DDTHH:MM:SS`, UTC) or a rolling
/// `days` window measured from `now`. Releases with no recorded upload time
/// are always kept — there is nothing to compare.
pub struct UploadTimeWindow {
    cutoff_unix: i64,
}

impl UploadTimeWindow {
    pub fn from_section(cfg: &MirrorConfig, section: &str) -> Result<Self> {
        let section_map = require_section(cfg, section)?;
        let cutoff_unix = if let Some(after) = section_map.get("after") {
            parse_iso8601_to_unix(after).ok_or_else(|| FilterError::InvalidSpecifier {
                section: section.to_string(),
                key: "after".into(),
                value: after.clone(),
            })?
        } else if let Some(days) = section_map.get("days") {
            let days: i64 = days.trim().parse().map_err(|_| FilterError::InvalidSpecifier {
                section: section.to_string(),
                key: "days".into(),
                value: days.clone(),
            })?;
            now_unix() - days * 86_400
        } else {
            return Err(FilterError::MissingSection { name: "after or days".into() });
        };
        Ok(Self { cutoff_unix })
    }
}

impl ReleaseFilter for UploadTimeWindow {
    fn name(&self) -> &'static str {
        "upload_time_release"
    }

    fn evaluate(&self, ctx: &ReleaseContext<'_>) -> FilterDecision {
        match ctx.release.upload_time.as_deref().and_then(parse_iso8601_to_unix) {
            Some(uploaded) if uploaded < self.cutoff_unix => FilterDecision::Drop,
            _ => FilterDecision::Keep,
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Minimal `YYYY-MM-DDTHH:MM:SS` (optionally `Z`-suffixed) parser — upload
/// timestamps from the upstream JSON are always UTC, so no timezone table is
/// needed. Anything else returns `None` rather than failing the run.
pub(crate) fn parse_iso8601_to_unix(s: &str) -> Option<i64> {
    let s = s.trim().trim_end_matches('Z');
    let (date, time) = s.split_once('T')?;
    let mut date_parts = date.split('-');
    let year: i64 = date_parts.next()?.parse().ok()?;
    let month: i64 = date_parts.next()?.parse().ok()?;
    let day: i64 = date_parts.next()?.parse().ok()?;

    let time = time.split(['.', '+']).next().unwrap_or(time);
    let mut time_parts = time.split(':');
    let hour: i64 = time_parts.next()?.parse().ok()?;
    let minute: i64 = time_parts.next()?.parse().ok()?;
    let second: i64 = time_parts.next().unwrap_or("0").parse().ok()?;

    let days = days_since_epoch(year, month, day)?;
    Some(days * 86_400 + hour * 3_600 + minute * 60 + second)
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_since_epoch(year: i64, month: i64, day: i64) -> Option<i64> {
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let month_days = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut days = 0i64;
    if year >= 1970 {
        for y in 1970..year {
            days += if is_leap_year(y) { 366 } else { 365 };
        }
    } else {
        for y in year..1970 {
            days -= if is_leap_year(y) { 366 } else { 365 };
        }
    }
    for (i, &m) in month_days.iter().enumerate().take((month - 1) as usize) {
        days += m;
        if i == 1 && is_leap_year(year) {
            days += 1;
        }
    }
    days += day - 1;
    Some(days)
}

/// Combined `allowlist_release` / `blocklist_release`: per-project PEP 440
/// specifiers. A project absent from both lists is unaffected.
pub struct SpecifierFilter {
    allow: HashMap<String, SpecifierSet>,
    deny: HashMap<String, SpecifierSet>,
}

impl SpecifierFilter {
    pub fn from_section(cfg: &MirrorConfig) -> Result<Self> {
        let allow = cfg
            .filter_sections
            .get("allowlist_release")
            .map(|m| parse_project_specifier_map(m, "allowlist_release"))
            .transpose()?
            .unwrap_or_default();
        let deny = cfg
            .filter_sections
            .get("blocklist_release")
            .map(|m| parse_project_specifier_map(m, "blocklist_release"))
            .transpose()?
            .unwrap_or_default();
        Ok(Self { allow, deny })
    }
}

fn parse_project_specifier_map(
    map: &HashMap<String, String>,
    section: &str,
) -> Result<HashMap<String, SpecifierSet>> {
    let mut out = HashMap::new();
    for (project, spec) in map {
        let set = SpecifierSet::from_str(spec).map_err(|_| FilterError::InvalidSpecifier {
            section: section.to_string(),
            key: project.clone(),
            value: spec.clone(),
        })?;
        out.insert(normalize(project), set);
    }
    Ok(out)
}

impl ReleaseFilter for SpecifierFilter {
    fn name(&self) -> &'static str {
        "allowlist_release"
    }

    fn evaluate(&self, ctx: &ReleaseContext<'_>) -> FilterDecision {
        let Some(version) = ctx.release.parsed_version() else {
            return FilterDecision::Keep;
        };
        let project = normalize(ctx.project);
        if let Some(set) = self.allow.get(&project)
            && !set.matches(&version)
        {
            return FilterDecision::Drop;
        }
        if let Some(set) = self.deny.get(&project)
            && set.matches(&version)
        {
            return FilterDecision::Drop;
        }
        FilterDecision::Keep
    }
}

pub struct RegexFilter {
    pattern: Regex,
}

impl RegexFilter {
    pub fn from_section(cfg: &MirrorConfig, section: &str) -> Result<Self> {
        let section_map = require_section(cfg, section)?;
        let pattern = section_map
            .get("pattern")
            .ok_or_else(|| FilterError::MissingSection { name: "pattern".into() })?;
        let compiled = Regex::new(pattern).map_err(|source| FilterError::MalformedRegex {
            section: section.to_string(),
            key: "pattern".into(),
            source,
        })?;
        Ok(Self { pattern: compiled })
    }
}

impl ReleaseFilter for RegexFilter {
    fn name(&self) -> &'static str {
        "regex_release"
    }

    fn evaluate(&self, ctx: &ReleaseContext<'_>) -> FilterDecision {
        if self.pattern.is_match(ctx.version) {
            FilterDecision::Drop
        } else {
            FilterDecision::Keep
        }
    }
}

/// Keeps only the `keep` most recent releases by parsed version (falling
/// back to lexicographic order for unparseable versions), always keeping
/// whatever is already mirrored so a run never deletes a version it isn't
/// explicitly told to drop.
pub struct LatestN {
    keep: usize,
}

impl LatestN {
    pub fn from_section(cfg: &MirrorConfig, section: &str) -> Result<Self> {
        let section_map = require_section(cfg, section)?;
        let keep = section_map
            .get("keep")
            .ok_or_else(|| FilterError::MissingSection { name: "keep".into() })?;
        let keep: usize = keep.trim().parse().map_err(|_| FilterError::InvalidSpecifier {
            section: section.to_string(),
            key: "keep".into(),
            value: keep.clone(),
        })?;
        Ok(Self { keep })
    }
}

impl ReleaseFilter for LatestN {
    fn name(&self) -> &'static str {
        "latest_release"
    }

    fn evaluate(&self, _ctx: &ReleaseContext<'_>) -> FilterDecision {
        FilterDecision::Keep
    }

    fn plan<'a>(&self, releases: Vec<(&'a str, &'a crate::model::Release, bool)>) -> Vec<&'a str> {
        let mut sorted = releases;
        sorted.sort_by(|(va, ra, _), (vb, rb, _)| {
            match (ra.parsed_version(), rb.parsed_version()) {
                (Some(pa), Some(pb)) => pb.cmp(&pa),
                _ => vb.cmp(va),
            }
        });
        let mut kept: Vec<&str> = sorted.iter().take(self.keep).map(|(v, _, _)| *v).collect();
        for (version, _, mirrored) in &sorted {
            if *mirrored && !kept.contains(version) {
                kept.push(version);
            }
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Digests, Release, ReleaseFile};

    fn release(version: &str) -> Release {
        Release {
            version: version.to_string(),
            upload_time: None,
            yanked: false,
            files: vec![ReleaseFile {
                url: format!("https://example.test/{version}.whl"),
                filename: format!("pkg-{version}.whl"),
                packagetype: "bdist_wheel".into(),
                requires_python: None,
                size: 1,
                digests: Digests { sha256: "a".repeat(64), md5: None },
                yanked: false,
                upload_time: None,
            }],
        }
    }

    #[test]
    fn latest_n_keeps_newest_and_currently_mirrored() {
        let filter = LatestN { keep: 1 };
        let r1 = release("1.0.0");
        let r2 = release("2.0.0");
        let r0 = release("0.1.0");
        let releases = vec![("1.0.0", &r1, false), ("2.0.0", &r2, false), ("0.1.0", &r0, true)];
        let mut kept = filter.plan(releases);
        kept.sort();
        assert_eq!(kept, vec!["0.1.0", "2.0.0"]);
    }

    #[test]
    fn prerelease_filter_only_applies_to_listed_packages() {
        let cfg = MirrorConfig::from_str(
            "[mirror]\ndirectory=/tmp/m\nmaster=https://pypi.org\n\n[prerelease_release]\npackages = numpy\n",
        )
        .unwrap();
        let filter = PreReleaseFilter::from_section(&cfg, "prerelease_release").unwrap();
        let pre = release("1.0.0a1");
        let numpy_ctx = ReleaseContext { project: "numpy", version: "1.0.0a1", release: &pre, currently_mirrored: false };
        let other_ctx = ReleaseContext { project: "other", version: "1.0.0a1", release: &pre, currently_mirrored: false };
        assert_eq!(filter.evaluate(&numpy_ctx), FilterDecision::Drop);
        assert_eq!(filter.evaluate(&other_ctx), FilterDecision::Keep);
    }

    #[test]
    fn parses_basic_iso8601_timestamp() {
        assert_eq!(parse_iso8601_to_unix("1970-01-01T00:00:00"), Some(0));
        assert_eq!(parse_iso8601_to_unix("2023-01-15T10:30:00Z"), Some(1673778600));
    }
}
