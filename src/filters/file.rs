use super::{FileContext, FileFilter, FilterDecision, FilterError, Result};
use crate::config::MirrorConfig;
use regex::Regex;
use std::collections::HashMap;

fn require_section<'a>(cfg: &'a MirrorConfig, name: &str) -> Result<&'a HashMap<String, String>> {
    cfg.filter_sections
        .get(name)
        .ok_or_else(|| FilterError::MissingSection { name: name.to_string() })
}

/// Drops release files built for an excluded platform or Python version.
/// `platforms = windows,macos` matches by substrings in the wheel's
/// platform tag (sdists have no platform tag and are never excluded here).
/// `py-versions = py2.7,cp27,py3.10+` matches Python/implementation tags
/// exactly, except a trailing `+` which excludes that minor version and
/// everything above it.
pub struct PlatformExclusion {
    platforms: Vec<String>,
    py_versions: Vec<PyVersionRule>,
}

enum PyVersionRule {
    Exact(String),
    AndAbove(u64, u64),
}

impl PlatformExclusion {
    pub fn from_section(cfg: &MirrorConfig, section: &str) -> Result<Self> {
        let section_map = require_section(cfg, section)?;
        let platforms = section_map
            .get("platforms")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let py_versions = section_map
            .get("py-versions")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(parse_py_version_rule)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self { platforms, py_versions })
    }
}

fn parse_py_version_rule(token: &str) -> PyVersionRule {
    if let Some(base) = token.strip_suffix('+')
        && let Some((major, minor)) = base.trim_start_matches(['p', 'y', 'c']).split_once('.')
        && let (Ok(major), Ok(minor)) = (major.parse(), minor.parse())
    {
        return PyVersionRule::AndAbove(major, minor);
    }
    PyVersionRule::Exact(normalize_py_tag(token))
}

fn normalize_py_tag(tag: &str) -> String {
    tag.replace('.', "").to_ascii_lowercase()
}

/// `{distribution}-{version}(-{build})?-{python}-{abi}-{platform}.whl`
/// (PEP 425). Returns `None` for anything that isn't a 5-dot-separated wheel
/// filename, e.g. sdists.
fn wheel_tags(filename: &str) -> Option<(String, String)> {
    let stem = filename.strip_suffix(".whl")?;
    let parts: Vec<&str> = stem.split('-').collect();
    if parts.len() < 5 {
        return None;
    }
    let platform = parts[parts.len() - 1].to_ascii_lowercase();
    let python = parts[parts.len() - 3].to_ascii_lowercase();
    Some((python, platform))
}

const PLATFORM_KEYWORDS: &[(&str, &[&str])] = &[
    ("windows", &["win32", "win_amd64", "win_arm64", "win"]),
    ("macos", &["macosx", "universal2"]),
    ("freebsd", &["freebsd"]),
    ("linux", &["linux", "manylinux", "musllinux"]),
];

impl FileFilter for PlatformExclusion {
    fn name(&self) -> &'static str {
        "platform_file"
    }

    fn evaluate(&self, ctx: &FileContext<'_>) -> FilterDecision {
        let Some((python_tag, platform_tag)) = wheel_tags(&ctx.file.filename) else {
            return FilterDecision::Keep;
        };

        for platform in &self.platforms {
            if let Some((_, keywords)) = PLATFORM_KEYWORDS.iter().find(|(name, _)| name == platform)
                && keywords.iter().any(|kw| platform_tag.contains(kw))
            {
                return FilterDecision::Drop;
            }
        }

        for rule in &self.py_versions {
            let excluded = match rule {
                PyVersionRule::Exact(tag) => &python_tag == tag,
                PyVersionRule::AndAbove(major, minor) => {
                    python_tag_at_or_above(&python_tag, *major, *minor)
                }
            };
            if excluded {
                return FilterDecision::Drop;
            }
        }

        FilterDecision::Keep
    }
}

/// `cp310`/`py310` etc. compared numerically against `major.minor`.
fn python_tag_at_or_above(tag: &str, major: u64, minor: u64) -> bool {
    let digits: String = tag.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 2 {
        return false;
    }
    let tag_major: u64 = digits[..1].parse().unwrap_or(0);
    let tag_minor: u64 = digits[1..].parse().unwrap_or(0);
    (tag_major, tag_minor) >= (major, minor)
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

impl FileFilter for RegexFilter {
    fn name(&self) -> &'static str {
        "regex_file"
    }

    fn evaluate(&self, ctx: &FileContext<'_>) -> FilterDecision {
        if self.pattern.is_match(&ctx.file.filename) {
            FilterDecision::Drop
        } else {
            FilterDecision::Keep
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Digests, ReleaseFile};

    fn wheel(filename: &str) -> ReleaseFile {
        ReleaseFile {
            url: format!("https://example.test/{filename}"),
            filename: filename.to_string(),
            packagetype: "bdist_wheel".into(),
            requires_python: None,
            size: 1,
            digests: Digests { sha256: "a".repeat(64), md5: None },
            yanked: false,
            upload_time: None,
        }
    }

    #[test]
    fn excludes_configured_platform() {
        let cfg = MirrorConfig::from_str(
            "[mirror]\ndirectory=/tmp/m\nmaster=https://pypi.org\n\n[platform_file]\nplatforms = windows\n",
        )
        .unwrap();
        let filter = PlatformExclusion::from_section(&cfg, "platform_file").unwrap();
        let file = wheel("pkg-1.0.0-cp310-cp310-win_amd64.whl");
        let ctx = FileContext { project: "pkg", version: "1.0.0", file: &file };
        assert_eq!(filter.evaluate(&ctx), FilterDecision::Drop);
    }

    #[test]
    fn keeps_sdist_regardless_of_platform_config() {
        let cfg = MirrorConfig::from_str(
            "[mirror]\ndirectory=/tmp/m\nmaster=https://pypi.org\n\n[platform_file]\nplatforms = windows,macos,linux\n",
        )
        .unwrap();
        let filter = PlatformExclusion::from_section(&cfg, "platform_file").unwrap();
        let file = wheel("pkg-1.0.0.tar.gz");
        let ctx = FileContext { project: "pkg", version: "1.0.0", file: &file };
        assert_eq!(filter.evaluate(&ctx), FilterDecision::Keep);
    }

    #[test]
    fn excludes_python_versions_and_above() {
        let cfg = MirrorConfig::from_str(
            "[mirror]\ndirectory=/tmp/m\nmaster=https://pypi.org\n\n[platform_file]\npy-versions = py3.10+\n",
        )
        .unwrap();
        let filter = PlatformExclusion::from_section(&cfg, "platform_file").unwrap();
        let newer = wheel("pkg-1.0.0-cp311-cp311-manylinux_2_17_x86_64.whl");
        let older = wheel("pkg-1.0.0-cp39-cp39-manylinux_2_17_x86_64.whl");
        let newer_ctx = FileContext { project: "pkg", version: "1.0.0", file: &newer };
        let older_ctx = FileContext { project: "pkg", version: "1.0.0", file: &older };
        assert_eq!(filter.evaluate(&newer_ctx), FilterDecision::Drop);
        assert_eq!(filter.evaluate(&older_ctx), FilterDecision::Keep);
    }

    #[test]
    fn regex_file_drops_matching_filename() {
        let cfg = MirrorConfig::from_str(
            "[mirror]\ndirectory=/tmp/m\nmaster=https://pypi.org\n\n[regex_file]\npattern = -linux_i686\\.whl$\n",
        )
        .unwrap();
        let filter = RegexFilter::from_section(&cfg, "regex_file").unwrap();
        let file = wheel("pkg-1.0.0-cp310-cp310-linux_i686.whl");
        let ctx = FileContext { project: "pkg", version: "1.0.0", file: &file };
        assert_eq!(filter.evaluate(&ctx), FilterDecision::Drop);
    }
}
