//! A practical PEP 440 version and specifier implementation.
//!
//! Covers what the filter chain and latest-N sort need: release segment
//! comparison, pre/post/dev qualifiers, and the comparison operators used
//! by allow/deny-list and pinned-version filters (`==`, `!=`, `<=`, `>=`,
//! `<`, `>`, `~=`, `===`). Local version segments (`+foo`) are parsed but
//! excluded from ordering, matching PEP 440's public-version comparison.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub epoch: u64,
    pub release: Vec<u64>,
    pub pre: Option<(PreTag, u64)>,
    pub post: Option<u64>,
    pub dev: Option<u64>,
    pub local: Option<String>,
    original: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreTag {
    A,
    B,
    Rc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid PEP 440 version: {}", self.0)
    }
}
impl std::error::Error for ParseError {}

impl FromStr for Version {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_version(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

/// Any non-empty pre, dev, or explicit marker makes a release a pre-release.
impl Version {
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }
}

fn parse_version(s: &str) -> Result<Version, ParseError> {
    let original = s.to_string();
    let s = s.trim();
    let lower = s.to_ascii_lowercase();
    let lower = lower.strip_prefix('v').unwrap_or(&lower);

    let (main, local) = match lower.split_once('+') {
        Some((m, l)) => (m, Some(l.to_string())),
        None => (lower, None),
    };

    // epoch!release
    let (epoch_str, rest) = match main.split_once('!') {
        Some((e, r)) => (Some(e), r),
        None => (None, main),
    };
    let epoch = match epoch_str {
        Some(e) => e
            .parse()
            .map_err(|_| ParseError(format!("bad epoch in {s}")))?,
        None => 0,
    };

    // Split off dev segment first (always trailing).
    let (rest, dev) = split_dev(rest);
    // Split off post segment.
    let (rest, post) = split_post(rest)?;
    // Split off pre segment.
    let (release_str, pre) = split_pre(rest)?;

    if release_str.is_empty() {
        return Err(ParseError(format!("missing release segment in {s}")));
    }
    let mut release = Vec::new();
    for part in release_str.split('.') {
        let n: u64 = part
            .parse()
            .map_err(|_| ParseError(format!("bad release segment '{part}' in {s}")))?;
        release.push(n);
    }

    Ok(Version {
        epoch,
        release,
        pre,
        post,
        dev,
        local,
        original,
    })
}

fn split_dev(s: &str) -> (&str, Option<u64>) {
    if let Some(idx) = s.find(".dev").or_else(|| s.find("dev")) {
        let (head, tail) = s.split_at(idx);
        let tail = tail.trim_start_matches('.').trim_start_matches("dev");
        let n = tail.parse().unwrap_or(0);
        (head, Some(n))
    } else {
        (s, None)
    }
}

fn split_post(s: &str) -> Result<(&str, Option<u64>), ParseError> {
    for marker in [".post", "-post", "post", "."] {
        if marker == "." {
            break;
        }
        if let Some(idx) = s.find(marker) {
            let (head, tail) = s.split_at(idx);
            let tail = tail.trim_start_matches(['.', '-']).trim_start_matches("post");
            let n = tail
                .parse()
                .map_err(|_| ParseError(format!("bad post segment in {s}")))?;
            return Ok((head, Some(n)));
        }
    }
    Ok((s, None))
}

fn split_pre(s: &str) -> Result<(&str, Option<(PreTag, u64)>), ParseError> {
    for (marker, tag) in [("rc", PreTag::Rc), ("a", PreTag::A), ("b", PreTag::B)] {
        if let Some(idx) = s.find(marker) {
            // Guard against matching inside the numeric release, e.g. "1.0" has no 'a'/'b'/'rc'.
            let (head, tail) = s.split_at(idx);
            if head.is_empty() || !head.chars().next_back().unwrap().is_ascii_digit() {
                continue;
            }
            let digits = tail.trim_start_matches(marker);
            let n = if digits.is_empty() {
                0
            } else {
                digits
                    .parse()
                    .map_err(|_| ParseError(format!("bad pre-release segment in {s}")))?
            };
            return Ok((head, Some((tag, n))));
        }
    }
    Ok((s, None))
}

fn cmp_release(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.epoch.cmp(&other.epoch) {
            Ordering::Equal => {}
            other => return other,
        }
        match cmp_release(&self.release, &other.release) {
            Ordering::Equal => {}
            other => return other,
        }
        // Pre-release sorts before the final release; absence of pre beats presence.
        match (&self.pre, &other.pre) {
            (None, None) => {}
            (None, Some(_)) => return Ordering::Greater,
            (Some(_), None) => return Ordering::Less,
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Equal => {}
                other => return other,
            },
        }
        match self.post.cmp(&other.post) {
            Ordering::Equal => {}
            other => return other,
        }
        // Dev release sorts before the corresponding non-dev release.
        match (&self.dev, &other.dev) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Compatible,
    ArbitraryEq,
}

#[derive(Debug, Clone)]
pub struct Specifier {
    pub operator: Operator,
    pub version: Version,
}

impl FromStr for Specifier {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        for (token, op) in [
            ("===", Operator::ArbitraryEq),
            ("~=", Operator::Compatible),
            ("==", Operator::Eq),
            ("!=", Operator::NotEq),
            ("<=", Operator::Le),
            (">=", Operator::Ge),
            ("<", Operator::Lt),
            (">", Operator::Gt),
        ] {
            if let Some(rest) = s.strip_prefix(token) {
                let rest = rest.trim().trim_end_matches(".*");
                let version = parse_version(rest)?;
                return Ok(Specifier { operator: op, version });
            }
        }
        Err(ParseError(format!("unrecognized specifier {s}")))
    }
}

impl Specifier {
    pub fn matches(&self, candidate: &Version) -> bool {
        match self.operator {
            Operator::Eq => candidate.release == self.version.release
                && candidate.pre == self.version.pre
                && candidate.post == self.version.post
                && candidate.dev == self.version.dev
                && candidate.epoch == self.version.epoch,
            Operator::NotEq => !self.matches_eq(candidate),
            Operator::Lt => candidate < &self.version,
            Operator::Le => candidate <= &self.version,
            Operator::Gt => candidate > &self.version,
            Operator::Ge => candidate >= &self.version,
            Operator::ArbitraryEq => candidate.original == self.version.original,
            Operator::Compatible => {
                // ~=X.Y.Z means >=X.Y.Z, ==X.Y.* (drop the last release segment)
                let mut prefix = self.version.release.clone();
                prefix.pop();
                candidate >= &self.version && candidate.release.starts_with(&prefix)
            }
        }
    }

    fn matches_eq(&self, candidate: &Version) -> bool {
        candidate.release == self.version.release
            && candidate.pre == self.version.pre
            && candidate.post == self.version.post
            && candidate.dev == self.version.dev
            && candidate.epoch == self.version.epoch
    }
}

/// A comma-separated set of specifiers, all of which must match (PEP 508 style).
#[derive(Debug, Clone, Default)]
pub struct SpecifierSet {
    pub specifiers: Vec<Specifier>,
}

impl FromStr for SpecifierSet {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let specifiers = s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Specifier::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SpecifierSet { specifiers })
    }
}

impl SpecifierSet {
    pub fn matches(&self, candidate: &Version) -> bool {
        self.specifiers.iter().all(|spec| spec.matches(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_release_segments_numerically() {
        let a: Version = "1.9.0".parse().unwrap();
        let b: Version = "1.10.0".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn prerelease_sorts_before_final() {
        let pre: Version = "1.0.0a1".parse().unwrap();
        let finale: Version = "1.0.0".parse().unwrap();
        assert!(pre < finale);
        assert!(pre.is_prerelease());
        assert!(!finale.is_prerelease());
    }

    #[test]
    fn dev_sorts_before_corresponding_release() {
        let dev: Version = "2.0.0.dev1".parse().unwrap();
        let finale: Version = "2.0.0".parse().unwrap();
        assert!(dev < finale);
        assert!(dev.is_prerelease());
    }

    #[test]
    fn post_release_sorts_after_base() {
        let base: Version = "1.0.0".parse().unwrap();
        let post: Version = "1.0.0.post1".parse().unwrap();
        assert!(base < post);
    }

    #[test]
    fn compatible_operator_pins_prefix() {
        let spec: Specifier = "~=2.2".parse().unwrap();
        assert!(spec.matches(&"2.3.0".parse().unwrap()));
        assert!(!spec.matches(&"3.0.0".parse().unwrap()));
        assert!(!spec.matches(&"2.1.0".parse().unwrap()));
    }

    #[test]
    fn specifier_set_requires_all_to_match() {
        let set: SpecifierSet = ">=1.0,<2.0".parse().unwrap();
        assert!(set.matches(&"1.5.0".parse().unwrap()));
        assert!(!set.matches(&"2.0.0".parse().unwrap()));
    }

    #[test]
    fn local_segment_is_parsed_but_excluded_from_ordering() {
        let a: Version = "1.0.0+local1".parse().unwrap();
        let b: Version = "1.0.0+local2".parse().unwrap();
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a.local.as_deref(), Some("local1"));
    }
}
