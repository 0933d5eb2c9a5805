//! Version constraint parsing for the `version` and `semver` operands.
//!
//! A constraint is a comma separated list of `<op> <version>` terms such as
//! `>= 1.2, < 2.0` or `~> 1.4.0`. The `semver` flavor requires exactly three
//! numeric segments.

use std::cmp::Ordering;
use std::fmt;

/// A parsed version: numeric segments plus an optional prerelease tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub segments: Vec<u64>,
    pub prerelease: Option<String>,
}

impl Version {
    /// Parses a version. Build metadata after `+` is accepted and dropped.
    pub fn parse(input: &str) -> Result<Self, String> {
        let s = input.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        let s = s.split_once('+').map_or(s, |(v, _)| v);
        let (core, prerelease) = match s.split_once('-') {
            Some((core, pre)) if pre.is_empty() => {
                return Err(format!("Malformed version: {input}"));
            }
            Some((core, pre)) => (core, Some(pre.to_string())),
            None => (s, None),
        };
        if core.is_empty() {
            return Err(format!("Malformed version: {input}"));
        }
        let segments = core
            .split('.')
            .map(|seg| seg.parse::<u64>().map_err(|_| format!("Malformed version: {input}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            segments,
            prerelease,
        })
    }

    fn segment(&self, idx: usize) -> u64 {
        self.segments.get(idx).copied().unwrap_or(0)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for idx in 0..len {
            match self.segment(idx).cmp(&other.segment(idx)) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        // A prerelease sorts before the release it precedes.
        match (&self.prerelease, &other.prerelease) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.segments.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Pessimistic,
}

impl Op {
    fn split(term: &str) -> (Self, &str) {
        // Longest operators first.
        for (token, op) in [
            ("~>", Op::Pessimistic),
            (">=", Op::Ge),
            ("<=", Op::Le),
            ("!=", Op::Ne),
            (">", Op::Gt),
            ("<", Op::Lt),
            ("=", Op::Eq),
        ] {
            if let Some(rest) = term.strip_prefix(token) {
                return (op, rest);
            }
        }
        (Op::Eq, term)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Term {
    op: Op,
    version: Version,
}

impl Term {
    fn check(&self, v: &Version) -> bool {
        match self.op {
            Op::Eq => v == &self.version,
            Op::Ne => v != &self.version,
            Op::Gt => v > &self.version,
            Op::Ge => v >= &self.version,
            Op::Lt => v < &self.version,
            Op::Le => v <= &self.version,
            Op::Pessimistic => {
                if v < &self.version {
                    return false;
                }
                // `~> 1.4.2` pins every segment but the last given one.
                let pinned = self.version.segments.len().saturating_sub(1);
                (0..pinned).all(|idx| v.segment(idx) == self.version.segment(idx))
            }
        }
    }
}

/// A conjunction of version comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    terms: Vec<Term>,
}

impl VersionConstraint {
    /// Parses a constraint in the lenient `version` flavor.
    pub fn parse(input: &str) -> Result<Self, String> {
        Self::parse_inner(input, false)
    }

    /// Parses a constraint in the strict `semver` flavor.
    pub fn parse_semver(input: &str) -> Result<Self, String> {
        Self::parse_inner(input, true)
    }

    fn parse_inner(input: &str, strict: bool) -> Result<Self, String> {
        let mut terms = Vec::new();
        for raw in input.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(format!("Malformed constraint: {input}"));
            }
            let (op, rest) = Op::split(raw);
            let version = Version::parse(rest)?;
            if strict && version.segments.len() != 3 {
                return Err(format!("Malformed semver: {}", rest.trim()));
            }
            terms.push(Term { op, version });
        }
        Ok(Self { terms })
    }

    /// Returns true if `version` satisfies every term.
    pub fn check(&self, version: &Version) -> bool {
        self.terms.iter().all(|t| t.check(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[rstest]
    #[case(">= 1.2, < 2.0", "1.5.0", true)]
    #[case(">= 1.2, < 2.0", "2.0.0", false)]
    #[case("= 1.0", "1.0.0", true)]
    #[case("!= 1.0", "1.0.0", false)]
    #[case("~> 1.4.2", "1.4.9", true)]
    #[case("~> 1.4.2", "1.5.0", false)]
    #[case("~> 1.4", "1.9.0", true)]
    #[case("~> 1.4", "2.0.0", false)]
    #[case("> 1.0.0", "1.0.1-beta", true)]
    fn test_version_constraint_check(#[case] c: &str, #[case] version: &str, #[case] ok: bool) {
        let constraint = VersionConstraint::parse(c).unwrap();
        assert_eq!(constraint.check(&v(version)), ok, "{c} vs {version}");
    }

    #[rstest]
    #[case("")]
    #[case(">= ")]
    #[case("1.x")]
    #[case(">= 1.0,")]
    fn test_version_constraint_rejects(#[case] c: &str) {
        assert!(VersionConstraint::parse(c).is_err());
    }

    #[test]
    fn test_semver_requires_three_segments() {
        assert!(VersionConstraint::parse_semver(">= 1.2.3").is_ok());
        assert!(VersionConstraint::parse_semver(">= 1.2").is_err());
    }

    #[test]
    fn test_prerelease_ordering() {
        assert!(v("1.0.0-rc1") < v("1.0.0"));
        assert!(v("1.0") == v("1.0.0"));
        assert_eq!(v("v1.2.3+build").to_string(), "1.2.3");
    }
}
