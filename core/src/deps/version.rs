// core/src/deps/version.rs
//! The subset of PEP 440 needed to decide whether an installed package
//! already satisfies a requirement.
use crate::deps::layers::{is_torch_family, spec_name};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Version {
    release: Vec<u64>,
    /// (0=a, 1=b, 2=rc, n)
    pre: Option<(u8, u64)>,
    post: Option<u64>,
    dev: Option<u64>,
    local: Option<String>,
}

fn split_number(s: &str) -> (u64, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    (s[..end].parse().unwrap_or(0), &s[end..])
}

impl Version {
    pub fn parse(raw: &str) -> Option<Version> {
        let raw = raw.trim().trim_start_matches(['v', 'V']).to_lowercase();
        let (public, local) = match raw.split_once('+') {
            Some((p, l)) => (p.to_string(), Some(l.to_string())),
            None => (raw.clone(), None),
        };
        let public = public.split_once('!').map(|(_, rest)| rest.to_string()).unwrap_or(public);

        let mut release = Vec::new();
        let mut rest = public.as_str();
        loop {
            if !rest.starts_with(|c: char| c.is_ascii_digit()) {
                break;
            }
            let (n, tail) = split_number(rest);
            release.push(n);
            rest = tail;
            match rest.strip_prefix('.') {
                Some(t) if t.starts_with(|c: char| c.is_ascii_digit()) => rest = t,
                _ => break,
            }
        }
        if release.is_empty() {
            return None;
        }

        let mut version = Version { release, pre: None, post: None, dev: None, local };
        let mut rest = rest.trim_start_matches(['.', '-', '_']);
        while !rest.is_empty() {
            let (tag, kind): (&str, Option<u8>) = if let Some(t) = rest.strip_prefix("rc") {
                (t, Some(2))
            } else if let Some(t) = rest.strip_prefix('c') {
                (t, Some(2))
            } else if let Some(t) = rest.strip_prefix("alpha").or_else(|| rest.strip_prefix('a')) {
                (t, Some(0))
            } else if let Some(t) = rest.strip_prefix("beta").or_else(|| rest.strip_prefix('b')) {
                (t, Some(1))
            } else if let Some(t) = rest.strip_prefix("post") {
                let (n, tail) = split_number(t.trim_start_matches(['.', '-', '_']));
                version.post = Some(n);
                rest = tail.trim_start_matches(['.', '-', '_']);
                continue;
            } else if let Some(t) = rest.strip_prefix("dev") {
                let (n, tail) = split_number(t.trim_start_matches(['.', '-', '_']));
                version.dev = Some(n);
                rest = tail.trim_start_matches(['.', '-', '_']);
                continue;
            } else {
                return None;
            };
            let (n, tail) = split_number(tag.trim_start_matches(['.', '-', '_']));
            version.pre = kind.map(|k| (k, n));
            rest = tail.trim_start_matches(['.', '-', '_']);
        }
        Some(version)
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn without_local(&self) -> Version {
        Version { local: None, ..self.clone() }
    }

    fn release_at(&self, i: usize) -> u64 {
        self.release.get(i).copied().unwrap_or(0)
    }

    fn cmp_release(&self, other: &Version) -> Ordering {
        let len = self.release.len().max(other.release.len());
        (0..len)
            .map(|i| self.release_at(i).cmp(&other.release_at(i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }

    // dev < pre < final < post
    fn phase_key(&self) -> (i8, u64, i8, u64, i8, u64) {
        let (pre_rank, pre_n) = match self.pre {
            Some((k, n)) => (k as i8, n),
            None if self.dev.is_some() && self.post.is_none() => (-1, 0),
            None => (3, 0),
        };
        let (post_rank, post_n) = match self.post {
            Some(n) => (1, n),
            None => (0, 0),
        };
        let (dev_rank, dev_n) = match self.dev {
            Some(n) => (0, n),
            None => (1, 0),
        };
        (pre_rank, pre_n, post_rank, post_n, dev_rank, dev_n)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_release(other)
            .then_with(|| self.phase_key().cmp(&other.phase_key()))
            .then_with(|| self.local.cmp(&other.local))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    Compatible,
    Arbitrary,
}

fn split_op(clause: &str) -> Option<(Op, &str)> {
    const OPS: [(&str, Op); 8] = [
        ("===", Op::Arbitrary),
        ("~=", Op::Compatible),
        ("==", Op::Eq),
        ("!=", Op::Ne),
        (">=", Op::Ge),
        ("<=", Op::Le),
        (">", Op::Gt),
        ("<", Op::Lt),
    ];
    let clause = clause.trim();
    OPS.iter()
        .find_map(|(prefix, op)| clause.strip_prefix(prefix).map(|rest| (*op, rest.trim())))
}

fn prefix_match(candidate: &Version, pattern: &str) -> bool {
    let Some(prefix) = Version::parse(pattern) else {
        return false;
    };
    prefix
        .release
        .iter()
        .enumerate()
        .all(|(i, n)| candidate.release_at(i) == *n)
}

fn clause_matches(candidate: &Version, raw_candidate: &str, clause: &str) -> Option<bool> {
    let (op, target) = split_op(clause)?;
    if op == Op::Arbitrary {
        return Some(raw_candidate.trim().eq_ignore_ascii_case(target));
    }
    if let Some(pattern) = target.strip_suffix(".*") {
        let hit = prefix_match(candidate, pattern);
        return match op {
            Op::Eq => Some(hit),
            Op::Ne => Some(!hit),
            _ => None,
        };
    }

    let wanted = Version::parse(target)?;
    // A spec without a local label ignores the candidate's local label.
    let cand = if wanted.local.is_none() { candidate.without_local() } else { candidate.clone() };
    Some(match op {
        Op::Eq => cand == wanted,
        Op::Ne => cand != wanted,
        Op::Ge => cand >= wanted,
        Op::Le => cand <= wanted,
        Op::Gt => cand > wanted,
        Op::Lt => cand < wanted,
        Op::Compatible => {
            if wanted.release.len() < 2 {
                return None;
            }
            let keep = wanted.release.len() - 1;
            cand >= wanted && (0..keep).all(|i| cand.release_at(i) == wanted.release_at(i))
        }
        Op::Arbitrary => false,
    })
}

/// Checks `version` against a comma separated specifier set such as
/// `>=3.20,<5`. Returns `None` when the set cannot be parsed.
pub fn version_matches(version: &str, specifiers: &str) -> Option<bool> {
    let candidate = Version::parse(version)?;
    let mut result = true;
    for clause in specifiers.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        result &= clause_matches(&candidate, version, clause)?;
    }
    Some(result)
}

/// Specifier part of a requirement (`numpy>=1.26,<2` -> `>=1.26,<2`).
pub fn spec_constraint(spec: &str) -> &str {
    let spec = spec.split(';').next().unwrap_or("").trim();
    let after_extras = match (spec.find('['), spec.find(']')) {
        (Some(_), Some(end)) => &spec[end + 1..],
        _ => spec,
    };
    let start = after_extras
        .find(|c: char| matches!(c, '<' | '>' | '=' | '!' | '~'))
        .unwrap_or(after_extras.len());
    after_extras[start..].trim()
}

/// Whether `installed` (normalized name -> version) already satisfies `spec`.
/// Torch-family local labels such as `+cpu` or `+cu126` are build metadata and
/// are dropped before comparing.
pub fn spec_satisfied(spec: &str, installed: &HashMap<String, String>) -> bool {
    let name = spec_name(spec);
    if name.is_empty() {
        return false;
    }
    let Some(current) = installed.get(&name).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return false;
    };
    let constraint = spec_constraint(spec);
    if constraint.is_empty() {
        return true;
    }
    let current = if is_torch_family(spec) {
        current.split('+').next().unwrap_or(current)
    } else {
        current
    };
    // Unparseable versions fall back to a presence check.
    version_matches(current, constraint).unwrap_or(true)
}

/// Local label of an installed torch build, e.g. `cu126` or `cpu`.
pub fn torch_local_tag(version: &str) -> Option<String> {
    version.split_once('+').map(|(_, tag)| tag.trim().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect()
    }

    #[test]
    fn ordering_follows_pep440_phases() {
        let v = |s| Version::parse(s).unwrap();
        assert!(v("1.0.dev1") < v("1.0a1"));
        assert!(v("1.0a1") < v("1.0rc1"));
        assert!(v("1.0rc1") < v("1.0"));
        assert!(v("1.0") < v("1.0.post1"));
        assert_eq!(v("1.0").cmp(&v("1.0.0")), Ordering::Equal);
        assert!(v("2.10") > v("2.9.1"));
        assert_eq!(v("2.7.1+cu126").local(), Some("cu126"));
    }

    #[test]
    fn operators() {
        assert_eq!(version_matches("1.26.4", ">=1.26.4,<2"), Some(true));
        assert_eq!(version_matches("2.0.1", ">=1.26.4,<2"), Some(false));
        assert_eq!(version_matches("3.20.3", ">=3.20,<5"), Some(true));
        assert_eq!(version_matches("2.9.2", "~=2.9.2"), Some(true));
        assert_eq!(version_matches("2.9.9", "~=2.9.2"), Some(true));
        assert_eq!(version_matches("2.10.0", "~=2.9.2"), Some(false));
        assert_eq!(version_matches("25.1", "~=25.0"), Some(true));
        assert_eq!(version_matches("26.0", "~=25.0"), Some(false));
        assert_eq!(version_matches("1.1.6", "!=1.1.5"), Some(true));
        assert_eq!(version_matches("1.23.7", "==1.23.*"), Some(true));
        assert_eq!(version_matches("1.24.0", "==1.23.*"), Some(false));
        assert_eq!(version_matches("1.0", "===1.0"), Some(true));
        assert_eq!(version_matches("1.0", "~=1"), None);
        assert_eq!(version_matches("garbage", ">=1"), None);
    }

    #[test]
    fn local_labels_ignored_by_plain_specs() {
        assert_eq!(version_matches("2.7.1+cu126", "==2.7.1"), Some(true));
        assert_eq!(version_matches("2.7.1+cu126", "==2.7.1+cpu"), Some(false));
    }

    #[test]
    fn satisfied_checks_name_and_constraint() {
        let map = installed(&[("numpy", "1.26.4"), ("typing-extensions", "4.12.2"), ("pix2text", "1.1.5")]);
        assert!(spec_satisfied("numpy>=1.26.4", &map));
        assert!(!spec_satisfied("numpy>=1.26.4,<1.26.4", &map));
        assert!(spec_satisfied("typing_extensions>=4.12.2", &map));
        assert!(!spec_satisfied("pix2text==1.1.6", &map));
        assert!(!spec_satisfied("lxml~=4.9.3", &map));
        assert!(spec_satisfied("numpy", &map));
    }

    #[test]
    fn torch_local_tag_is_stripped() {
        let map = installed(&[("torch", "2.7.1+cu126"), ("torchvision", "0.22.1+cpu")]);
        assert!(spec_satisfied("torch==2.7.1", &map));
        assert!(spec_satisfied("torchvision==0.22.1", &map));
        assert!(!spec_satisfied("torch==2.9.0", &map));
        assert_eq!(torch_local_tag("2.7.1+CU126").as_deref(), Some("cu126"));
        assert_eq!(torch_local_tag("2.7.1"), None);
    }

    #[test]
    fn constraint_extraction() {
        assert_eq!(spec_constraint("protobuf>=3.20,<5"), ">=3.20,<5");
        assert_eq!(spec_constraint("requests[socks]~=2.32.5 ; python_version>'3'"), "~=2.32.5");
        assert_eq!(spec_constraint("pix2text"), "");
    }
}
