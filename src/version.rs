//! Charm code version parsing and comparison
//!
//! Charm versions are stored as git tags of the form `<track>/<version>`,
//! where the version is a three-component release optionally followed by
//! pre/post/dev/local markers (PEP 440 style). Examples:
//!
//! - `14/1.12.0` (released)
//! - `14/1.12.0.post1.dev0+71201f4.dirty` (development build)

use crate::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Charm code version
#[derive(Clone, Debug)]
pub struct CharmVersion {
    raw: String,
    /// Charmhub track
    pub track: String,
    /// The three release components after the track
    pub release: [u64; 3],
    /// Whether this version was released & correctly tagged
    ///
    /// `true` for charm code released to Charmhub, `false` for development
    /// builds (anything with pre/post/dev/local markers).
    pub released: bool,
    key: CmpKey,
}

// Comparison key per PEP 440: dev < pre < release < post, local compared last.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct CmpKey {
    release: [u64; 3],
    pre: PreKey,
    post: PostKey,
    dev: DevKey,
    local: LocalKey,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum PreKey {
    // a dev release with no pre/post segment sorts before everything else
    BeforeAll,
    Alpha(u64),
    Beta(u64),
    Rc(u64),
    Release,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum PostKey {
    Absent,
    Post(u64),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum DevKey {
    Dev(u64),
    Absent,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum LocalKey {
    Absent,
    Segments(Vec<LocalSegment>),
}

// numeric local segments always outrank alphanumeric ones
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum LocalSegment {
    Alpha(String),
    Number(u64),
}

#[derive(Clone, Copy)]
enum PreTag {
    Alpha,
    Beta,
    Rc,
}

struct Parsed {
    release: Vec<u64>,
    pre: Option<(PreTag, u64)>,
    post: Option<u64>,
    dev: Option<u64>,
    local: Option<Vec<LocalSegment>>,
}

impl CharmVersion {
    pub fn parse(version: &str) -> Result<Self> {
        let invalid = |detail: String| Error::InvalidVersion(format!("{version:?}: {detail}"));
        let Some((track, pep440)) = version.split_once('/') else {
            return Err(invalid("expected \"<track>/<version>\"".to_string()));
        };
        if track.is_empty() {
            return Err(invalid("empty track".to_string()));
        }
        if pep440.contains('!') {
            return Err(invalid("PEP 440 epoch (\"!\" character) not supported".to_string()));
        }
        let parsed = parse_pep440(pep440).map_err(|detail| invalid(detail))?;
        let base = parsed
            .release
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(".");
        if parsed.release.len() != 3 {
            return Err(invalid(format!(
                "expected 3 number components after track; got {} components instead: {base:?}",
                parsed.release.len()
            )));
        }
        let release = [parsed.release[0], parsed.release[1], parsed.release[2]];
        let key = CmpKey {
            release,
            pre: match parsed.pre {
                Some((PreTag::Alpha, n)) => PreKey::Alpha(n),
                Some((PreTag::Beta, n)) => PreKey::Beta(n),
                Some((PreTag::Rc, n)) => PreKey::Rc(n),
                None if parsed.post.is_none() && parsed.dev.is_some() => PreKey::BeforeAll,
                None => PreKey::Release,
            },
            post: parsed.post.map_or(PostKey::Absent, PostKey::Post),
            dev: parsed.dev.map_or(DevKey::Absent, DevKey::Dev),
            local: parsed.local.map_or(LocalKey::Absent, LocalKey::Segments),
        };
        Ok(Self {
            raw: version.to_string(),
            track: track.to_string(),
            release,
            released: pep440 == base,
            key,
        })
    }

    /// Incremented when a refresh is not supported or needs an intermediate charm
    ///
    /// Refreshing between two versions with equal tracks and equal majors is
    /// supported without an intermediate charm version.
    pub fn major(&self) -> u64 {
        self.release[0]
    }

    /// Total order within a track; comparing across tracks is an error
    pub fn try_cmp(&self, other: &Self) -> Result<Ordering> {
        if self.track != other.track {
            return Err(Error::InvalidVersion(format!(
                "unable to compare versions with different tracks: {:?} and {:?} ({} and {})",
                self.track, other.track, self, other
            )));
        }
        Ok(self.key.cmp(&other.key))
    }
}

fn parse_number(digits: &str) -> Result<u64, String> {
    if digits.is_empty() {
        // implicit zero, e.g. "1.2.0rc"
        return Ok(0);
    }
    digits
        .parse()
        .map_err(|_| format!("invalid number {digits:?}"))
}

fn parse_pre_tag(chunk: &str) -> Option<(PreTag, &str)> {
    // order matters: "rc" before single-letter tags
    if let Some(rest) = chunk.strip_prefix("rc") {
        Some((PreTag::Rc, rest))
    } else if let Some(rest) = chunk.strip_prefix('a') {
        Some((PreTag::Alpha, rest))
    } else if let Some(rest) = chunk.strip_prefix('b') {
        Some((PreTag::Beta, rest))
    } else {
        None
    }
}

fn parse_pep440(pep440: &str) -> Result<Parsed, String> {
    let (public, local) = match pep440.split_once('+') {
        Some((public, local)) => (public, Some(local)),
        None => (pep440, None),
    };
    if public.is_empty() {
        return Err("empty version".to_string());
    }

    let mut release = Vec::new();
    let mut pre = None;
    let mut post = None;
    let mut dev = None;
    // phases: release components, then pre, then post, then dev
    let mut phase = 0;
    for chunk in public.split('.') {
        if chunk.is_empty() {
            return Err("empty version component".to_string());
        }
        if phase == 0 && chunk.bytes().all(|b| b.is_ascii_digit()) {
            release.push(parse_number(chunk)?);
            continue;
        }
        if phase == 0 {
            // release component with an attached pre segment, e.g. "0rc1"
            let split = chunk.find(|c: char| !c.is_ascii_digit()).unwrap_or(0);
            if split > 0 {
                let (digits, tag) = chunk.split_at(split);
                let Some((kind, rest)) = parse_pre_tag(tag) else {
                    return Err(format!("unrecognized version component {chunk:?}"));
                };
                release.push(parse_number(digits)?);
                pre = Some((kind, parse_number(rest)?));
                phase = 1;
                continue;
            }
        }
        if let Some(rest) = chunk.strip_prefix("post") {
            if phase >= 2 {
                return Err(format!("misplaced version component {chunk:?}"));
            }
            post = Some(parse_number(rest)?);
            phase = 2;
            continue;
        }
        if let Some(rest) = chunk.strip_prefix("dev") {
            if phase >= 3 {
                return Err(format!("misplaced version component {chunk:?}"));
            }
            dev = Some(parse_number(rest)?);
            phase = 3;
            continue;
        }
        if phase == 0 {
            if let Some((kind, rest)) = parse_pre_tag(chunk) {
                if rest.bytes().all(|b| b.is_ascii_digit()) {
                    pre = Some((kind, parse_number(rest)?));
                    phase = 1;
                    continue;
                }
            }
        }
        return Err(format!("unrecognized version component {chunk:?}"));
    }

    let local = match local {
        Some(l) => Some(parse_local(l)?),
        None => None,
    };
    Ok(Parsed { release, pre, post, dev, local })
}

fn parse_local(local: &str) -> Result<Vec<LocalSegment>, String> {
    local
        .split('.')
        .map(|seg| {
            if seg.is_empty() || !seg.bytes().all(|b| b.is_ascii_alphanumeric()) {
                return Err(format!("invalid local version segment {seg:?}"));
            }
            if seg.bytes().all(|b| b.is_ascii_digit()) {
                Ok(LocalSegment::Number(parse_number(seg)?))
            } else {
                Ok(LocalSegment::Alpha(seg.to_string()))
            }
        })
        .collect()
}

impl FromStr for CharmVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CharmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// Equality is on the exact version string; two spellings of the same release
// ("1.0.0" and "01.0.0") are distinct charm tags.
impl PartialEq for CharmVersion {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl Eq for CharmVersion {}

impl PartialEq<str> for CharmVersion {
    fn eq(&self, other: &str) -> bool {
        self.raw == other
    }
}
impl PartialEq<&str> for CharmVersion {
    fn eq(&self, other: &&str) -> bool {
        self.raw == *other
    }
}

impl PartialOrd for CharmVersion {
    /// `None` across tracks, and for distinct tags that compare equal
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.track != other.track {
            return None;
        }
        match self.key.cmp(&other.key) {
            Ordering::Equal if self.raw != other.raw => None,
            ordering => Some(ordering),
        }
    }
}

/// Baseline charm code compatibility: released, same track and major, non-downgrade
///
/// Charm-specific `is_compatible` implementations layer workload checks on top
/// of this. Rollbacks are always recognized separately and never reach it.
pub fn charm_version_compatible(old: &CharmVersion, new: &CharmVersion) -> bool {
    if !(old.released && new.released) {
        // unreleased charms contain changes that do not affect the version
        // number; those changes could affect compatibility
        debug!("refresh from {old} to {new} involves an unreleased charm version");
        return false;
    }
    if old.track != new.track {
        debug!("refresh from track {:?} to {:?} is not supported", old.track, new.track);
        return false;
    }
    if old.major() != new.major() {
        debug!("refresh from major {} to {} needs an intermediate charm", old.major(), new.major());
        return false;
    }
    // charm code downgrades are not supported (rollbacks are)
    matches!(new.try_cmp(old), Ok(Ordering::Greater | Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> CharmVersion {
        CharmVersion::parse(s).unwrap()
    }

    #[test]
    fn parses_released_version() {
        let ver = v("14/1.12.0");
        assert_eq!(ver.track, "14");
        assert_eq!(ver.release, [1, 12, 0]);
        assert!(ver.released);
        assert_eq!(ver.major(), 1);
        assert_eq!(ver.to_string(), "14/1.12.0");
    }

    #[test]
    fn parses_development_build() {
        let ver = v("14/1.12.0.post1.dev0+71201f4.dirty");
        assert_eq!(ver.release, [1, 12, 0]);
        assert!(!ver.released);
        assert_eq!(ver.to_string(), "14/1.12.0.post1.dev0+71201f4.dirty");
    }

    #[test]
    fn parses_pre_releases() {
        assert!(!v("14/1.12.0rc1").released);
        assert!(!v("14/1.12.0.rc1").released);
        assert!(!v("14/1.12.0a2").released);
        assert!(!v("14/1.12.0+local").released);
    }

    #[test]
    fn rejects_malformed_versions() {
        assert!(CharmVersion::parse("1.12.0").is_err());
        assert!(CharmVersion::parse("14/1!1.12.0").is_err());
        assert!(CharmVersion::parse("14/1.12").is_err());
        assert!(CharmVersion::parse("14/1.12.0.1").is_err());
        assert!(CharmVersion::parse("14/1.12.x").is_err());
        assert!(CharmVersion::parse("14/").is_err());
        assert!(CharmVersion::parse("/1.12.0").is_err());
        assert!(CharmVersion::parse("14/1.12.0.dev0.post1").is_err());
    }

    #[test]
    fn component_count_error_names_base_version() {
        let err = CharmVersion::parse("14/1.12").unwrap_err().to_string();
        assert!(err.contains("got 2 components"), "{err}");
        assert!(err.contains("1.12"), "{err}");
    }

    #[test]
    fn orders_within_track() {
        assert!(v("14/1.12.0") > v("14/1.11.9"));
        assert!(v("14/1.12.0rc1") < v("14/1.12.0"));
        assert!(v("14/1.12.0a1") < v("14/1.12.0b1"));
        assert!(v("14/1.12.0b1") < v("14/1.12.0rc1"));
        assert!(v("14/1.12.0.dev0") < v("14/1.12.0rc1"));
        assert!(v("14/1.12.0.post1") > v("14/1.12.0"));
        assert!(v("14/1.12.0.post1.dev0") < v("14/1.12.0.post1"));
        assert!(v("14/1.12.0+a") > v("14/1.12.0"));
        assert!(v("14/1.12.0+2") > v("14/1.12.0+a"));
    }

    #[test]
    fn cross_track_comparison_fails() {
        let old = v("14/1.12.0");
        let new = v("16/1.0.0");
        assert_eq!(old.partial_cmp(&new), None);
        assert!(old.try_cmp(&new).is_err());
    }

    #[test]
    fn equality_accepts_string_form() {
        let ver = v("14/1.12.0");
        assert_eq!(ver, *"14/1.12.0");
        assert_eq!(ver, "14/1.12.0");
        assert_ne!(ver, "14/1.12.1");
    }

    #[test]
    fn baseline_compatibility() {
        assert!(charm_version_compatible(&v("14/1.12.0"), &v("14/1.13.2")));
        // rollback-style equality is compatible
        assert!(charm_version_compatible(&v("14/1.12.0"), &v("14/1.12.0")));
        // downgrade
        assert!(!charm_version_compatible(&v("14/1.13.0"), &v("14/1.12.0")));
        // major bump needs an intermediate charm
        assert!(!charm_version_compatible(&v("14/1.12.0"), &v("14/2.0.0")));
        // unreleased on either side
        assert!(!charm_version_compatible(&v("14/1.12.0.dev0"), &v("14/1.13.0")));
        assert!(!charm_version_compatible(&v("14/1.12.0"), &v("14/1.13.0+dirty")));
        // cross-track
        assert!(!charm_version_compatible(&v("14/1.12.0"), &v("16/1.12.0")));
    }
}
