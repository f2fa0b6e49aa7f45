//! Build-candidate version numbers.
//!
//! A [`VersionNumber`] is `major.minor.patch` optionally followed by
//! `-rcN`. The `chrome_branch` tag travels with the value but takes no part
//! in equality or ordering.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors produced while reading or deriving version numbers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("malformed version string: {0:?}")]
    Malformed(String),

    #[error("{0} is a release version, not a candidate")]
    NotACandidate(String),

    #[error("version file does not define {0}")]
    MissingKey(&'static str),

    #[error("version {0} carries no chrome branch")]
    MissingChromeBranch(String),

    #[error("version {0} has no successor")]
    Overflow(String),
}

/// Which component of the release number a builder bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrType {
    Build,
    Branch,
    Patch,
    ChromeBranch,
}

impl FromStr for IncrType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(IncrType::Build),
            "branch" => Ok(IncrType::Branch),
            "patch" => Ok(IncrType::Patch),
            "chrome_branch" => Ok(IncrType::ChromeBranch),
            other => Err(format!("unknown increment type: {other}")),
        }
    }
}

/// A release or candidate version.
#[derive(Debug, Clone)]
pub struct VersionNumber {
    major: u32,
    minor: u32,
    patch: u32,
    candidate: Option<u32>,
    chrome_branch: Option<u32>,
}

impl VersionNumber {
    /// A bare release version, `major.minor.patch`.
    pub fn release(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            candidate: None,
            chrome_branch: None,
        }
    }

    /// A candidate version, `major.minor.patch-rcN`.
    pub fn candidate(major: u32, minor: u32, patch: u32, candidate: u32) -> Self {
        Self {
            candidate: Some(candidate),
            ..Self::release(major, minor, patch)
        }
    }

    pub fn with_chrome_branch(mut self, chrome_branch: u32) -> Self {
        self.chrome_branch = Some(chrome_branch);
        self
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn patch(&self) -> u32 {
        self.patch
    }

    pub fn candidate_index(&self) -> Option<u32> {
        self.candidate
    }

    pub fn chrome_branch(&self) -> Option<u32> {
        self.chrome_branch
    }

    /// The chrome branch, or an error naming this version if it has none.
    pub fn require_chrome_branch(&self) -> Result<u32, VersionError> {
        self.chrome_branch
            .ok_or_else(|| VersionError::MissingChromeBranch(self.to_string()))
    }

    pub fn is_candidate(&self) -> bool {
        self.candidate.is_some()
    }

    /// The next re-spin of this candidate. Release versions have no re-spin.
    pub fn increment(&self) -> Result<Self, VersionError> {
        let candidate = self
            .candidate
            .ok_or_else(|| VersionError::NotACandidate(self.to_string()))?;
        let next = candidate
            .checked_add(1)
            .ok_or_else(|| VersionError::Overflow(self.to_string()))?;
        Ok(Self {
            candidate: Some(next),
            ..self.clone()
        })
    }

    /// The first candidate of this version's base; candidates are unchanged.
    pub fn as_candidate(&self) -> Self {
        Self {
            candidate: Some(self.candidate.unwrap_or(1)),
            ..self.clone()
        }
    }

    /// The release version underneath a candidate.
    pub fn base(&self) -> Self {
        Self {
            candidate: None,
            ..self.clone()
        }
    }

    /// True when both share `major.minor.patch`.
    pub fn same_base(&self, other: &Self) -> bool {
        self.release_tuple() == other.release_tuple()
    }

    /// Bump the release number the way a builder of `incr` type does.
    ///
    /// `build` and `chrome_branch` bump the build number and reset the rest.
    /// `branch` bumps the branch number unless a patch is already in flight.
    /// Everything else bumps the patch number.
    pub fn bump_release(&self, incr: IncrType) -> Result<Self, VersionError> {
        let overflow = || VersionError::Overflow(self.to_string());
        let bump = |n: u32| n.checked_add(1).ok_or_else(overflow);

        let mut next = self.base();
        if incr == IncrType::ChromeBranch {
            next.chrome_branch = self.chrome_branch.map(&bump).transpose()?;
        }
        match incr {
            IncrType::Build | IncrType::ChromeBranch => {
                next.major = bump(self.major)?;
                next.minor = 0;
                next.patch = 0;
            }
            IncrType::Branch if self.patch == 0 => next.minor = bump(self.minor)?,
            _ => next.patch = bump(self.patch)?,
        }
        Ok(next)
    }

    /// Read the release version out of a `KEY=value` version file.
    pub fn from_version_file(text: &str) -> Result<Self, VersionError> {
        let find = |key: &'static str| -> Result<u32, VersionError> {
            text.lines()
                .filter_map(|line| {
                    let (k, v) = line.trim().split_once('=')?;
                    (k.trim() == key).then(|| v.trim().parse::<u32>().ok())?
                })
                .next()
                .ok_or(VersionError::MissingKey(key))
        };

        Ok(Self::release(
            find("CHROMEOS_BUILD")?,
            find("CHROMEOS_BRANCH")?,
            find("CHROMEOS_PATCH")?,
        )
        .with_chrome_branch(find("CHROME_BRANCH")?))
    }

    fn release_tuple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }

    fn ordering_key(&self) -> (u32, u32, u32, Option<u32>) {
        (self.major, self.minor, self.patch, self.candidate)
    }
}

fn parse_component(s: &str) -> Option<u32> {
    let leading_zero = s.len() > 1 && s.starts_with('0');
    if s.is_empty() || leading_zero || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl FromStr for VersionNumber {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || VersionError::Malformed(s.to_string());

        let (release, candidate) = match s.split_once("-rc") {
            Some((release, rc)) => (release, Some(parse_component(rc).ok_or_else(malformed)?)),
            None => (s, None),
        };

        let parts: Vec<u32> = release
            .split('.')
            .map(parse_component)
            .collect::<Option<_>>()
            .ok_or_else(malformed)?;
        let [major, minor, patch] = parts[..] else {
            return Err(malformed());
        };

        Ok(Self {
            major,
            minor,
            patch,
            candidate,
            chrome_branch: None,
        })
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(rc) = self.candidate {
            write!(f, "-rc{rc}")?;
        }
        Ok(())
    }
}

impl PartialEq for VersionNumber {
    fn eq(&self, other: &Self) -> bool {
        self.ordering_key() == other.ordering_key()
    }
}

impl Eq for VersionNumber {}

impl Hash for VersionNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ordering_key().hash(state);
    }
}

impl PartialOrd for VersionNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering_key().cmp(&other.ordering_key())
    }
}
