//! Agent tool descriptors and series/arch selection.
//!
//! A tool is one pre-built agent binary tarball, tagged with the version,
//! OS series and architecture it was built for. Bootstrap narrows the
//! caller's list of candidate tools to those that exactly match the target
//! host and then installs the newest of them.

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from tool selection and manifest loading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolsError {
    /// The candidate list was empty before filtering.
    #[error("possible tools is empty")]
    Empty,

    /// No candidate matched the requested series and arch.
    #[error("no matching tools available")]
    NoMatch,

    /// A version string could not be parsed.
    #[error("invalid version {0:?}")]
    InvalidVersion(String),

    /// The tools manifest could not be read or parsed.
    #[error("invalid tools manifest: {0}")]
    Manifest(String),
}

/// Dotted numeric agent version (`major.minor.patch[.build]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

impl Version {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build: 0,
        }
    }
}

impl FromStr for Version {
    type Err = ToolsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ToolsError::InvalidVersion(s.to_string());
        let parts: Vec<&str> = s.trim().split('.').collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(invalid());
        }
        let mut nums = [0_u32; 4];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self {
            major: nums[0],
            minor: nums[1],
            patch: nums[2],
            build: nums[3],
        })
    }
}

impl TryFrom<String> for Version {
    type Error = ToolsError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.build > 0 {
            write!(f, ".{}", self.build)?;
        }
        Ok(())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch, self.build).cmp(&(
            other.major,
            other.minor,
            other.patch,
            other.build,
        ))
    }
}

/// A pre-built agent binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    /// Agent version.
    pub version: Version,
    /// OS series the binary targets (e.g. `bionic`).
    pub series: String,
    /// Architecture the binary targets (e.g. `amd64`).
    pub arch: String,
    /// Where the tarball can be fetched from on the target host.
    pub url: String,
    /// Expected SHA-256 of the tarball, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Tarball size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Tool {
    /// Binary version string, e.g. `1.16.0-bionic-amd64`.
    #[must_use]
    pub fn binary_version(&self) -> String {
        format!("{}-{}-{}", self.version, self.series, self.arch)
    }
}

/// Series/arch pair tools are matched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter<'a> {
    pub series: &'a str,
    pub arch: &'a str,
}

/// An ordered list of candidate tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsList {
    #[serde(default)]
    pub tools: Vec<Tool>,
}

impl ToolsList {
    #[must_use]
    pub fn new(tools: Vec<Tool>) -> Self {
        Self { tools }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tool> {
        self.tools.iter()
    }

    /// Select the tools whose series and arch exactly equal the filter.
    ///
    /// # Errors
    /// Returns [`ToolsError::Empty`] if the list has no tools at all, and
    /// [`ToolsError::NoMatch`] if none of them match.
    pub fn match_filter(&self, filter: &Filter<'_>) -> Result<ToolsList, ToolsError> {
        if self.is_empty() {
            return Err(ToolsError::Empty);
        }
        let matched: Vec<Tool> = self
            .tools
            .iter()
            .filter(|t| t.series == filter.series && t.arch == filter.arch)
            .cloned()
            .collect();
        if matched.is_empty() {
            return Err(ToolsError::NoMatch);
        }
        Ok(Self { tools: matched })
    }

    /// The tool with the highest version. Ties keep the earliest entry.
    #[must_use]
    pub fn newest(&self) -> Option<&Tool> {
        self.tools.iter().reduce(|best, t| {
            if t.version > best.version {
                t
            } else {
                best
            }
        })
    }

    /// Load a tools manifest from a YAML file.
    ///
    /// # Errors
    /// Returns [`ToolsError::Manifest`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ToolsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ToolsError::Manifest(format!("{}: {e}", path.display())))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ToolsError::Manifest(format!("{}: {e}", path.display())))
    }
}

impl FromIterator<Tool> for ToolsList {
    fn from_iter<I: IntoIterator<Item = Tool>>(iter: I) -> Self {
        Self {
            tools: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for ToolsList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let versions: Vec<String> = self.tools.iter().map(Tool::binary_version).collect();
        write!(f, "[{}]", versions.join(", "))
    }
}
