//! Bootstrap argument validation.
//!
//! Everything here is local: a request that fails validation never opens a
//! remote session or touches storage.

use thiserror::Error;

use crate::bootstrap::BootstrapArgs;
use crate::tools::{Filter, ToolsError, ToolsList};

/// A structurally invalid bootstrap request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("host argument is empty")]
    EmptyHost,

    #[error("environ argument is nil")]
    NilEnviron,

    #[error("data-dir argument is empty")]
    EmptyDataDir,

    #[error("possible tools is empty")]
    EmptyTools,

    #[error("no matching tools available")]
    NoMatchingTools,

    /// The host runs a different series than requested.
    #[error("series mismatch: requested {requested:?}, host runs {detected:?}")]
    SeriesMismatch { requested: String, detected: String },

    /// The host has a different architecture than requested.
    #[error("arch mismatch: requested {requested:?}, host is {detected:?}")]
    ArchMismatch { requested: String, detected: String },

    /// Neither the caller nor detection produced a series or arch.
    #[error("cannot determine target {0}")]
    Unresolved(&'static str),
}

impl From<ToolsError> for ValidationError {
    fn from(e: ToolsError) -> Self {
        match e {
            ToolsError::Empty => Self::EmptyTools,
            _ => Self::NoMatchingTools,
        }
    }
}

/// Check a request before any remote work.
///
/// When both the target series and arch are already known, the tools are
/// filtered here too and the matching subset is returned; otherwise tool
/// filtering waits for detection and `None` is returned.
///
/// # Errors
/// Returns the first violated requirement.
pub fn validate_args(args: &BootstrapArgs) -> Result<Option<ToolsList>, ValidationError> {
    if args.host.trim().is_empty() {
        return Err(ValidationError::EmptyHost);
    }
    if args.environ.is_none() {
        return Err(ValidationError::NilEnviron);
    }
    if args.data_dir.as_os_str().is_empty() {
        return Err(ValidationError::EmptyDataDir);
    }
    if args.possible_tools.is_empty() {
        return Err(ValidationError::EmptyTools);
    }

    let arch = args.hardware.as_ref().and_then(|hw| hw.arch.as_deref());
    match (args.series.as_deref(), arch) {
        (Some(series), Some(arch)) => Ok(Some(select_tools(&args.possible_tools, series, arch)?)),
        _ => Ok(None),
    }
}

/// Narrow `tools` to those built for exactly `series` and `arch`.
///
/// # Errors
/// Returns [`ValidationError::EmptyTools`] or
/// [`ValidationError::NoMatchingTools`].
pub fn select_tools(tools: &ToolsList, series: &str, arch: &str) -> Result<ToolsList, ValidationError> {
    Ok(tools.match_filter(&Filter { series, arch })?)
}

/// Reconcile a caller-supplied value with a detected one.
///
/// # Errors
/// Returns a mismatch error when both are present and differ, and
/// [`ValidationError::Unresolved`] when neither is.
pub fn reconcile(
    what: &'static str,
    requested: Option<&str>,
    detected: Option<&str>,
) -> Result<String, ValidationError> {
    match (requested, detected) {
        (Some(r), Some(d)) if r != d => Err(if what == "series" {
            ValidationError::SeriesMismatch {
                requested: r.to_string(),
                detected: d.to_string(),
            }
        } else {
            ValidationError::ArchMismatch {
                requested: r.to_string(),
                detected: d.to_string(),
            }
        }),
        (Some(v), _) | (None, Some(v)) => Ok(v.to_string()),
        (None, None) => Err(ValidationError::Unresolved(what)),
    }
}
