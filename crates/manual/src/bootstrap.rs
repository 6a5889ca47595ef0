//! Manual bootstrap of a controller onto an existing host.
//!
//! The sequence is strictly ordered:
//! 1. Validate the request locally
//! 2. Refuse if the environment already has a bootstrap state record
//! 3. Probe the host for an existing agent (and its series/hardware if needed)
//! 4. Select the tools built for the host
//! 5. Run the install script
//! 6. Write the state record on success, or make sure none exists on failure
//!
//! The state record is the commit point: an attempt that reports failure
//! never leaves a record behind, and success is only reported once the
//! record is stored.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::context::BootstrapContext;
use crate::detect::{self, DetectError};
use crate::environ::Environ;
use crate::hardware::HardwareCharacteristics;
use crate::remote::{RemoteError, RemoteExecutor};
use crate::script::{self, ProvisionParams, ScriptError};
use crate::state::{self, BootstrapState, StateError, StateStorage};
use crate::tools::ToolsList;
use crate::validate::{self, ValidationError};

/// Progress of one bootstrap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapPhase {
    NotStarted,
    Validated,
    Detecting,
    AlreadyProvisioned,
    NotProvisioned,
    Executing,
    Succeeded,
    Failed,
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not started",
            Self::Validated => "validated",
            Self::Detecting => "detecting",
            Self::AlreadyProvisioned => "already provisioned",
            Self::NotProvisioned => "not provisioned",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Errors from a bootstrap attempt.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// The request is malformed; nothing was done.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The environment or host is already bootstrapped; nothing was done.
    #[error("machine is already provisioned")]
    AlreadyProvisioned,

    /// The host could not be reached.
    #[error("{phase} {host}: {source}")]
    Connectivity {
        host: String,
        phase: BootstrapPhase,
        #[source]
        source: RemoteError,
    },

    /// The host was reached but could not be inspected.
    #[error("failed to check provisioned status of {host}: {source}")]
    Detection {
        host: String,
        #[source]
        source: DetectError,
    },

    /// The install script failed; the host may be partially provisioned.
    #[error("bootstrapping {host} failed: {source}")]
    Script {
        host: String,
        #[source]
        source: ScriptError,
    },

    /// The state record could not be read or written.
    #[error("{phase}: bootstrap state: {source}")]
    Storage {
        phase: BootstrapPhase,
        #[source]
        source: StateError,
    },

    /// An attempt failed and removing the state record failed as well.
    #[error("{original}; additionally failed to remove bootstrap state: {rollback}")]
    Rollback {
        original: Box<BootstrapError>,
        rollback: StateError,
    },
}

impl BootstrapError {
    /// True for the "nothing to do" outcome.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        matches!(self, Self::AlreadyProvisioned)
    }
}

/// A request to bootstrap one host.
#[derive(Clone)]
pub struct BootstrapArgs {
    /// Target in `user@host` form.
    pub host: String,
    /// Agent data directory on the host.
    pub data_dir: PathBuf,
    /// Environment whose storage records the outcome.
    pub environ: Option<Arc<dyn Environ>>,
    /// Candidate agent tools.
    pub possible_tools: ToolsList,
    /// Target OS series; detected on the host when `None`.
    pub series: Option<String>,
    /// Target hardware; the arch is detected on the host when unset.
    pub hardware: Option<HardwareCharacteristics>,
    pub context: BootstrapContext,
}

impl fmt::Debug for BootstrapArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapArgs")
            .field("host", &self.host)
            .field("data_dir", &self.data_dir)
            .field("environ", &self.environ.as_ref().map(|e| e.name().to_string()))
            .field("possible_tools", &self.possible_tools.len())
            .field("series", &self.series)
            .field("hardware", &self.hardware)
            .finish_non_exhaustive()
    }
}

/// Runs bootstrap attempts over an injected remote executor.
#[derive(Clone)]
pub struct Bootstrapper {
    executor: Arc<dyn RemoteExecutor>,
}

impl Bootstrapper {
    #[must_use]
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    /// Bootstrap `args.host` as the environment's controller.
    ///
    /// Returns the state record that was written.
    ///
    /// # Errors
    /// Returns [`BootstrapError::AlreadyProvisioned`] if the environment or
    /// host is already bootstrapped, and a descriptive error for every other
    /// failure.
    pub async fn bootstrap(&self, args: &BootstrapArgs) -> Result<BootstrapState, BootstrapError> {
        let ctx = &args.context;
        let host = args.host.as_str();
        transition(host, BootstrapPhase::NotStarted);

        let prefiltered = validate::validate_args(args)?;
        let Some(environ) = args.environ.as_deref() else {
            return Err(ValidationError::NilEnviron.into());
        };
        let storage = environ.storage();
        transition(host, BootstrapPhase::Validated);

        transition(host, BootstrapPhase::Detecting);
        match state::load_state(storage).await {
            Ok(existing) => {
                warn!(host = %host, instances = ?existing.state_instances, "Environment already has a bootstrap state record");
                transition(host, BootstrapPhase::AlreadyProvisioned);
                return Err(BootstrapError::AlreadyProvisioned);
            }
            Err(StateError::NotBootstrapped) => {}
            Err(source) => {
                return Err(BootstrapError::Storage {
                    phase: BootstrapPhase::Detecting,
                    source,
                })
            }
        }

        let requested_arch = args.hardware.as_ref().and_then(|hw| hw.arch.clone());
        let need_hardware = args.series.is_none() || requested_arch.is_none();
        ctx.progress(format!("Checking {host} for an existing agent"));
        let status = detect::detect(self.executor.as_ref(), host, &args.data_dir, need_hardware, ctx)
            .await
            .map_err(|e| detection_error(host, e))?;
        if status.already_provisioned {
            transition(host, BootstrapPhase::AlreadyProvisioned);
            return Err(BootstrapError::AlreadyProvisioned);
        }
        transition(host, BootstrapPhase::NotProvisioned);

        let detected_hw = status.detected_hardware.unwrap_or_default();
        let series = validate::reconcile(
            "series",
            args.series.as_deref(),
            status.detected_series.as_deref(),
        )?;
        let arch = validate::reconcile("arch", requested_arch.as_deref(), detected_hw.arch.as_deref())?;
        let hardware = merge_hardware(args.hardware.as_ref(), detected_hw, &arch);

        let tools = match prefiltered {
            Some(tools) => tools,
            None => {
                info!(host = %host, series = %series, arch = %arch, "Filtering possible tools: {}", args.possible_tools);
                validate::select_tools(&args.possible_tools, &series, &arch)?
            }
        };
        let tool = tools
            .newest()
            .ok_or(ValidationError::NoMatchingTools)?;
        debug!(host = %host, candidates = tools.len(), selected = %tool.binary_version(), "Selected tools");

        transition(host, BootstrapPhase::Executing);
        let params = ProvisionParams {
            data_dir: &args.data_dir,
            environ_name: environ.name(),
            tool,
            series: &series,
            hardware: &hardware,
        };
        let instances = match script::provision_machine_agent(self.executor.as_ref(), host, &params, ctx).await {
            Ok(instances) => instances,
            Err(source) => {
                let err = BootstrapError::Script {
                    host: host.to_string(),
                    source,
                };
                return Err(fail(storage, host, err).await);
            }
        };

        let record = BootstrapState {
            characteristics: vec![hardware; instances.len()],
            state_instances: instances,
        };
        if let Err(source) = state::save_state(storage, &record).await {
            let err = BootstrapError::Storage {
                phase: BootstrapPhase::Executing,
                source,
            };
            return Err(fail(storage, host, err).await);
        }

        transition(host, BootstrapPhase::Succeeded);
        ctx.progress(format!("Bootstrapped {host}"));
        Ok(record)
    }
}

fn transition(host: &str, phase: BootstrapPhase) {
    debug!(host = %host, phase = %phase, "Bootstrap phase");
}

fn detection_error(host: &str, err: DetectError) -> BootstrapError {
    match err {
        DetectError::Remote(source) => BootstrapError::Connectivity {
            host: host.to_string(),
            phase: BootstrapPhase::Detecting,
            source,
        },
        source => BootstrapError::Detection {
            host: host.to_string(),
            source,
        },
    }
}

/// Make sure no state record survives a failed attempt.
async fn fail(storage: &dyn StateStorage, host: &str, err: BootstrapError) -> BootstrapError {
    error!(host = %host, error = %err, "Bootstrapping failed, removing state file");
    transition(host, BootstrapPhase::Failed);
    match state::remove_state(storage).await {
        Ok(()) => err,
        Err(rollback) => BootstrapError::Rollback {
            original: Box::new(err),
            rollback,
        },
    }
}

/// Caller-supplied fields win; detection fills the gaps.
fn merge_hardware(
    requested: Option<&HardwareCharacteristics>,
    detected: HardwareCharacteristics,
    arch: &str,
) -> HardwareCharacteristics {
    let requested = requested.cloned().unwrap_or_default();
    HardwareCharacteristics {
        arch: Some(arch.to_string()),
        mem: requested.mem.or(detected.mem),
        cpu_cores: requested.cpu_cores.or(detected.cpu_cores),
        root_disk: requested.root_disk.or(detected.root_disk),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_hardware_prefers_requested() {
        let requested = HardwareCharacteristics {
            arch: Some("amd64".into()),
            mem: Some(1024),
            cpu_cores: None,
            root_disk: None,
        };
        let detected = HardwareCharacteristics {
            arch: Some("amd64".into()),
            mem: Some(4096),
            cpu_cores: Some(8),
            root_disk: None,
        };
        let merged = merge_hardware(Some(&requested), detected, "amd64");
        assert_eq!(merged.mem, Some(1024));
        assert_eq!(merged.cpu_cores, Some(8));
        assert_eq!(merged.arch.as_deref(), Some("amd64"));
    }

    #[test]
    fn test_is_provisioned() {
        assert!(BootstrapError::AlreadyProvisioned.is_provisioned());
        assert!(!BootstrapError::from(ValidationError::EmptyHost).is_provisioned());
    }

    #[test]
    fn test_error_messages_name_host_and_phase() {
        let err = BootstrapError::Connectivity {
            host: "ubuntu@node1".into(),
            phase: BootstrapPhase::Detecting,
            source: RemoteError::Timeout,
        };
        assert_eq!(err.to_string(), "detecting ubuntu@node1: operation timed out");

        let err = BootstrapError::Rollback {
            original: Box::new(BootstrapError::Script {
                host: "ubuntu@node1".into(),
                source: ScriptError::Failed {
                    exit_code: 1,
                    stderr_tail: "boom".into(),
                },
            }),
            rollback: StateError::NotBootstrapped,
        };
        let msg = err.to_string();
        assert!(msg.contains("bootstrap script exited with code 1"));
        assert!(msg.contains("additionally failed to remove bootstrap state"));
    }
}
