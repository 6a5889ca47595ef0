//! Remote inspection of a candidate controller host.
//!
//! Two probes run over the remote executor: one checks whether a cluster
//! agent is already installed, the other reports the host's OS series and
//! hardware so that tools can be matched against it.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::context::BootstrapContext;
use crate::hardware::{normalise_arch, HardwareCharacteristics};
use crate::remote::{RemoteError, RemoteExecutor, RemoteOutput};
use crate::script::{quote, AGENT_SERVICE_PREFIX, MACHINE_TAG};

/// Errors from remote inspection.
#[derive(Error, Debug)]
pub enum DetectError {
    /// The transport failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The probe script ran but exited non-zero.
    #[error("probe exited with code {exit_code}: {stderr}")]
    ProbeFailed { exit_code: i32, stderr: String },

    /// The probe output could not be understood.
    #[error("unexpected detection output: {0}")]
    Parse(String),

    /// The host reports an architecture no agent is built for.
    #[error("unrecognised architecture {0:?}")]
    UnknownArch(String),
}

/// Result of inspecting a host. Lives for one bootstrap attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningStatus {
    pub already_provisioned: bool,
    pub detected_series: Option<String>,
    pub detected_hardware: Option<HardwareCharacteristics>,
}

fn provisioned_script(data_dir: &Path) -> String {
    let agent_conf = data_dir.join("agents").join(MACHINE_TAG).join("agent.conf");
    format!(
        "ls /etc/systemd/system/ 2>/dev/null | grep '^{prefix}.*\\.service$' || true\n\
         ls /etc/init/ 2>/dev/null | grep '^{prefix}.*\\.conf$' || true\n\
         if [ -f {conf} ]; then echo {conf}; fi\n",
        prefix = AGENT_SERVICE_PREFIX,
        conf = quote(&agent_conf.to_string_lossy()),
    )
}

const DETECTION_SCRIPT: &str = "\
lsb_release -cs 2>/dev/null || (. /etc/os-release && echo \"$VERSION_CODENAME\")
uname -m
grep MemTotal /proc/meminfo
grep -c '^processor' /proc/cpuinfo
";

fn check_exit(output: RemoteOutput) -> Result<RemoteOutput, DetectError> {
    if output.success() {
        Ok(output)
    } else {
        Err(DetectError::ProbeFailed {
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Report whether the host already runs (or has installed) a cluster agent.
///
/// # Errors
/// Returns an error if the probe cannot run or exits non-zero.
pub async fn check_provisioned(
    executor: &dyn RemoteExecutor,
    host: &str,
    data_dir: &Path,
    ctx: &BootstrapContext,
) -> Result<bool, DetectError> {
    info!(host = %host, "Checking for existing agent");
    let script = provisioned_script(data_dir);
    let output = check_exit(ctx.run(executor.run(host, &script)).await?)?;
    let found: Vec<&str> = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if !found.is_empty() {
        debug!(host = %host, ?found, "Agent artifacts present");
    }
    Ok(!found.is_empty())
}

/// Detect the host's OS series and hardware characteristics.
///
/// # Errors
/// Returns an error if the probe fails or its output cannot be parsed.
pub async fn detect_series_and_hardware(
    executor: &dyn RemoteExecutor,
    host: &str,
    ctx: &BootstrapContext,
) -> Result<(String, HardwareCharacteristics), DetectError> {
    info!(host = %host, "Detecting series and hardware characteristics");
    let output = check_exit(ctx.run(executor.run(host, DETECTION_SCRIPT)).await?)?;
    let (series, hw) = parse_detection_output(&output.stdout)?;
    info!(host = %host, series = %series, hardware = %hw, "Detected host");
    Ok((series, hw))
}

/// Parse the four lines printed by the detection script.
///
/// # Errors
/// Returns an error on missing lines, bad numbers or an unknown arch.
pub fn parse_detection_output(stdout: &str) -> Result<(String, HardwareCharacteristics), DetectError> {
    let lines: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let [series, machine, meminfo, cores] = lines.as_slice() else {
        return Err(DetectError::Parse(format!(
            "expected 4 lines, got {}",
            lines.len()
        )));
    };

    let arch = normalise_arch(machine).ok_or_else(|| DetectError::UnknownArch((*machine).to_string()))?;

    // "MemTotal:        2048000 kB"
    let mem_kb: u64 = meminfo
        .strip_prefix("MemTotal:")
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| DetectError::Parse(format!("bad meminfo line {meminfo:?}")))?;

    let cpu_cores: u64 = cores
        .parse()
        .map_err(|_| DetectError::Parse(format!("bad processor count {cores:?}")))?;

    Ok((
        (*series).to_string(),
        HardwareCharacteristics {
            arch: Some(arch.to_string()),
            mem: Some(mem_kb / 1024),
            cpu_cores: Some(cpu_cores),
            root_disk: None,
        },
    ))
}

/// Inspect the host: provisioned check first, then series/hardware when
/// the caller did not supply both.
///
/// # Errors
/// Returns an error if any probe fails.
pub async fn detect(
    executor: &dyn RemoteExecutor,
    host: &str,
    data_dir: &Path,
    need_hardware: bool,
    ctx: &BootstrapContext,
) -> Result<ProvisioningStatus, DetectError> {
    if check_provisioned(executor, host, data_dir, ctx).await? {
        return Ok(ProvisioningStatus {
            already_provisioned: true,
            ..ProvisioningStatus::default()
        });
    }
    if !need_hardware {
        return Ok(ProvisioningStatus::default());
    }
    let (series, hw) = detect_series_and_hardware(executor, host, ctx).await?;
    Ok(ProvisioningStatus {
        already_provisioned: false,
        detected_series: Some(series),
        detected_hardware: Some(hw),
    })
}
