//! Remote agent installation.
//!
//! Builds the bash script that lays out the data directory, fetches and
//! unpacks the agent tools, writes the agent configuration and installs the
//! agent as a systemd service, then runs it on the target host.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::context::BootstrapContext;
use crate::hardware::HardwareCharacteristics;
use crate::remote::{RemoteError, RemoteExecutor};
use crate::state::InstanceId;
use crate::tools::Tool;

/// Instance id recorded for a manually bootstrapped controller.
pub const BOOTSTRAP_INSTANCE_ID: &str = "manual:";

/// Tag of the controller machine agent.
pub const MACHINE_TAG: &str = "machine-0";

/// Prefix of every service unit the agent installs.
pub const AGENT_SERVICE_PREFIX: &str = "clusterd-";

/// Name of the agent binary inside the tools tarball.
pub const AGENT_BINARY: &str = "clusterd";

const HEREDOC_DELIMITER: &str = "CLUSTERD_EOF";

/// Lines of remote stderr kept in a [`ScriptError::Failed`].
const STDERR_TAIL_LINES: usize = 20;

/// Errors from building or running the install script.
#[derive(Error, Debug)]
pub enum ScriptError {
    /// The script ran and exited non-zero.
    #[error("bootstrap script exited with code {exit_code}: {stderr_tail}")]
    Failed { exit_code: i32, stderr_tail: String },

    /// The session failed while the script was streaming.
    #[error("bootstrap script did not complete: {0}")]
    Remote(#[from] RemoteError),

    /// A value cannot be embedded in the script.
    #[error("cannot embed {0} in bootstrap script")]
    InvalidValue(String),

    /// The agent configuration could not be encoded.
    #[error("failed to encode agent config: {0}")]
    Config(#[from] serde_yaml::Error),
}

/// Quote a value for safe interpolation into a bash script.
#[must_use]
pub fn quote(value: &str) -> String {
    let cleaned = value.replace('\0', "");
    shlex::try_quote(&cleaned).map_or_else(|_| String::from("''"), Cow::into_owned)
}

/// Everything the install script needs to know.
#[derive(Debug, Clone)]
pub struct ProvisionParams<'a> {
    pub data_dir: &'a Path,
    pub environ_name: &'a str,
    pub tool: &'a Tool,
    pub series: &'a str,
    pub hardware: &'a HardwareCharacteristics,
}

impl ProvisionParams<'_> {
    /// Directory the selected tools are unpacked into.
    #[must_use]
    pub fn tools_dir(&self) -> PathBuf {
        self.data_dir.join("tools").join(self.tool.binary_version())
    }

    /// Stable path to the tools the machine agent runs.
    #[must_use]
    pub fn agent_tools_link(&self) -> PathBuf {
        self.data_dir.join("tools").join(MACHINE_TAG)
    }

    #[must_use]
    pub fn agent_dir(&self) -> PathBuf {
        self.data_dir.join("agents").join(MACHINE_TAG)
    }

    #[must_use]
    pub fn service_name(&self) -> String {
        format!("{AGENT_SERVICE_PREFIX}{MACHINE_TAG}.service")
    }
}

/// Contents of `agent.conf` for the controller machine agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfig {
    pub tag: String,
    pub data_dir: String,
    pub environ: String,
    pub instance_id: InstanceId,
    pub series: String,
    pub hardware: HardwareCharacteristics,
    pub tools_version: String,
    pub tools_url: String,
    pub nonce: String,
    pub bootstrap: bool,
}

impl AgentConfig {
    #[must_use]
    pub fn for_bootstrap(params: &ProvisionParams<'_>) -> Self {
        Self {
            tag: MACHINE_TAG.to_string(),
            data_dir: params.data_dir.to_string_lossy().into_owned(),
            environ: params.environ_name.to_string(),
            instance_id: InstanceId::new(BOOTSTRAP_INSTANCE_ID),
            series: params.series.to_string(),
            hardware: params.hardware.clone(),
            tools_version: params.tool.binary_version(),
            tools_url: params.tool.url.clone(),
            nonce: uuid::Uuid::new_v4().to_string(),
            bootstrap: true,
        }
    }
}

fn heredoc(target: &Path, mode: &str, body: &str) -> Result<String, ScriptError> {
    if body.lines().any(|l| l.trim() == HEREDOC_DELIMITER) {
        return Err(ScriptError::InvalidValue(format!(
            "heredoc delimiter in {}",
            target.display()
        )));
    }
    let target = quote(&target.to_string_lossy());
    let mut out = format!("cat > {target} <<'{HEREDOC_DELIMITER}'\n{body}");
    if !body.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(HEREDOC_DELIMITER);
    out.push('\n');
    out.push_str(&format!("chmod {mode} {target}\n"));
    Ok(out)
}

fn systemd_unit(params: &ProvisionParams<'_>) -> Result<String, ScriptError> {
    let binary = params.agent_tools_link().join(AGENT_BINARY);
    let data_dir = params.data_dir.to_string_lossy();
    for value in [binary.to_string_lossy(), data_dir.clone()] {
        if value.contains(['"', '\n', '%']) {
            return Err(ScriptError::InvalidValue(format!("path {value:?} in unit file")));
        }
    }
    Ok(format!(
        "[Unit]\n\
         Description=Cluster agent for {MACHINE_TAG}\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart=\"{binary}\" machine --data-dir \"{data_dir}\" --machine-id 0\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         LimitNOFILE=65000\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        binary = binary.display(),
    ))
}

/// Build the full install script for the controller agent.
///
/// # Errors
/// Returns an error if a value cannot be safely embedded.
pub fn build_script(params: &ProvisionParams<'_>, config: &AgentConfig) -> Result<String, ScriptError> {
    let data_dir = quote(&params.data_dir.to_string_lossy());
    let tools_dir = params.tools_dir();
    let tarball = quote(&tools_dir.join("tools.tar.gz").to_string_lossy());
    let tools_dir_q = quote(&tools_dir.to_string_lossy());
    let agent_dir = params.agent_dir();
    let service = params.service_name();

    let mut script = String::from("set -e\numask 022\n");

    // (a) Data directory and tools.
    script.push_str(&format!("mkdir -p {data_dir}\n"));
    script.push_str(&format!("mkdir -p {tools_dir_q}\n"));
    script.push_str(&format!(
        "curl -sSfL --retry 5 -o {tarball} {}\n",
        quote(&params.tool.url)
    ));
    if let Some(sha) = &params.tool.sha256 {
        if !sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ScriptError::InvalidValue(format!("sha256 {sha:?}")));
        }
        script.push_str(&format!(
            "echo \"{sha}  $(basename {tarball})\" > {tools_dir_q}/tools.sha256\n\
             (cd {tools_dir_q} && sha256sum -c tools.sha256)\n"
        ));
    }
    script.push_str(&format!("tar zxf {tarball} -C {tools_dir_q}\n"));
    script.push_str(&format!("rm -f {tarball}\n"));
    script.push_str(&format!(
        "ln -sfn {tools_dir_q} {}\n",
        quote(&params.agent_tools_link().to_string_lossy())
    ));

    // (b) Agent configuration.
    script.push_str(&format!(
        "mkdir -p {}\n",
        quote(&agent_dir.to_string_lossy())
    ));
    let agent_conf = serde_yaml::to_string(config)?;
    script.push_str(&heredoc(&agent_dir.join("agent.conf"), "600", &agent_conf)?);

    // (c) Service.
    let unit_path = Path::new("/etc/systemd/system").join(&service);
    script.push_str(&heredoc(&unit_path, "644", &systemd_unit(params)?)?);
    script.push_str("systemctl daemon-reload\n");
    script.push_str(&format!("systemctl enable {service}\n"));
    script.push_str(&format!("systemctl restart {service}\n"));

    Ok(script)
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Install and start the controller agent on `host`.
///
/// Returns the instance ids that now make up the controller. A failure
/// leaves the host in an unknown, partially installed state.
///
/// # Errors
/// Returns [`ScriptError::Failed`] on a non-zero exit and
/// [`ScriptError::Remote`] if the session fails.
pub async fn provision_machine_agent(
    executor: &dyn RemoteExecutor,
    host: &str,
    params: &ProvisionParams<'_>,
    ctx: &BootstrapContext,
) -> Result<Vec<InstanceId>, ScriptError> {
    let config = AgentConfig::for_bootstrap(params);
    let script = build_script(params, &config)?;

    info!(
        host = %host,
        tools = %params.tool.binary_version(),
        data_dir = %params.data_dir.display(),
        "Installing machine agent"
    );
    ctx.progress(format!("Installing agent {} on {host}", params.tool.binary_version()));

    let output = ctx.run(executor.run(host, &script)).await?;
    for line in output.stderr.lines() {
        ctx.progress(line);
    }

    if !output.success() {
        error!(host = %host, exit_code = output.exit_code, "Bootstrap script failed");
        return Err(ScriptError::Failed {
            exit_code: output.exit_code,
            stderr_tail: stderr_tail(&output.stderr),
        });
    }

    info!(host = %host, "Machine agent installed");
    Ok(vec![config.instance_id])
}
