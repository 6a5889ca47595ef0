//! Shared test doubles for bootstrap integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use manual::state::{StateStorage, StorageError};
use manual::{
    BootstrapArgs, BootstrapContext, HardwareCharacteristics, ManualEnviron, RecordingProgress,
    RemoteError, RemoteExecutor, RemoteOutput, Tool, ToolsList,
};

/// What kind of script the orchestrator sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    ProvisionedCheck,
    Detection,
    Install,
}

fn classify(script: &str) -> ScriptKind {
    if script.starts_with("set -e") {
        ScriptKind::Install
    } else if script.contains("uname -m") {
        ScriptKind::Detection
    } else {
        ScriptKind::ProvisionedCheck
    }
}

type InstallHook = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Configurable stand-in for the SSH transport.
#[derive(Default)]
pub struct FakeExecutor {
    /// Report an installed agent from the provisioned check.
    pub provisioned: bool,
    /// Fail detection if it is attempted.
    pub skip_detection: bool,
    /// Output returned by the detection script.
    pub detection_output: String,
    /// Exit code of the install script.
    pub install_exit_code: i32,
    /// Refuse every connection.
    pub unreachable: bool,
    /// Runs while the install script "executes".
    pub on_install: Option<InstallHook>,
    calls: Mutex<Vec<(ScriptKind, String)>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            skip_detection: true,
            ..Self::default()
        }
    }

    pub fn provisioned(mut self) -> Self {
        self.provisioned = true;
        self
    }

    pub fn with_detection(mut self, output: &str) -> Self {
        self.skip_detection = false;
        self.detection_output = output.to_string();
        self
    }

    pub fn with_install_exit_code(mut self, code: i32) -> Self {
        self.install_exit_code = code;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn on_install<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_install = Some(Box::new(move || Box::pin(hook())));
        self
    }

    pub fn calls(&self) -> Vec<ScriptKind> {
        self.calls.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }

    pub fn install_script(&self) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| *k == ScriptKind::Install)
            .map(|(_, s)| s.clone())
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run(&self, host: &str, script: &str) -> Result<RemoteOutput, RemoteError> {
        let kind = classify(script);
        self.calls.lock().unwrap().push((kind, script.to_string()));

        if self.unreachable {
            return Err(RemoteError::Connect {
                host: host.to_string(),
                message: "ssh: connect to host port 22: Connection refused".into(),
            });
        }

        match kind {
            ScriptKind::ProvisionedCheck => Ok(RemoteOutput {
                stdout: if self.provisioned {
                    "clusterd-machine-0.service\n".into()
                } else {
                    String::new()
                },
                ..RemoteOutput::default()
            }),
            ScriptKind::Detection => {
                assert!(!self.skip_detection, "detection was not expected");
                Ok(RemoteOutput {
                    stdout: self.detection_output.clone(),
                    ..RemoteOutput::default()
                })
            }
            ScriptKind::Install => {
                if let Some(hook) = &self.on_install {
                    hook().await;
                }
                Ok(RemoteOutput {
                    exit_code: self.install_exit_code,
                    stdout: String::new(),
                    stderr: if self.install_exit_code == 0 {
                        String::new()
                    } else {
                        "curl: (22) The requested URL returned error: 404\n".into()
                    },
                })
            }
        }
    }
}

/// Storage wrapper that counts writes and can be told to fail them.
pub struct CountingStorage<S> {
    pub inner: S,
    pub fail_put: bool,
    pub fail_remove: bool,
    puts: Mutex<usize>,
    removes: Mutex<usize>,
}

impl<S> CountingStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_put: false,
            fail_remove: false,
            puts: Mutex::new(0),
            removes: Mutex::new(0),
        }
    }

    pub fn failing_put(mut self) -> Self {
        self.fail_put = true;
        self
    }

    pub fn failing_remove(mut self) -> Self {
        self.fail_remove = true;
        self
    }

    pub fn puts(&self) -> usize {
        *self.puts.lock().unwrap()
    }

    pub fn removes(&self) -> usize {
        *self.removes.lock().unwrap()
    }
}

#[async_trait]
impl<S: StateStorage> StateStorage for CountingStorage<S> {
    async fn get(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.get(name).await
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        *self.puts.lock().unwrap() += 1;
        if self.fail_put {
            return Err(StorageError::Io {
                name: name.to_string(),
                source: std::io::Error::other("no space left"),
            });
        }
        self.inner.put(name, data).await
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        *self.removes.lock().unwrap() += 1;
        if self.fail_remove {
            return Err(StorageError::Io {
                name: name.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only storage"),
            });
        }
        self.inner.remove(name).await
    }
}

pub fn tool(version: &str, series: &str, arch: &str) -> Tool {
    Tool {
        version: version.parse().unwrap(),
        series: series.into(),
        arch: arch.into(),
        url: format!("https://tools.example.com/clusterd-{version}-{series}-{arch}.tgz"),
        sha256: None,
        size: None,
    }
}

/// Arguments for the `ubuntu@node1` bionic/amd64 scenario.
pub fn scenario_args(storage: Arc<dyn StateStorage>) -> (BootstrapArgs, Arc<RecordingProgress>) {
    let progress = Arc::new(RecordingProgress::default());
    let args = BootstrapArgs {
        host: "ubuntu@node1".into(),
        data_dir: Path::new("/var/lib/cluster").to_path_buf(),
        environ: Some(Arc::new(ManualEnviron::new("test", storage))),
        possible_tools: ToolsList::new(vec![tool("1.16.0", "bionic", "amd64")]),
        series: Some("bionic".into()),
        hardware: Some(HardwareCharacteristics::with_arch("amd64")),
        context: BootstrapContext::new(progress.clone()),
    };
    (args, progress)
}
