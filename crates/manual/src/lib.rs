//! Manual machine bootstrap for CTO Platform.
//!
//! This crate turns an already-running host, reachable over SSH, into the
//! first controller node of an environment. The outcome is recorded in the
//! environment's storage so that repeated attempts are safe.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use manual::{BootstrapArgs, BootstrapContext, Bootstrapper, FileStorage, ManualEnviron, SshExecutor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = Arc::new(FileStorage::new("/home/ops/.cto/manual-storage"));
//!     let environ = Arc::new(ManualEnviron::new("prod", storage));
//!
//!     let args = BootstrapArgs {
//!         host: "ubuntu@node1".into(),
//!         data_dir: "/var/lib/cluster".into(),
//!         environ: Some(environ),
//!         possible_tools: manual::ToolsList::load("tools.yaml".as_ref())?,
//!         series: Some("bionic".into()),
//!         hardware: None,
//!         context: BootstrapContext::default(),
//!     };
//!
//!     match Bootstrapper::new(Arc::new(SshExecutor::new())).bootstrap(&args).await {
//!         Ok(state) => println!("bootstrapped {:?}", state.state_instances),
//!         Err(e) if e.is_provisioned() => println!("already bootstrapped"),
//!         Err(e) => return Err(e.into()),
//!     }
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bootstrap;
pub mod config;
pub mod context;
pub mod detect;
pub mod environ;
pub mod hardware;
pub mod remote;
pub mod script;
pub mod state;
pub mod tools;
pub mod validate;

pub use bootstrap::{BootstrapArgs, BootstrapError, BootstrapPhase, Bootstrapper};
pub use context::{BootstrapContext, ProgressSink, RecordingProgress, StderrProgress};
pub use detect::ProvisioningStatus;
pub use environ::{Environ, ManualEnviron};
pub use hardware::HardwareCharacteristics;
pub use remote::{RemoteError, RemoteExecutor, RemoteOutput, SshExecutor};
pub use script::BOOTSTRAP_INSTANCE_ID;
pub use state::{BootstrapState, FileStorage, InstanceId, MemoryStorage, StateStorage};
pub use tools::{Tool, ToolsList, Version};
pub use validate::ValidationError;
