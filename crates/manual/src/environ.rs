//! Target environment.

use std::sync::Arc;

use crate::state::StateStorage;

/// The environment a machine is bootstrapped into.
pub trait Environ: Send + Sync {
    /// Environment name, used in logs and agent config.
    fn name(&self) -> &str;

    /// Durable storage holding the bootstrap state record.
    fn storage(&self) -> &dyn StateStorage;
}

/// An environment whose storage is supplied by the caller.
#[derive(Clone)]
pub struct ManualEnviron {
    name: String,
    storage: Arc<dyn StateStorage>,
}

impl ManualEnviron {
    #[must_use]
    pub fn new(name: impl Into<String>, storage: Arc<dyn StateStorage>) -> Self {
        Self {
            name: name.into(),
            storage,
        }
    }
}

impl std::fmt::Debug for ManualEnviron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualEnviron")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Environ for ManualEnviron {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage(&self) -> &dyn StateStorage {
        self.storage.as_ref()
    }
}
