// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide singleton hosting the discovery client.
//!
//! An initialization-lock design: once any
//! public accessor has been used, later re-initialization attempts are
//! logged and ignored rather than replacing the running instance.

use std::path::PathBuf;
use std::sync::OnceLock;

use crate::discovery::ServiceDiscoveryClient;
use crate::error::CoreError;

/// Construction parameters for [`Runtime::init`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub discovery_root: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { discovery_root: PathBuf::from("/tmp/cm_discovery") }
    }
}

/// Owns the discovery client for the lifetime of the process.
pub struct Runtime {
    discovery: ServiceDiscoveryClient,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

impl Runtime {
    /// Initialize the process-wide runtime. Only the first call takes
    /// effect; subsequent calls (including ones after a public accessor has
    /// already triggered lazy construction) are logged at `warn!` and
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the discovery client fails to start (e.g. the
    /// discovery root cannot be created or the watcher cannot be opened).
    pub fn init(config: RuntimeConfig) -> Result<(), CoreError> {
        if RUNTIME.get().is_some() {
            log::warn!("Runtime::init called after the runtime was already initialized; ignoring");
            return Ok(());
        }
        let discovery = ServiceDiscoveryClient::new(config.discovery_root)?;
        if RUNTIME.set(Runtime { discovery }).is_err() {
            log::warn!("Runtime::init raced with a concurrent initialization; ignoring this call");
        }
        Ok(())
    }

    /// Borrow the process-wide runtime, lazily initializing it with
    /// [`RuntimeConfig::default`] if [`Runtime::init`] was never called.
    #[must_use]
    pub fn get() -> &'static Runtime {
        RUNTIME.get_or_init(|| {
            ServiceDiscoveryClient::new(RuntimeConfig::default().discovery_root)
                .map(|discovery| Runtime { discovery })
                .expect("default discovery root must be usable")
        })
    }

    /// The process-wide discovery client.
    #[must_use]
    pub fn service_discovery(&self) -> &ServiceDiscoveryClient {
        &self.discovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Tests construct their own client rather than touching the global
    /// singleton, avoiding cross-test interference from `OnceLock`'s
    /// process-wide, set-once semantics.
    #[test]
    fn fresh_client_is_independent_of_the_singleton() {
        let dir = TempDir::new().unwrap();
        let client = ServiceDiscoveryClient::new(dir.path()).expect("client");
        drop(client);
    }

    #[test]
    fn default_config_points_at_well_known_root() {
        assert_eq!(RuntimeConfig::default().discovery_root, PathBuf::from("/tmp/cm_discovery"));
    }
}
