// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Loads and validates the JSON service configuration the core treats as a
//! read-only external collaborator.
//!
//! Default paths follow a conventional layout: `./etc/mw_com_config.json` for
//! the service configuration, `./etc/mw_com_trace_filter.json` for the
//! tracing filter (consumed by applications, not by this crate).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use cm_core::{InstanceId, QualityType, ServiceId};
use serde::Deserialize;

/// Default path for the service configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "./etc/mw_com_config.json";

/// Default path for the tracing filter configuration, named here only
/// because the core's callers need to know where to look for it; this
/// crate never parses it.
pub const DEFAULT_TRACE_FILTER_PATH: &str = "./etc/mw_com_trace_filter.json";

#[derive(Debug, Deserialize)]
struct RawConfig {
    services: Vec<RawServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServiceConfig {
    service_id: ServiceId,
    instance_id: InstanceId,
    quality: RawQuality,
    events: Vec<RawBindingEntry>,
    fields: Vec<RawBindingEntry>,
    methods: Vec<RawBindingEntry>,
    allowed_uids_asil_b: Vec<u32>,
    allowed_uids_asil_qm: Vec<u32>,
    max_subscribers: u32,
    sample_slots: u32,
    #[serde(default)]
    shm_sizing_policy: RawShmSizingPolicy,
    #[serde(default)]
    tracing_enabled: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum RawQuality {
    AsilB,
    AsilQm,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
enum RawShmSizingPolicy {
    #[default]
    Simulation,
    Production,
}

#[derive(Debug, Deserialize, Clone)]
struct RawBindingEntry {
    id: u32,
    name: String,
}

/// Sizing policy for the shared-memory region backing a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmSizingPolicy {
    /// Small, fixed allocation suitable for local development and tests.
    Simulation,
    /// Sized from the configured sample slots and subscriber count.
    Production,
}

/// One named event, field, or method id within a service's binding.
#[derive(Debug, Clone)]
pub struct BindingEntry {
    pub id: u32,
    pub name: String,
}

/// Read-only, validated description of one configured service instance.
///
/// The core never mutates this after construction; it is handed a
/// `&InstanceConfig` at `OfferService`/`StartFindService` call sites.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub service_id: ServiceId,
    pub instance_id: InstanceId,
    pub quality: QualityType,
    pub events: Vec<BindingEntry>,
    pub fields: Vec<BindingEntry>,
    pub methods: Vec<BindingEntry>,
    pub allowed_uids_asil_b: HashSet<u32>,
    pub allowed_uids_asil_qm: HashSet<u32>,
    pub max_subscribers: u32,
    pub sample_slots: u32,
    pub shm_sizing_policy: ShmSizingPolicy,
    pub tracing_enabled: bool,
}

/// A fully loaded and validated set of service configurations.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    instances: Vec<InstanceConfig>,
}

impl ServiceConfig {
    #[must_use]
    pub fn instances(&self) -> &[InstanceConfig] {
        &self.instances
    }
}

/// Errors raised while loading or validating a service configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, #[source] source: serde_json::Error },
    #[error("duplicate service entry for (service_id={service_id}, instance_id={instance_id})")]
    DuplicateService { service_id: ServiceId, instance_id: InstanceId },
    #[error("duplicate event id {id} within service_id={service_id}")]
    DuplicateEventId { service_id: ServiceId, id: u32 },
    #[error("id collision between an event and a field/method: service_id={service_id}, id={id}")]
    IdCollision { service_id: ServiceId, id: u32 },
}

/// Load and validate the service configuration at `path`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`]/[`ConfigError::Parse`] on a malformed file,
/// or one of the duplicate/collision variants if validation fails.
pub fn load(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let raw: RawConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
    validate(raw)
}

/// As [`load`], but reading the default path (`./etc/mw_com_config.json`).
///
/// # Errors
///
/// See [`load`].
pub fn load_default() -> Result<ServiceConfig, ConfigError> {
    load(Path::new(DEFAULT_CONFIG_PATH))
}

fn validate(raw: RawConfig) -> Result<ServiceConfig, ConfigError> {
    let mut seen_instances = HashSet::new();
    let mut instances = Vec::with_capacity(raw.services.len());

    for svc in raw.services {
        if !seen_instances.insert((svc.service_id, svc.instance_id)) {
            return Err(ConfigError::DuplicateService { service_id: svc.service_id, instance_id: svc.instance_id });
        }

        let mut seen_event_ids = HashSet::new();
        for event in &svc.events {
            if !seen_event_ids.insert(event.id) {
                return Err(ConfigError::DuplicateEventId { service_id: svc.service_id, id: event.id });
            }
        }

        let mut seen_ids = seen_event_ids.clone();
        for entry in svc.fields.iter().chain(svc.methods.iter()) {
            if !seen_ids.insert(entry.id) {
                return Err(ConfigError::IdCollision { service_id: svc.service_id, id: entry.id });
            }
        }

        instances.push(InstanceConfig {
            service_id: svc.service_id,
            instance_id: svc.instance_id,
            quality: match svc.quality {
                RawQuality::AsilB => QualityType::AsilB,
                RawQuality::AsilQm => QualityType::AsilQm,
            },
            events: into_entries(svc.events),
            fields: into_entries(svc.fields),
            methods: into_entries(svc.methods),
            allowed_uids_asil_b: svc.allowed_uids_asil_b.into_iter().collect(),
            allowed_uids_asil_qm: svc.allowed_uids_asil_qm.into_iter().collect(),
            max_subscribers: svc.max_subscribers,
            sample_slots: svc.sample_slots,
            shm_sizing_policy: match svc.shm_sizing_policy {
                RawShmSizingPolicy::Simulation => ShmSizingPolicy::Simulation,
                RawShmSizingPolicy::Production => ShmSizingPolicy::Production,
            },
            tracing_enabled: svc.tracing_enabled,
        });
    }

    Ok(ServiceConfig { instances })
}

fn into_entries(raw: Vec<RawBindingEntry>) -> Vec<BindingEntry> {
    raw.into_iter().map(|e| BindingEntry { id: e.id, name: e.name }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_a_minimal_valid_config() {
        let file = write_config(
            r#"{
                "services": [{
                    "service_id": 1,
                    "instance_id": 2,
                    "quality": "asil_b",
                    "events": [{"id": 1, "name": "temperature"}],
                    "fields": [],
                    "methods": [],
                    "allowed_uids_asil_b": [1000],
                    "allowed_uids_asil_qm": [1000, 1001],
                    "max_subscribers": 8,
                    "sample_slots": 4
                }]
            }"#,
        );
        let config = load(file.path()).expect("load");
        assert_eq!(config.instances().len(), 1);
        assert_eq!(config.instances()[0].shm_sizing_policy, ShmSizingPolicy::Simulation);
    }

    #[test]
    fn rejects_duplicate_service_entries() {
        let file = write_config(
            r#"{
                "services": [
                    {"service_id": 1, "instance_id": 2, "quality": "asil_b", "events": [], "fields": [], "methods": [], "allowed_uids_asil_b": [], "allowed_uids_asil_qm": [], "max_subscribers": 1, "sample_slots": 1},
                    {"service_id": 1, "instance_id": 2, "quality": "asil_qm", "events": [], "fields": [], "methods": [], "allowed_uids_asil_b": [], "allowed_uids_asil_qm": [], "max_subscribers": 1, "sample_slots": 1}
                ]
            }"#,
        );
        assert!(matches!(load(file.path()), Err(ConfigError::DuplicateService { .. })));
    }

    #[test]
    fn rejects_duplicate_event_ids() {
        let file = write_config(
            r#"{
                "services": [{
                    "service_id": 1, "instance_id": 2, "quality": "asil_b",
                    "events": [{"id": 1, "name": "a"}, {"id": 1, "name": "b"}],
                    "fields": [], "methods": [],
                    "allowed_uids_asil_b": [], "allowed_uids_asil_qm": [],
                    "max_subscribers": 1, "sample_slots": 1
                }]
            }"#,
        );
        assert!(matches!(load(file.path()), Err(ConfigError::DuplicateEventId { .. })));
    }

    #[test]
    fn rejects_id_collision_between_event_and_field() {
        let file = write_config(
            r#"{
                "services": [{
                    "service_id": 1, "instance_id": 2, "quality": "asil_b",
                    "events": [{"id": 1, "name": "a"}],
                    "fields": [{"id": 1, "name": "b"}],
                    "methods": [],
                    "allowed_uids_asil_b": [], "allowed_uids_asil_qm": [],
                    "max_subscribers": 1, "sample_slots": 1
                }]
            }"#,
        );
        assert!(matches!(load(file.path()), Err(ConfigError::IdCollision { .. })));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(load(Path::new("/nonexistent/mw_com_config.json")), Err(ConfigError::Io { .. })));
    }
}
