// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Enumerates currently-offered instances on disk and, optionally, installs
//! filesystem watches so the discovery client can react to future changes.

use std::collections::HashMap;
use std::path::Path;
use std::thread;
use std::time::Duration;

use inotify::{Inotify, WatchDescriptor, WatchMask};

use crate::error::CoreError;
use crate::flag_file::{self, FlagFile};
use crate::ids::{EnrichedInstanceIdentifier, QualityType};
use crate::known_instances::KnownInstancesContainer;

/// Back-off between `crawl_and_watch` retries in
/// [`crawl_and_watch_with_retry`].
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Default retry count for [`crawl_and_watch_with_retry`], chosen to
/// tolerate a benign race with a provider that is mid-offer.
pub const DEFAULT_CRAWL_RETRIES: u32 = 3;

/// Result of a [`crawl_and_watch`] call: the known instances discovered, and
/// any new watches installed. A specific-instance request installs a single
/// watch on that instance directory; an any-instance request installs a
/// service directory watch plus one watch per discovered instance directory.
pub struct CrawlAndWatchResult {
    pub known: KnownInstancesContainer,
    pub new_watches: HashMap<WatchDescriptor, EnrichedInstanceIdentifier>,
}

/// Enumerate instances matching `enriched` under `root` without installing
/// any watches.
///
/// # Errors
///
/// Returns [`CoreError::BindingFailure`] on unexpected I/O errors while
/// walking the filesystem; no partial state is returned to the caller on
/// failure.
pub fn crawl(root: &Path, enriched: EnrichedInstanceIdentifier) -> Result<KnownInstancesContainer, CoreError> {
    gather(root, enriched, None).map(|(known, _)| known)
}

/// As [`crawl`], but also installs watches on the resolved search path: the
/// single requested instance directory for a specific-instance request, or
/// the service directory plus one watch per discovered instance directory
/// for an any-instance request.
///
/// # Errors
///
/// Returns [`CoreError::BindingFailure`] if adding a watch or walking the
/// directory tree fails.
pub fn crawl_and_watch(
    inotify: &mut Inotify,
    root: &Path,
    enriched: EnrichedInstanceIdentifier,
) -> Result<CrawlAndWatchResult, CoreError> {
    let (known, new_watches) = gather(root, enriched, Some(inotify))?;
    Ok(CrawlAndWatchResult { known, new_watches })
}

/// Retry [`crawl_and_watch`] up to `retries` times with a fixed back-off on
/// any failure, tolerating benign races with a provider mid-offer.
///
/// # Errors
///
/// Returns the last observed error once `retries` attempts are exhausted.
pub fn crawl_and_watch_with_retry(
    inotify: &mut Inotify,
    root: &Path,
    enriched: EnrichedInstanceIdentifier,
    retries: u32,
) -> Result<CrawlAndWatchResult, CoreError> {
    let mut last_err = None;
    for attempt in 0..=retries {
        match crawl_and_watch(inotify, root, enriched) {
            Ok(result) => return Ok(result),
            Err(e) => {
                log::debug!("crawl_and_watch attempt {attempt} failed: {e}");
                last_err = Some(e);
                if attempt < retries {
                    thread::sleep(RETRY_BACKOFF);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| CoreError::BindingFailure("crawl_and_watch_with_retry: no attempts made".into())))
}

fn watch_mask() -> WatchMask {
    WatchMask::CREATE | WatchMask::DELETE
}

/// Create `path` (and any missing parents) then install a watch on it.
///
/// The search path itself may not exist yet (a find can race ahead of the
/// matching offer), so the directory is created here rather than assumed —
/// a watch can only ever be added to a path that already exists.
fn add_watch(inotify: &mut Inotify, path: &Path) -> Result<WatchDescriptor, CoreError> {
    std::fs::create_dir_all(path)
        .map_err(|e| CoreError::BindingFailure(format!("create_dir_all({}): {e}", path.display())))?;
    inotify.watches().add(path, watch_mask()).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            let mode = std::fs::metadata(path).ok().map(|m| {
                use std::os::unix::fs::PermissionsExt;
                m.permissions().mode() & 0o777
            });
            log::warn!("permission denied adding watch on {}: current mode {mode:?}", path.display());
        }
        CoreError::BindingFailure(format!("add_watch({}): {e}", path.display()))
    })
}

/// Shared implementation backing [`crawl`] and [`crawl_and_watch`].
///
/// Resolves the search path first: a specific-instance request watches only
/// that instance directory, an any-instance request watches the service
/// directory and walks its integer-named children, watching each in turn.
/// Every candidate instance directory is then probed for both quality tags.
fn gather(
    root: &Path,
    enriched: EnrichedInstanceIdentifier,
    mut inotify: Option<&mut Inotify>,
) -> Result<(KnownInstancesContainer, HashMap<WatchDescriptor, EnrichedInstanceIdentifier>), CoreError> {
    let service_dir = flag_file::service_dir(root, enriched.service_id);
    let mut new_watches = HashMap::new();
    let mut known = KnownInstancesContainer::default();

    // The resolved search path: the instance directory for a specific
    // instance request, the service directory for an any-instance request.
    if let Some(instance_id) = enriched.instance_id {
        let instance_dir = flag_file::instance_dir(root, enriched.service_id, instance_id);
        if let Some(inotify) = inotify.as_deref_mut() {
            let wd = add_watch(inotify, &instance_dir)?;
            new_watches.insert(wd, EnrichedInstanceIdentifier::new(enriched.service_id, Some(instance_id), QualityType::Invalid));
        }
        probe_instance(root, enriched.service_id, instance_id, &mut known);
        return Ok((known, new_watches));
    }

    if let Some(inotify) = inotify.as_deref_mut() {
        let wd = add_watch(inotify, &service_dir)?;
        new_watches.insert(wd, enriched.service_level());
    }

    let entries = match std::fs::read_dir(&service_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((known, new_watches)),
        Err(e) => return Err(CoreError::BindingFailure(format!("read_dir({}): {e}", service_dir.display()))),
    };

    for entry in entries {
        let entry = entry.map_err(|e| CoreError::BindingFailure(format!("walking {}: {e}", service_dir.display())))?;
        let file_type = entry
            .file_type()
            .map_err(|e| CoreError::BindingFailure(format!("stat {}: {e}", entry.path().display())))?;
        if !file_type.is_dir() {
            log::debug!("skipping non-directory entry in service directory: {}", entry.path().display());
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Ok(instance_id) = flag_file::parse_instance_id_from_str(&name) else {
            log::debug!("skipping non-instance-id directory: {name}");
            continue;
        };

        if let Some(inotify) = inotify.as_deref_mut() {
            if let Ok(wd) = add_watch(inotify, &entry.path()) {
                new_watches.insert(wd, EnrichedInstanceIdentifier::new(enriched.service_id, Some(instance_id), QualityType::Invalid));
            }
        }
        probe_instance(root, enriched.service_id, instance_id, &mut known);
    }

    Ok((known, new_watches))
}

fn probe_instance(
    root: &Path,
    service_id: crate::ids::ServiceId,
    instance_id: crate::ids::InstanceId,
    known: &mut KnownInstancesContainer,
) {
    for quality in [QualityType::AsilB, QualityType::AsilQm] {
        let id = EnrichedInstanceIdentifier::new(service_id, Some(instance_id), quality);
        if FlagFile::exists_any(root, id) {
            known.insert(service_id, instance_id, quality);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn crawl_finds_existing_offer_without_watches() {
        let dir = TempDir::new().unwrap();
        let id = EnrichedInstanceIdentifier::new(1, Some(2), QualityType::AsilB);
        let _flag = FlagFile::make(dir.path(), id, 0).expect("make");

        let any = EnrichedInstanceIdentifier::new(1, None, QualityType::AsilB);
        let known = crawl(dir.path(), any).expect("crawl");
        assert!(known.asil_b.contains(1, 2));
        assert!(known.asil_qm.contains(1, 2));
    }

    #[test]
    fn crawl_on_empty_root_returns_empty() {
        let dir = TempDir::new().unwrap();
        let any = EnrichedInstanceIdentifier::new(1, None, QualityType::AsilQm);
        let known = crawl(dir.path(), any).expect("crawl");
        assert!(known.asil_qm.is_empty());
    }

    #[test]
    fn crawl_skips_non_instance_id_directories() {
        let dir = TempDir::new().unwrap();
        let service_dir = flag_file::service_dir(dir.path(), 1);
        std::fs::create_dir_all(service_dir.join("not_a_number")).unwrap();
        let any = EnrichedInstanceIdentifier::new(1, None, QualityType::AsilQm);
        let known = crawl(dir.path(), any).expect("crawl");
        assert!(known.asil_qm.is_empty());
    }

    #[test]
    fn crawl_and_watch_installs_service_and_instance_watches() {
        let dir = TempDir::new().unwrap();
        let id = EnrichedInstanceIdentifier::new(1, Some(2), QualityType::AsilQm);
        let _flag = FlagFile::make(dir.path(), id, 0).expect("make");

        let mut inotify = Inotify::init().expect("inotify init");
        let any = EnrichedInstanceIdentifier::new(1, None, QualityType::AsilQm);
        let result = crawl_and_watch(&mut inotify, dir.path(), any).expect("crawl_and_watch");
        assert!(result.known.asil_qm.contains(1, 2));
        assert_eq!(result.new_watches.len(), 2);
    }

    #[test]
    fn crawl_and_watch_with_retry_succeeds_once_offer_appears() {
        let dir = TempDir::new().unwrap();
        let mut inotify = Inotify::init().expect("inotify init");
        let any = EnrichedInstanceIdentifier::new(1, None, QualityType::AsilB);
        let result = crawl_and_watch_with_retry(&mut inotify, dir.path(), any, 0).expect("crawl_and_watch_with_retry");
        assert!(result.known.asil_b.is_empty());
    }
}
