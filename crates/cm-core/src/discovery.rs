// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single authoritative owner of the watcher, the search table, and the
//! known-instance caches.
//!
//! A dedicated worker thread blocks on the inotify descriptor and
//! serializes every mutation to the search/watch tables through one mutex
//! (`WorkerState`), so that user handlers always see a consistent view per
//! wake-up. Caller threads never touch the inotify instance directly except
//! while holding that same mutex, which is what lets a synchronous
//! `StartFindService` crawl and a concurrent worker wake-up agree on a
//! single ordering of events.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use inotify::{EventMask, Inotify, WatchDescriptor};

use crate::crawler::{self, DEFAULT_CRAWL_RETRIES};
use crate::error::{ComErrc, ComResult, CoreError};
use crate::flag_file::{DisambiguatorSource, FlagFile};
use crate::ids::{EnrichedInstanceIdentifier, FindServiceHandle, InstanceId, QualityType, ServiceId};
use crate::known_instances::KnownInstancesContainer;

/// How much of an offered instance's flag-file set a `StopOfferService`
/// call releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOfferSelector {
    /// Release every flag file the instance currently has (clean shutdown).
    Both,
    /// Release only the ASIL-QM flag file, leaving ASIL-B (if present)
    /// offered — the quality fall-through teardown scenario.
    AsilQm,
}

type Callback = Arc<dyn Fn(&HashSet<(ServiceId, InstanceId)>) + Send + Sync>;

struct SearchRequest {
    enriched: EnrichedInstanceIdentifier,
    callback: Callback,
    previously_reported: HashSet<(ServiceId, InstanceId)>,
    watches: HashSet<WatchDescriptor>,
}

/// Whether a directory watch covers an entire service directory (any
/// instance) or one specific instance directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchScope {
    ServiceDir,
    InstanceDir { instance_id: InstanceId },
}

struct WatchRecord {
    service_id: ServiceId,
    scope: WatchScope,
    path: PathBuf,
    searches: HashSet<FindServiceHandle>,
}

/// Every piece of mutable state the worker thread and caller threads share,
/// behind one mutex (the "worker mutex").
struct WorkerState {
    inotify: Inotify,
    searches: HashMap<FindServiceHandle, SearchRequest>,
    watches: HashMap<WatchDescriptor, WatchRecord>,
    /// Dedup index keyed by `(service_id, instance_id)` — quality plays no
    /// part in which directories get watched, so a search for the same
    /// service/instance at a different quality reuses the same watch set
    /// instead of installing a redundant (and, for `inotify`, silently
    /// coalesced) watch on the same path.
    identifier_index: HashMap<(ServiceId, Option<InstanceId>), HashSet<WatchDescriptor>>,
    obsolete: HashSet<FindServiceHandle>,
    known: KnownInstancesContainer,
}

/// Long-running worker owning the inotify watcher and the discovery tables.
pub struct ServiceDiscoveryClient {
    root: PathBuf,
    raw_fd: RawFd,
    state: Arc<Mutex<WorkerState>>,
    disambiguator: Mutex<DisambiguatorSource>,
    offered: Mutex<HashMap<(ServiceId, InstanceId), HashMap<QualityType, FlagFile>>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ServiceDiscoveryClient {
    /// Start a new client rooted at `root`, spawning its worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying inotify instance cannot be
    /// created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| CoreError::BindingFailure(format!("create root {}: {e}", root.display())))?;

        let inotify = Inotify::init().map_err(|e| CoreError::BindingFailure(format!("inotify init: {e}")))?;
        let raw_fd = inotify.as_raw_fd();
        let state = Arc::new(Mutex::new(WorkerState {
            inotify,
            searches: HashMap::new(),
            watches: HashMap::new(),
            identifier_index: HashMap::new(),
            obsolete: HashSet::new(),
            known: KnownInstancesContainer::default(),
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            let root = root.clone();
            thread::Builder::new()
                .name("cm-discovery-worker".into())
                .spawn(move || worker_loop(&state, raw_fd, &stop, &root))
                .map_err(|e| CoreError::BindingFailure(format!("spawn worker thread: {e}")))?
        };

        Ok(Self {
            root,
            raw_fd,
            state,
            disambiguator: Mutex::new(DisambiguatorSource::new()),
            offered: Mutex::new(HashMap::new()),
            stop,
            worker: Some(worker),
        })
    }

    /// Offer `(service_id, instance_id)` at `quality`. Offering at
    /// `QualityType::AsilB` implicitly also creates the ASIL-QM flag file
    /// (fall-through policy); offering at `QualityType::AsilQm` creates only
    /// that one.
    ///
    /// # Errors
    ///
    /// Returns [`ComErrc::BindingFailure`] if the instance is already
    /// offered at this quality or quality is `Invalid`, and
    /// [`ComErrc::ServiceNotOffered`] if flag-file creation otherwise fails.
    pub fn offer_service(&self, service_id: ServiceId, instance_id: InstanceId, quality: QualityType) -> ComResult<()> {
        if quality == QualityType::Invalid {
            return Err(ComErrc::BindingFailure);
        }
        let mut offered = self.offered.lock().unwrap();
        let slot = offered.entry((service_id, instance_id)).or_default();
        if slot.contains_key(&quality) {
            return Err(ComErrc::BindingFailure);
        }

        let mut disambiguator = self.disambiguator.lock().unwrap();
        let qualities: &[QualityType] = match quality {
            QualityType::AsilB => &[QualityType::AsilB, QualityType::AsilQm],
            QualityType::AsilQm => &[QualityType::AsilQm],
            QualityType::Invalid => unreachable!(),
        };
        for &q in qualities {
            if slot.contains_key(&q) {
                continue;
            }
            let id = EnrichedInstanceIdentifier::new(service_id, Some(instance_id), q);
            let flag = FlagFile::make(&self.root, id, disambiguator.next())
                .map_err(|e| {
                    log::warn!("offer_service: {e}");
                    ComErrc::ServiceNotOffered
                })?;
            slot.insert(q, flag);
        }
        Ok(())
    }

    /// Release flag files for `(service_id, instance_id)` per `selector`.
    ///
    /// # Errors
    ///
    /// Returns [`ComErrc::BindingFailure`] if the instance was never
    /// offered, or already fully stopped.
    pub fn stop_offer_service(&self, service_id: ServiceId, instance_id: InstanceId, selector: StopOfferSelector) -> ComResult<()> {
        let mut offered = self.offered.lock().unwrap();
        let Some(slot) = offered.get_mut(&(service_id, instance_id)) else {
            return Err(ComErrc::BindingFailure);
        };
        if slot.is_empty() {
            return Err(ComErrc::BindingFailure);
        }
        match selector {
            StopOfferSelector::Both => {
                slot.clear();
            }
            StopOfferSelector::AsilQm => {
                slot.remove(&QualityType::AsilQm);
            }
        }
        if slot.is_empty() {
            offered.remove(&(service_id, instance_id));
        }
        Ok(())
    }

    /// Register a search. If an identical search is already watched, its
    /// watches and cached handles are reused (no extra filesystem watches).
    /// If matching instances already exist, `callback` is invoked
    /// synchronously before this call returns.
    ///
    /// # Errors
    ///
    /// Returns [`ComErrc::BindingFailure`] if crawling the filesystem fails.
    pub fn start_find_service(
        &self,
        enriched: EnrichedInstanceIdentifier,
        callback: impl Fn(&HashSet<(ServiceId, InstanceId)>) + Send + Sync + 'static,
    ) -> ComResult<FindServiceHandle> {
        let handle = FindServiceHandle::next();
        let callback: Callback = Arc::new(callback);
        let mut state = self.state.lock().unwrap();
        let dedup_key = (enriched.service_id, enriched.instance_id);

        if let Some(existing) = state.identifier_index.get(&dedup_key).cloned() {
            for &wd in &existing {
                if let Some(record) = state.watches.get_mut(&wd) {
                    record.searches.insert(handle);
                }
            }
            let known = state.known.get_known_handles(enriched);
            if !known.is_empty() {
                callback(&known);
            }
            state.searches.insert(
                handle,
                SearchRequest { enriched, callback, previously_reported: known, watches: existing },
            );
            return Ok(handle);
        }

        let result = crawler::crawl_and_watch_with_retry(&mut state.inotify, &self.root, enriched, DEFAULT_CRAWL_RETRIES)
            .map_err(|e| {
                log::warn!("start_find_service: {e}");
                ComErrc::BindingFailure
            })?;

        let mut watch_ids = HashSet::new();
        for (wd, watched) in result.new_watches {
            let scope = match watched.instance_id {
                Some(instance_id) => WatchScope::InstanceDir { instance_id },
                None => WatchScope::ServiceDir,
            };
            let path = scoped_path(&self.root, watched, scope);
            state.watches.insert(wd.clone(), WatchRecord { service_id: watched.service_id, scope, path, searches: HashSet::from([handle]) });
            watch_ids.insert(wd);
        }
        state.identifier_index.insert(dedup_key, watch_ids.clone());

        state.known.asil_b.merge(&result.known.asil_b);
        state.known.asil_qm.merge(&result.known.asil_qm);
        let known = state.known.get_known_handles(enriched);
        if !known.is_empty() {
            callback(&known);
        }

        state.searches.insert(
            handle,
            SearchRequest { enriched, callback, previously_reported: known, watches: watch_ids },
        );
        Ok(handle)
    }

    /// Mark `handle` obsolete. Non-blocking: actual teardown happens at the
    /// next worker wake-up. Safe to call concurrently with the worker
    /// thread; no callback is delivered after this call returns.
    pub fn stop_find_service(&self, handle: FindServiceHandle) {
        let mut state = self.state.lock().unwrap();
        state.obsolete.insert(handle);
    }

    /// One-shot query: crawl without installing watches and return the
    /// currently-known handles.
    ///
    /// # Errors
    ///
    /// Returns [`ComErrc::BindingFailure`] for an invalid quality or a
    /// crawling I/O failure.
    pub fn find_service(&self, enriched: EnrichedInstanceIdentifier) -> ComResult<HashSet<(ServiceId, InstanceId)>> {
        let known = crawler::crawl(&self.root, enriched).map_err(|e| {
            log::warn!("find_service: {e}");
            ComErrc::BindingFailure
        })?;
        Ok(known.get_known_handles(enriched))
    }
}

fn scoped_path(root: &Path, watched: EnrichedInstanceIdentifier, scope: WatchScope) -> PathBuf {
    match scope {
        WatchScope::ServiceDir => crate::flag_file::service_dir(root, watched.service_id),
        WatchScope::InstanceDir { instance_id } => crate::flag_file::instance_dir(root, watched.service_id, instance_id),
    }
}

impl Drop for ServiceDiscoveryClient {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // SAFETY: raw_fd was obtained from the Inotify instance still owned
        // by `state` at construction time; closing it unblocks a pending
        // poll()/read in the worker thread. The Inotify value inside
        // `state` is dropped (and would double-close) only after this
        // process exits or the Mutex is dropped, neither of which re-closes
        // an already-closed fd via this path.
        unsafe {
            libc::close(self.raw_fd);
        }
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

const POLL_TIMEOUT_MS: i32 = 200;

fn poll_readable(fd: RawFd, timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    // SAFETY: pfd is a valid, single-element array on the stack; fd is a
    // valid inotify descriptor for the lifetime of this call.
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    ret > 0 && (pfd.revents & libc::POLLIN) != 0
}

fn worker_loop(state: &Arc<Mutex<WorkerState>>, raw_fd: RawFd, stop: &Arc<AtomicBool>, root: &Path) {
    let mut buffer = [0u8; 4096];
    while !stop.load(Ordering::SeqCst) {
        if !poll_readable(raw_fd, POLL_TIMEOUT_MS) {
            continue;
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let mut guard = state.lock().unwrap();

        transfer_obsolete(&mut guard);

        let events = match guard.inotify.read_events(&mut buffer) {
            Ok(events) => events.collect::<Vec<_>>(),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("discovery worker: inotify read failed: {e}");
                continue;
            }
        };

        let mut impacted: HashSet<FindServiceHandle> = HashSet::new();

        for event in events {
            if event.mask.contains(EventMask::Q_OVERFLOW) {
                panic!("inotify event queue overflowed; discovery cache is no longer trustworthy");
            }

            let Some(record) = guard.watches.get(&event.wd).map(|r| (r.service_id, r.scope, r.searches.clone())) else {
                continue;
            };
            let (service_id, scope, searches) = record;

            if event.mask.contains(EventMask::IGNORED) {
                if let WatchScope::InstanceDir { .. } = scope {
                    panic!("watched instance directory was removed unexpectedly: {service_id}");
                }
                continue;
            }

            let Some(name) = event.name.and_then(|n| n.to_str()) else {
                continue;
            };

            if event.mask.contains(EventMask::DELETE) {
                handle_deletion(&mut guard, scope, service_id, name, &searches, &mut impacted);
            } else if event.mask.contains(EventMask::CREATE) {
                handle_creation(&mut guard, scope, service_id, name, &searches, root, &mut impacted);
            }
        }

        dispatch(&mut guard, &impacted);
    }
}

fn transfer_obsolete(state: &mut WorkerState) {
    let obsolete: Vec<_> = state.obsolete.drain().collect();
    for handle in obsolete {
        let Some(search) = state.searches.remove(&handle) else {
            continue;
        };
        for wd in search.watches {
            let remove_watch = if let Some(record) = state.watches.get_mut(&wd) {
                record.searches.remove(&handle);
                record.searches.is_empty()
            } else {
                false
            };
            if remove_watch {
                if state.watches.remove(&wd).is_some() {
                    state.identifier_index.retain(|_, wds| {
                        wds.remove(&wd);
                        !wds.is_empty()
                    });
                    let _ = state.inotify.watches().remove(wd);
                }
            }
        }
    }
}

fn handle_deletion(
    state: &mut WorkerState,
    scope: WatchScope,
    service_id: ServiceId,
    name: &str,
    searches: &HashSet<FindServiceHandle>,
    impacted: &mut HashSet<FindServiceHandle>,
) {
    if let WatchScope::InstanceDir { instance_id } = scope {
        let quality = crate::flag_file::parse_quality_from_filename(name);
        if quality == QualityType::Invalid {
            log::debug!("ignoring delete of unrecognized flag file name: {name}");
            return;
        }
        state.known.remove(service_id, instance_id, quality);
        impacted.extend(searches.iter().copied());
    }
}

fn handle_creation(
    state: &mut WorkerState,
    scope: WatchScope,
    service_id: ServiceId,
    name: &str,
    searches: &HashSet<FindServiceHandle>,
    root: &Path,
    impacted: &mut HashSet<FindServiceHandle>,
) {
    match scope {
        WatchScope::ServiceDir => {
            let Ok(instance_id) = crate::flag_file::parse_instance_id_from_str(name) else {
                log::debug!("ignoring non-instance-id child of service directory: {name}");
                return;
            };
            let specialized = EnrichedInstanceIdentifier::new(service_id, Some(instance_id), QualityType::Invalid);
            match crawler::crawl_and_watch_with_retry(&mut state.inotify, root, specialized, DEFAULT_CRAWL_RETRIES) {
                Ok(result) => {
                    for (wd, _) in result.new_watches {
                        state.watches.insert(
                            wd.clone(),
                            WatchRecord {
                                service_id,
                                scope: WatchScope::InstanceDir { instance_id },
                                path: crate::flag_file::instance_dir(root, service_id, instance_id),
                                searches: searches.clone(),
                            },
                        );
                        // Any-instance subscribers dedup-indexed under
                        // (service_id, None) must see this instance's watch
                        // too, or a later `stop_find_service` would leave it
                        // dangling in no search's watch set.
                        if let Some(wds) = state.identifier_index.get_mut(&(service_id, None)) {
                            wds.insert(wd.clone());
                        }
                        for &h in searches {
                            if let Some(search) = state.searches.get_mut(&h) {
                                search.watches.insert(wd.clone());
                            }
                        }
                    }
                    state.known.asil_b.merge(&result.known.asil_b);
                    state.known.asil_qm.merge(&result.known.asil_qm);
                    impacted.extend(searches.iter().copied());
                }
                Err(e) => log::warn!("crawl_and_watch_with_retry for new instance {instance_id} failed: {e}"),
            }
        }
        WatchScope::InstanceDir { instance_id } => {
            let quality = crate::flag_file::parse_quality_from_filename(name);
            if quality == QualityType::Invalid {
                log::debug!("ignoring create of unrecognized flag file name: {name}");
                return;
            }
            state.known.insert(service_id, instance_id, quality);
            impacted.extend(searches.iter().copied());
        }
    }
}

fn dispatch(state: &mut WorkerState, impacted: &HashSet<FindServiceHandle>) {
    for &handle in impacted {
        let Some(search) = state.searches.get_mut(&handle) else {
            continue;
        };
        if state.obsolete.contains(&handle) {
            continue;
        }
        let current = state.known.get_known_handles(search.enriched);
        if current != search.previously_reported {
            search.previously_reported = current.clone();
            (search.callback)(&current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            thread::sleep(StdDuration::from_millis(25));
        }
        panic!("condition not met within timeout");
    }

    #[test]
    fn find_before_offer_invokes_handler_once() {
        let dir = TempDir::new().unwrap();
        let client = ServiceDiscoveryClient::new(dir.path()).expect("client");

        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(HashSet::new()));
        let calls_clone = Arc::clone(&calls);
        let last_clone = Arc::clone(&last);

        let any = EnrichedInstanceIdentifier::new(1, None, QualityType::AsilQm);
        let _handle = client
            .start_find_service(any, move |handles| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                *last_clone.lock().unwrap() = handles.clone();
            })
            .expect("start_find_service");

        client.offer_service(1, 2, QualityType::AsilQm).expect("offer");

        wait_for(|| calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(*last.lock().unwrap(), HashSet::from([(1, 2)]));
    }

    #[test]
    fn offer_before_find_invokes_synchronously() {
        let dir = TempDir::new().unwrap();
        let client = ServiceDiscoveryClient::new(dir.path()).expect("client");
        client.offer_service(1, 2, QualityType::AsilB).expect("offer");

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let any = EnrichedInstanceIdentifier::new(1, None, QualityType::AsilB);
        client.start_find_service(any, move |_| { calls_clone.fetch_add(1, Ordering::SeqCst); }).expect("start");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quality_fall_through_offer_visible_to_both() {
        let dir = TempDir::new().unwrap();
        let client = ServiceDiscoveryClient::new(dir.path()).expect("client");
        client.offer_service(1, 2, QualityType::AsilB).expect("offer");

        let qm = EnrichedInstanceIdentifier::new(1, None, QualityType::AsilQm);
        let b = EnrichedInstanceIdentifier::new(1, None, QualityType::AsilB);
        assert_eq!(client.find_service(qm).unwrap(), HashSet::from([(1, 2)]));
        assert_eq!(client.find_service(b).unwrap(), HashSet::from([(1, 2)]));
    }

    #[test]
    fn searches_at_different_quality_share_watches_and_both_see_new_instances() {
        let dir = TempDir::new().unwrap();
        let client = ServiceDiscoveryClient::new(dir.path()).expect("client");

        let qm_calls = Arc::new(AtomicUsize::new(0));
        let qm_calls_clone = Arc::clone(&qm_calls);
        let qm = EnrichedInstanceIdentifier::new(1, None, QualityType::AsilQm);
        client.start_find_service(qm, move |_| { qm_calls_clone.fetch_add(1, Ordering::SeqCst); }).expect("start qm");

        let b_calls = Arc::new(AtomicUsize::new(0));
        let b_calls_clone = Arc::clone(&b_calls);
        let b = EnrichedInstanceIdentifier::new(1, None, QualityType::AsilB);
        client.start_find_service(b, move |_| { b_calls_clone.fetch_add(1, Ordering::SeqCst); }).expect("start b");

        client.offer_service(1, 5, QualityType::AsilB).expect("offer");
        wait_for(|| qm_calls.load(Ordering::SeqCst) >= 1 && b_calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn offering_twice_at_same_quality_fails() {
        let dir = TempDir::new().unwrap();
        let client = ServiceDiscoveryClient::new(dir.path()).expect("client");
        client.offer_service(1, 2, QualityType::AsilQm).expect("offer");
        assert_eq!(client.offer_service(1, 2, QualityType::AsilQm), Err(ComErrc::BindingFailure));
    }

    #[test]
    fn stop_offer_never_offered_is_binding_failure() {
        let dir = TempDir::new().unwrap();
        let client = ServiceDiscoveryClient::new(dir.path()).expect("client");
        assert_eq!(
            client.stop_offer_service(9, 9, StopOfferSelector::Both),
            Err(ComErrc::BindingFailure)
        );
    }

    #[test]
    fn stop_find_service_is_non_blocking() {
        let dir = TempDir::new().unwrap();
        let client = ServiceDiscoveryClient::new(dir.path()).expect("client");
        let any = EnrichedInstanceIdentifier::new(1, None, QualityType::AsilQm);
        let handle = client.start_find_service(any, |_| {}).expect("start");
        client.stop_find_service(handle);
    }
}
