// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-free UID→PID registry backed by shared memory.
//!
//! A provider asks "what PID is registered for UID U" and, as consumers
//! register, detects whether a UID previously belonged to a different PID
//! (a crashed-and-restarted consumer) without any unregister step — see
//! the module-level design note on why unregistration is deliberately
//! absent.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::shm_segment::ShmSegment;

/// Default bound on acquire-pass retries. Always `>= 50` per the registry's
/// liveness contract; configurable via [`UidPidMapping::create_with_retries`].
pub const DEFAULT_MAX_RETRIES: u32 = 64;

// The key packs a 32-bit status tag and a 32-bit UID into one atomic word
// so status and UID always transition together under a single CAS.
const STATUS_SHIFT: u32 = 32;
const UID_MASK: u64 = 0xFFFF_FFFF;

const _: () = assert!(
    std::mem::size_of::<AtomicU64>() == 8,
    "platform AtomicU64 must be lock-free and 8 bytes wide for the shared-memory wire layout"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum MappingEntryStatus {
    Unused = 0,
    Used = 1,
    Updating = 2,
    Invalid = 3,
}

impl MappingEntryStatus {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => MappingEntryStatus::Unused,
            1 => MappingEntryStatus::Used,
            2 => MappingEntryStatus::Updating,
            _ => MappingEntryStatus::Invalid,
        }
    }
}

fn pack_key(status: MappingEntryStatus, uid: u32) -> u64 {
    ((status as u64) << STATUS_SHIFT) | u64::from(uid)
}

fn unpack_key(key: u64) -> (MappingEntryStatus, u32) {
    let status = MappingEntryStatus::from_u32((key >> STATUS_SHIFT) as u32);
    let uid = (key & UID_MASK) as u32;
    (status, uid)
}

/// One slot of the shared-memory table.
///
/// `pid` is only meaningfully read/written by the thread owning the entry
/// in `Used` state, or by the transitioning thread while `Updating`; the
/// `key` CAS alone governs ownership transitions.
#[repr(C)]
struct UidPidMappingEntry {
    key: AtomicU64,
    pid: AtomicU32,
    _padding: u32,
}

const _: () = assert!(std::mem::size_of::<UidPidMappingEntry>() == 16);
const _: () = assert!(std::mem::align_of::<UidPidMappingEntry>() == 8);

/// Shared-memory-backed table mapping consumer UID to current PID.
///
/// Transitions use compare-exchange on the packed `(status, uid)` key only;
/// `pid` writes are ordered relative to the `Used` publish via
/// acquire/release so a reader observing `Used` always sees the `pid`
/// written immediately before that publish.
pub struct UidPidMapping {
    _segment: ShmSegment,
    entries: *const UidPidMappingEntry,
    capacity: usize,
    max_retries: u32,
}

// SAFETY: entries points into shared memory shared across processes/threads;
// every access goes through atomics with acquire/release ordering as
// documented at each call site.
unsafe impl Send for UidPidMapping {}
unsafe impl Sync for UidPidMapping {}

impl UidPidMapping {
    /// Create a fresh table with `capacity` slots, all initially `Unused`,
    /// backed by a new shared memory segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing segment cannot be created.
    pub fn create(segment_name: &str, capacity: usize) -> Result<Self, crate::shm_segment::ShmError> {
        Self::create_with_retries(segment_name, capacity, DEFAULT_MAX_RETRIES)
    }

    /// As [`Self::create`], with an explicit acquire-pass retry bound.
    ///
    /// # Panics
    ///
    /// Panics if `max_retries < 50`, the floor required for the
    /// acquire-pass retry loop to make progress under contention.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing segment cannot be created.
    pub fn create_with_retries(
        segment_name: &str,
        capacity: usize,
        max_retries: u32,
    ) -> Result<Self, crate::shm_segment::ShmError> {
        assert!(max_retries >= 50, "max_retries must be at least 50, got {max_retries}");
        let size = capacity * std::mem::size_of::<UidPidMappingEntry>();
        let segment = ShmSegment::create(segment_name, size)?;
        // SAFETY: segment was just zero-initialized by create() and sized
        // to hold exactly `capacity` entries; all-zero bytes are a valid
        // UidPidMappingEntry (key = Unused/uid 0, pid = 0).
        let entries = segment.as_ptr().cast::<UidPidMappingEntry>();
        Ok(Self { _segment: segment, entries, capacity, max_retries })
    }

    /// Open an existing table backed by an already-created segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment does not exist or cannot be mapped.
    pub fn open(segment_name: &str, capacity: usize) -> Result<Self, crate::shm_segment::ShmError> {
        let size = capacity * std::mem::size_of::<UidPidMappingEntry>();
        let segment = ShmSegment::open(segment_name, size)?;
        let entries = segment.as_ptr().cast::<UidPidMappingEntry>();
        Ok(Self { _segment: segment, entries, capacity, max_retries: DEFAULT_MAX_RETRIES })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Count of entries currently in `Used` state. Diagnostics only; not
    /// part of the registration protocol.
    #[must_use]
    pub fn len_used(&self) -> usize {
        (0..self.capacity)
            .filter(|&i| {
                let (status, _) = unpack_key(self.entry(i).key.load(Ordering::Acquire));
                status == MappingEntryStatus::Used
            })
            .count()
    }

    fn entry(&self, index: usize) -> &UidPidMappingEntry {
        assert!(index < self.capacity);
        // SAFETY: index is bounds-checked above and entries points to
        // `capacity` contiguous, live UidPidMappingEntry values for the
        // lifetime of this table.
        unsafe { &*self.entries.add(index) }
    }

    /// Register `pid` for `uid`, returning the previously-registered PID if
    /// any, the newly-registered PID on first registration, or `None` if
    /// the table is full.
    ///
    /// Update pass first (overwrite an existing entry for this UID, in
    /// `Used` or recovering-from-crash `Updating` state); acquire pass
    /// second (claim a fresh `Unused` slot via bounded-retry CAS).
    #[must_use]
    pub fn register_pid(&self, uid: u32, pid: i32) -> Option<i32> {
        if let Some(previous) = self.try_update_existing(uid, pid) {
            return Some(previous);
        }
        self.acquire_unused(uid, pid)
    }

    fn try_update_existing(&self, uid: u32, pid: i32) -> Option<i32> {
        'slots: for i in 0..self.capacity {
            let entry = self.entry(i);
            let mut key = entry.key.load(Ordering::Acquire);
            loop {
                let (status, entry_uid) = unpack_key(key);
                if entry_uid != uid {
                    continue 'slots;
                }
                match status {
                    MappingEntryStatus::Used => {
                        let previous = entry.pid.swap(pid, Ordering::AcqRel);
                        return Some(previous);
                    }
                    MappingEntryStatus::Updating => {
                        // A prior writer crashed mid-transition; we own recovery.
                        entry.pid.store(pid, Ordering::Relaxed);
                        let desired = pack_key(MappingEntryStatus::Used, uid);
                        match entry.key.compare_exchange(key, desired, Ordering::AcqRel, Ordering::Acquire) {
                            Ok(_) => return Some(pid),
                            // Someone else already touched this slot; re-read and retry in place.
                            Err(observed) => key = observed,
                        }
                    }
                    MappingEntryStatus::Unused | MappingEntryStatus::Invalid => continue 'slots,
                }
            }
        }
        None
    }

    fn acquire_unused(&self, uid: u32, pid: i32) -> Option<i32> {
        let mut attempts = 0;
        while attempts < self.max_retries {
            for i in 0..self.capacity {
                let entry = self.entry(i);
                let observed = entry.key.load(Ordering::Acquire);
                let (status, observed_uid) = unpack_key(observed);
                if status != MappingEntryStatus::Unused {
                    continue;
                }
                let desired = pack_key(MappingEntryStatus::Updating, uid);
                if entry
                    .key
                    .compare_exchange(observed, desired, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    attempts += 1;
                    if attempts >= self.max_retries {
                        return None;
                    }
                    continue;
                }
                let _ = observed_uid;
                entry.pid.store(pid, Ordering::Relaxed);
                entry.key.store(pack_key(MappingEntryStatus::Used, uid), Ordering::Release);
                return Some(pid);
            }
            attempts += 1;
        }
        None
    }

    /// Read the PID currently registered for `uid`, if any.
    #[must_use]
    pub fn lookup(&self, uid: u32) -> Option<i32> {
        for i in 0..self.capacity {
            let entry = self.entry(i);
            let (status, entry_uid) = unpack_key(entry.key.load(Ordering::Acquire));
            if status == MappingEntryStatus::Used && entry_uid == uid {
                return Some(entry.pid.load(Ordering::Acquire));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn unique_name(label: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("/cm_registry_test_{label}_{ts}")
    }

    #[test]
    fn register_pid_fresh_uids_until_full() {
        let name = unique_name("fresh");
        let table = UidPidMapping::create(&name, 4).expect("create");
        for i in 0..4u32 {
            assert_eq!(table.register_pid(i, (100 + i) as i32), Some((100 + i) as i32));
        }
        assert_eq!(table.register_pid(99, 999), None);
        crate::shm_segment::ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn register_pid_same_uid_twice_returns_previous() {
        let name = unique_name("twice");
        let table = UidPidMapping::create(&name, 4).expect("create");
        assert_eq!(table.register_pid(7, 111), Some(111));
        assert_eq!(table.register_pid(7, 222), Some(111));
        assert_eq!(table.lookup(7), Some(222));
        crate::shm_segment::ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn updating_entry_is_recovered_on_next_register() {
        let name = unique_name("recover");
        let table = UidPidMapping::create(&name, 4).expect("create");
        let entry = table.entry(0);
        entry.key.store(pack_key(MappingEntryStatus::Updating, 42), Ordering::Release);
        entry.pid.store(777, Ordering::Relaxed);

        assert_eq!(table.register_pid(42, 888), Some(888));
        let (status, uid) = unpack_key(table.entry(0).key.load(Ordering::Acquire));
        assert_eq!(status, MappingEntryStatus::Used);
        assert_eq!(uid, 42);
        assert_eq!(table.lookup(42), Some(888));
        crate::shm_segment::ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn len_used_tracks_registrations() {
        let name = unique_name("lenused");
        let table = UidPidMapping::create(&name, 4).expect("create");
        assert_eq!(table.len_used(), 0);
        table.register_pid(1, 10);
        table.register_pid(2, 20);
        assert_eq!(table.len_used(), 2);
        crate::shm_segment::ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn concurrent_writers_all_observe_last_write() {
        let name = unique_name("concurrent");
        let table = Arc::new(UidPidMapping::create(&name, 100).expect("create"));

        let handles: Vec<_> = (0..3)
            .map(|writer| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..30u32 {
                        let uid = writer * 30 + i;
                        table.register_pid(uid, (uid + 1000) as i32);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for uid in 0..90u32 {
            assert_eq!(table.lookup(uid), Some((uid + 1000) as i32));
        }
        crate::shm_segment::ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn lookup_missing_uid_is_none() {
        let name = unique_name("missing");
        let table = UidPidMapping::create(&name, 4).expect("create");
        assert_eq!(table.lookup(123), None);
        crate::shm_segment::ShmSegment::unlink(&name).ok();
    }
}
