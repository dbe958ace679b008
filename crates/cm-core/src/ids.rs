// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Identifiers shared across the discovery, registry, and flag-file
//! subsystems.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a service *type* (e.g. "RadarFusionService").
pub type ServiceId = u32;

/// Identifies a concrete instance of a service type.
pub type InstanceId = u32;

/// Safety-integrity quality level a service instance is offered at.
///
/// A provider offering at `AsilB` also serves `AsilQm` consumers
/// (fall-through policy, see [`crate::discovery`]); a provider at
/// `AsilQm` serves only `AsilQm` consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QualityType {
    AsilQm,
    AsilB,
    /// Not a real offering quality; used for service-level (not
    /// instance-level) identifiers and as a sentinel for malformed input.
    Invalid,
}

impl QualityType {
    /// The filename tag used in a flag file's name.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            QualityType::AsilQm => "asil_qm",
            QualityType::AsilB => "asil_b",
            QualityType::Invalid => "invalid",
        }
    }

    /// Parse a quality tag from a flag file name, matching by substring as
    /// the original distinguishes quality by a leading token rather than
    /// requiring an exact file name.
    ///
    /// Unknown tags parse to [`QualityType::Invalid`] rather than an error;
    /// this is a normal, non-fatal outcome used by the crawler to skip
    /// unrecognized entries.
    #[must_use]
    pub fn parse_from_filename(name: &str) -> QualityType {
        if name.starts_with("asil_b") {
            QualityType::AsilB
        } else if name.starts_with("asil_qm") {
            QualityType::AsilQm
        } else {
            QualityType::Invalid
        }
    }
}

impl fmt::Display for QualityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// A fully-resolved description of a service instance (or service type,
/// for "find any instance" searches).
///
/// `instance_id = None` means "any instance of this service type".
/// `quality = QualityType::Invalid` is used for service-level identifiers
/// where quality has not yet been specialised (e.g. while walking a
/// service directory before a particular instance's quality is known).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnrichedInstanceIdentifier {
    pub service_id: ServiceId,
    pub instance_id: Option<InstanceId>,
    pub quality: QualityType,
}

impl EnrichedInstanceIdentifier {
    #[must_use]
    pub fn new(service_id: ServiceId, instance_id: Option<InstanceId>, quality: QualityType) -> Self {
        Self { service_id, instance_id, quality }
    }

    /// The service-level identifier derived from this one: quality set to
    /// `Invalid`, instance id preserved. Used by the crawler to resolve the
    /// directory to search before a specific quality tag is known.
    #[must_use]
    pub fn service_level(self) -> Self {
        Self { quality: QualityType::Invalid, ..self }
    }

    /// Whether this identifier matches "any instance" (no instance id
    /// specified).
    #[must_use]
    pub fn is_any_instance(self) -> bool {
        self.instance_id.is_none()
    }

    /// Whether `candidate` (a fully-resolved instance) satisfies a search
    /// for `self` — exact match, or any-instance match on service id
    /// (ignoring quality, since known-instance lookups are partitioned by
    /// quality container already).
    #[must_use]
    pub fn matches(self, candidate: EnrichedInstanceIdentifier) -> bool {
        self.service_id == candidate.service_id
            && match self.instance_id {
                Some(id) => Some(id) == candidate.instance_id,
                None => true,
            }
    }
}

/// Opaque handle identifying one in-progress `StartFindService` search.
///
/// Unique for the lifetime of the process; used only to cancel a search via
/// `StopFindService`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FindServiceHandle(u64);

impl FindServiceHandle {
    /// Source of handle values; starts at 1 so the value `0` can be used as
    /// a "no handle" sentinel by callers that want one.
    fn counter() -> &'static AtomicU64 {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        &COUNTER
    }

    /// Allocate a fresh, process-unique handle.
    #[must_use]
    pub fn next() -> Self {
        Self(Self::counter().fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FindServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FindServiceHandle({})", self.0)
    }
}

/// A value paired per quality level, mirroring how the registry and
/// discovery caches partition state between ASIL-B and ASIL-QM.
///
/// Invariant upheld by callers: whenever the `asil_b` side contains an
/// instance, the `asil_qm` side contains it too (fall-through policy).
#[derive(Debug, Clone, Default)]
pub struct QualityAware<T> {
    pub asil_b: T,
    pub asil_qm: T,
}

impl<T> QualityAware<T> {
    #[must_use]
    pub fn new(asil_b: T, asil_qm: T) -> Self {
        Self { asil_b, asil_qm }
    }

    /// Borrow the side matching `quality`.
    ///
    /// # Panics
    ///
    /// Panics if `quality` is [`QualityType::Invalid`] — callers must
    /// resolve a concrete quality before indexing a `QualityAware` pair.
    pub fn get(&self, quality: QualityType) -> &T {
        match quality {
            QualityType::AsilB => &self.asil_b,
            QualityType::AsilQm => &self.asil_qm,
            QualityType::Invalid => panic!("QualityAware indexed with QualityType::Invalid"),
        }
    }

    /// Mutably borrow the side matching `quality`.
    ///
    /// # Panics
    ///
    /// Panics if `quality` is [`QualityType::Invalid`].
    pub fn get_mut(&mut self, quality: QualityType) -> &mut T {
        match quality {
            QualityType::AsilB => &mut self.asil_b,
            QualityType::AsilQm => &mut self.asil_qm,
            QualityType::Invalid => panic!("QualityAware indexed with QualityType::Invalid"),
        }
    }
}

/// Parse a numeric instance id from a filename component (a child directory
/// name of a service directory).
///
/// Failure here is a normal, non-fatal outcome: a directory that is not an
/// instance id is simply not a candidate instance.
pub fn convert_from_string_to_instance_id(s: &str) -> Result<InstanceId, std::num::ParseIntError> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_tag_round_trips() {
        assert_eq!(QualityType::parse_from_filename("asil_b_7"), QualityType::AsilB);
        assert_eq!(QualityType::parse_from_filename("asil_qm_3"), QualityType::AsilQm);
        assert_eq!(QualityType::parse_from_filename("garbage_1"), QualityType::Invalid);
    }

    #[test]
    fn service_level_clears_quality_keeps_instance() {
        let id = EnrichedInstanceIdentifier::new(7, Some(3), QualityType::AsilB);
        let svc = id.service_level();
        assert_eq!(svc.quality, QualityType::Invalid);
        assert_eq!(svc.instance_id, Some(3));
    }

    #[test]
    fn any_instance_matches_every_instance_of_service() {
        let any = EnrichedInstanceIdentifier::new(7, None, QualityType::AsilQm);
        let concrete = EnrichedInstanceIdentifier::new(7, Some(1), QualityType::AsilQm);
        assert!(any.matches(concrete));
        let other_service = EnrichedInstanceIdentifier::new(8, Some(1), QualityType::AsilQm);
        assert!(!any.matches(other_service));
    }

    #[test]
    fn exact_match_requires_same_instance() {
        let want = EnrichedInstanceIdentifier::new(7, Some(1), QualityType::AsilQm);
        let got = EnrichedInstanceIdentifier::new(7, Some(2), QualityType::AsilQm);
        assert!(!want.matches(got));
    }

    #[test]
    fn handles_are_unique_and_increasing() {
        let a = FindServiceHandle::next();
        let b = FindServiceHandle::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    #[should_panic(expected = "Invalid")]
    fn quality_aware_get_panics_on_invalid() {
        let qa = QualityAware::new(1, 2);
        qa.get(QualityType::Invalid);
    }

    #[test]
    fn instance_id_parsing() {
        assert_eq!(convert_from_string_to_instance_id("42"), Ok(42));
        assert!(convert_from_string_to_instance_id("not_a_number").is_err());
    }
}
