// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory cache of currently-offered instances, keyed by
//! `(service_id, instance_id)` and partitioned by quality level via
//! [`QualityAware`].

use std::collections::HashSet;

use crate::ids::{EnrichedInstanceIdentifier, InstanceId, QualityType, ServiceId};

/// A set of fully-resolved instance identifiers for one quality level.
#[derive(Debug, Clone, Default)]
pub struct KnownInstances {
    instances: HashSet<(ServiceId, InstanceId)>,
}

impl KnownInstances {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service_id: ServiceId, instance_id: InstanceId) -> bool {
        self.instances.insert((service_id, instance_id))
    }

    pub fn remove(&mut self, service_id: ServiceId, instance_id: InstanceId) -> bool {
        self.instances.remove(&(service_id, instance_id))
    }

    pub fn contains(&self, service_id: ServiceId, instance_id: InstanceId) -> bool {
        self.instances.contains(&(service_id, instance_id))
    }

    /// Merge `other` into `self` in place, as the crawler does when folding
    /// newly-discovered instances into the existing cache.
    pub fn merge(&mut self, other: &KnownInstances) {
        self.instances.extend(other.instances.iter().copied());
    }

    /// All handles matching `enriched` (exact instance, or every instance of
    /// the service for an any-instance request).
    #[must_use]
    pub fn get_known_handles(&self, enriched: EnrichedInstanceIdentifier) -> HashSet<(ServiceId, InstanceId)> {
        self.instances
            .iter()
            .copied()
            .filter(|&(service_id, instance_id)| {
                enriched.matches(EnrichedInstanceIdentifier::new(service_id, Some(instance_id), enriched.quality))
            })
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }
}

/// Per-quality-level known-instance caches, enforcing the fall-through
/// invariant that every ASIL-B instance also appears on the ASIL-QM side.
pub type KnownInstancesContainer = crate::ids::QualityAware<KnownInstances>;

impl KnownInstancesContainer {
    /// Record that `(service_id, instance_id)` is offered at `quality`.
    /// Inserting at `AsilB` also inserts into the `AsilQm` side, per the
    /// fall-through policy.
    ///
    /// # Panics
    ///
    /// Panics if `quality` is [`QualityType::Invalid`].
    pub fn insert(&mut self, service_id: ServiceId, instance_id: InstanceId, quality: QualityType) {
        match quality {
            QualityType::AsilB => {
                self.asil_b.insert(service_id, instance_id);
                self.asil_qm.insert(service_id, instance_id);
            }
            QualityType::AsilQm => {
                self.asil_qm.insert(service_id, instance_id);
            }
            QualityType::Invalid => panic!("cannot insert a known instance with QualityType::Invalid"),
        }
    }

    /// Remove `(service_id, instance_id)` from the side matching `quality`
    /// only. Removing the ASIL-QM flag while the ASIL-B flag survives keeps
    /// the instance visible to ASIL-B consumers (quality fall-through
    /// teardown scenario).
    ///
    /// # Panics
    ///
    /// Panics if `quality` is [`QualityType::Invalid`].
    pub fn remove(&mut self, service_id: ServiceId, instance_id: InstanceId, quality: QualityType) {
        self.get_mut(quality).remove(service_id, instance_id);
    }

    /// Handles across both quality sides matching `enriched`, restricted to
    /// the side(s) implied by `enriched.quality`. `QualityType::Invalid`
    /// means "service-level, not yet quality-specialised" and returns the
    /// union of both sides.
    #[must_use]
    pub fn get_known_handles(&self, enriched: EnrichedInstanceIdentifier) -> HashSet<(ServiceId, InstanceId)> {
        match enriched.quality {
            QualityType::Invalid => {
                let mut handles = self.asil_b.get_known_handles(enriched);
                handles.extend(self.asil_qm.get_known_handles(enriched));
                handles
            }
            _ => self.get(enriched.quality).get_known_handles(enriched),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_at_asil_b_falls_through_to_asil_qm() {
        let mut container = KnownInstancesContainer::default();
        container.insert(1, 2, QualityType::AsilB);
        assert!(container.asil_b.contains(1, 2));
        assert!(container.asil_qm.contains(1, 2));
    }

    #[test]
    fn insert_at_asil_qm_does_not_affect_asil_b() {
        let mut container = KnownInstancesContainer::default();
        container.insert(1, 2, QualityType::AsilQm);
        assert!(!container.asil_b.contains(1, 2));
        assert!(container.asil_qm.contains(1, 2));
    }

    #[test]
    fn remove_asil_qm_only_leaves_asil_b_untouched() {
        let mut container = KnownInstancesContainer::default();
        container.insert(1, 2, QualityType::AsilB);
        container.remove(1, 2, QualityType::AsilQm);
        assert!(container.asil_b.contains(1, 2));
        assert!(!container.asil_qm.contains(1, 2));
    }

    #[test]
    fn get_known_handles_matches_any_instance_request() {
        let mut container = KnownInstancesContainer::default();
        container.insert(1, 2, QualityType::AsilQm);
        container.insert(1, 3, QualityType::AsilQm);
        let any = EnrichedInstanceIdentifier::new(1, None, QualityType::AsilQm);
        let handles = container.get_known_handles(any);
        assert_eq!(handles.len(), 2);
    }

    #[test]
    fn merge_combines_two_sets() {
        let mut a = KnownInstances::new();
        a.insert(1, 1);
        let mut b = KnownInstances::new();
        b.insert(1, 2);
        a.merge(&b);
        assert_eq!(a.len(), 2);
    }
}
