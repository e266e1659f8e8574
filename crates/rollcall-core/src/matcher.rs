//! Nearest-neighbour lookup over the enrolled roster.
//!
//! The index is rebuilt whole at session start and whenever the roster
//! changes; it is never mutated in place.

use crate::qr::QrKey;
use crate::types::{Descriptor, EnrolledIdentity, IdentityMatch};
use std::collections::HashMap;

/// Distance at which calibrated confidence reaches zero.
pub const MAX_MATCH_DISTANCE: f32 = 1.0;

/// Map a Euclidean descriptor distance onto a confidence percentage.
///
/// Linear calibration: distance 0 is 100%, `MAX_MATCH_DISTANCE` and beyond is 0%.
pub fn confidence_for_distance(distance: f32) -> f32 {
    if !distance.is_finite() {
        return 0.0;
    }
    (100.0 * (1.0 - distance / MAX_MATCH_DISTANCE)).clamp(0.0, 100.0)
}

/// In-memory gallery of enrolled descriptors.
#[derive(Debug, Default, Clone)]
pub struct DescriptorMatcher {
    /// Ordered by enrollment time, then roster order.
    identities: Vec<EnrolledIdentity>,
    dim: usize,
    by_id: HashMap<String, usize>,
    by_account: HashMap<String, usize>,
}

impl DescriptorMatcher {
    /// Build an index from roster identities.
    ///
    /// Identities with an unsupported descriptor length, or one that differs
    /// from the first accepted descriptor, are skipped with a warning.
    pub fn build(mut identities: Vec<EnrolledIdentity>) -> Self {
        // Stable sort keeps roster order among identical timestamps.
        identities.sort_by_key(|identity| identity.enrolled_at);

        let mut accepted = Vec::with_capacity(identities.len());
        let mut dim = 0usize;

        for identity in identities {
            if !identity.descriptor.has_supported_dim() {
                tracing::warn!(
                    identity = %identity.id,
                    len = identity.descriptor.len(),
                    "skipping identity with unsupported descriptor length"
                );
                continue;
            }
            if dim == 0 {
                dim = identity.descriptor.len();
            } else if identity.descriptor.len() != dim {
                tracing::warn!(
                    identity = %identity.id,
                    len = identity.descriptor.len(),
                    expected = dim,
                    "skipping identity with mismatched descriptor length"
                );
                continue;
            }
            accepted.push(identity);
        }

        let mut by_id = HashMap::with_capacity(accepted.len());
        let mut by_account = HashMap::new();
        for (idx, identity) in accepted.iter().enumerate() {
            by_id.entry(identity.id.clone()).or_insert(idx);
            if let Some(account) = &identity.account_id {
                by_account.entry(account.clone()).or_insert(idx);
            }
        }

        tracing::debug!(count = accepted.len(), dim, "descriptor index built");

        Self {
            identities: accepted,
            dim,
            by_id,
            by_account,
        }
    }

    /// Find the closest enrolled identity whose calibrated confidence is at
    /// least `threshold_percent`.
    ///
    /// Every gallery entry is compared. On equal distance the identity
    /// enrolled first wins.
    pub fn find_match(&self, query: &Descriptor, threshold_percent: f32) -> Option<IdentityMatch> {
        if self.identities.is_empty() {
            return None;
        }
        if query.len() != self.dim {
            tracing::warn!(
                len = query.len(),
                expected = self.dim,
                "query descriptor length does not match index"
            );
            return None;
        }

        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, identity) in self.identities.iter().enumerate() {
            let distance = query.euclidean_distance(&identity.descriptor);
            // Strict comparison: an equal distance never displaces an earlier entry.
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        let idx = best_idx?;
        let confidence = confidence_for_distance(best_distance);
        if confidence < threshold_percent {
            tracing::trace!(confidence, threshold_percent, "best candidate below threshold");
            return None;
        }

        let identity = &self.identities[idx];
        Some(IdentityMatch {
            identity_id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            confidence,
        })
    }

    pub fn identity(&self, id: &str) -> Option<&EnrolledIdentity> {
        self.by_id.get(id).map(|&idx| &self.identities[idx])
    }

    pub fn identity_by_account(&self, account_id: &str) -> Option<&EnrolledIdentity> {
        self.by_account.get(account_id).map(|&idx| &self.identities[idx])
    }

    /// Resolve a scanned QR key to an enrolled identity.
    pub fn resolve(&self, key: &QrKey) -> Option<&EnrolledIdentity> {
        match key {
            QrKey::Participant(id) => self.identity(id),
            QrKey::Account(account) => self.identity_by_account(account),
        }
    }

    /// Display name for either a participant id or an account id.
    pub fn display_name(&self, id: &str) -> Option<&str> {
        self.identity(id)
            .or_else(|| self.identity_by_account(id))
            .map(|identity| identity.display_name.as_str())
    }

    /// Participant/account pairs for every identity linked to an account.
    pub fn account_links(&self) -> impl Iterator<Item = (&str, &str)> {
        self.identities.iter().filter_map(|identity| {
            identity
                .account_id
                .as_deref()
                .map(|account| (identity.id.as_str(), account))
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}
