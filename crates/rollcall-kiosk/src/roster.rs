//! Loading the enrolled roster into a descriptor index.

use crate::collaborators::{DescriptorExtractor, RosterSource};
use crate::error::CheckinError;
use chrono::{DateTime, Utc};
use rollcall_core::{Descriptor, DescriptorMatcher, EnrolledIdentity, RosterEntry};

/// Fetch the roster for `event_id` and build a matcher from it.
///
/// Entries without a stored descriptor are enrolled from their photo via the
/// extractor. Entries that still yield no descriptor are skipped with a
/// warning; only a failure to list the roster at all is an error.
pub async fn load_matcher(
    roster: &dyn RosterSource,
    extractor: &dyn DescriptorExtractor,
    event_id: &str,
    loaded_at: DateTime<Utc>,
) -> Result<DescriptorMatcher, CheckinError> {
    let entries = roster
        .list_enrollable_identities(event_id)
        .await
        .map_err(CheckinError::Roster)?;
    let total = entries.len();

    let mut identities = Vec::with_capacity(total);
    for entry in entries {
        let Some(descriptor) = resolve_descriptor(&entry, roster, extractor).await else {
            continue;
        };
        identities.push(EnrolledIdentity {
            id: entry.id,
            account_id: entry.account_id,
            display_name: entry.display_name,
            descriptor,
            enrolled_at: entry.enrolled_at.unwrap_or(loaded_at),
        });
    }

    let matcher = DescriptorMatcher::build(identities);
    tracing::info!(event = event_id, total, enrolled = matcher.len(), "roster loaded");
    Ok(matcher)
}

async fn resolve_descriptor(
    entry: &RosterEntry,
    roster: &dyn RosterSource,
    extractor: &dyn DescriptorExtractor,
) -> Option<Descriptor> {
    if let Some(values) = &entry.descriptor {
        return Some(Descriptor::new(values.clone()));
    }

    let Some(photo_ref) = &entry.photo_ref else {
        tracing::warn!(identity = %entry.id, "roster entry has neither descriptor nor photo");
        return None;
    };

    let image = match roster.fetch_photo(photo_ref).await {
        Ok(image) => image,
        Err(e) => {
            tracing::warn!(identity = %entry.id, error = %e, "enrollment photo unavailable");
            return None;
        }
    };

    match extractor.extract_descriptor(&image).await {
        Ok(Some(descriptor)) => Some(descriptor),
        Ok(None) => {
            tracing::warn!(identity = %entry.id, "no face found in enrollment photo");
            None
        }
        Err(e) => {
            tracing::warn!(identity = %entry.id, error = %e, "descriptor extraction failed");
            None
        }
    }
}
