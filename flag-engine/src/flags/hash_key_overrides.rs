use std::collections::HashMap;
use std::time::Duration;

use tracing::info;

use crate::error::{FlagError, OverrideWriteError};
use crate::metrics_consts::{FLAG_HASH_KEY_RETRIES_COUNTER, FLAG_HASH_KEY_WRITES_COUNTER};
use crate::store::{OverrideStoreRef, ProjectId, TeamId};

/// Writes hash-key overrides for every experience-continuity flag of the team
/// that doesn't already have one, for all persons behind the given distinct
/// ids.
///
/// The store performs this as one conflict-safe conditional insert, so
/// concurrent callers racing on the same person cannot error and the first
/// write wins. The only retried failure is a person deleted or merged away
/// mid-write; anything else propagates.
pub async fn set_hash_key_overrides(
    store: &OverrideStoreRef,
    team_id: TeamId,
    project_id: ProjectId,
    distinct_ids: &[String],
    hash_key_override: &str,
    retries: u32,
    retry_delay: Duration,
) -> Result<bool, FlagError> {
    let mut attempt = 0;
    loop {
        match store
            .insert_overrides(team_id, project_id, distinct_ids, hash_key_override)
            .await
        {
            Ok(rows_written) => {
                metrics::counter!(
                    FLAG_HASH_KEY_WRITES_COUNTER,
                    "successful_write" => (rows_written > 0).to_string()
                )
                .increment(1);
                return Ok(rows_written > 0);
            }
            Err(OverrideWriteError::PersonDeleted) if attempt < retries => {
                attempt += 1;
                metrics::counter!(
                    FLAG_HASH_KEY_RETRIES_COUNTER,
                    "operation" => "set_hash_key_overrides"
                )
                .increment(1);
                info!(
                    team_id = team_id,
                    attempt = attempt,
                    "Hash key override write raced a person deletion, retrying"
                );
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => return Err(FlagError::OverrideWrite(e)),
        }
    }
}

/// Existing overrides for any of the given distinct ids, keyed by flag key.
///
/// Invariant: when two distinct ids resolve to different persons with
/// conflicting overrides for the same flag, the override belonging to the
/// first listed distinct id wins. Callers list the current distinct id first.
pub async fn get_hash_key_overrides(
    store: &OverrideStoreRef,
    team_id: TeamId,
    distinct_ids: &[String],
) -> Result<HashMap<String, String>, FlagError> {
    let mut rows = store
        .overrides_for_distinct_ids(team_id, distinct_ids)
        .await?;

    // Rows for the first listed distinct id are applied last so they
    // overwrite any conflicting override from the other ids.
    if let Some(first_distinct_id) = distinct_ids.first() {
        rows.sort_by_key(|row| usize::from(&row.distinct_id == first_distinct_id));
    }

    let mut overrides = HashMap::new();
    for row in rows {
        overrides.insert(row.feature_flag_key, row.hash_key);
    }
    Ok(overrides)
}

/// Read-only probe: does any active continuity flag lack an override for the
/// persons behind these distinct ids? Keeps the write path off the hot path
/// until it's actually needed.
pub async fn should_write_hash_key_override(
    store: &OverrideStoreRef,
    team_id: TeamId,
    project_id: ProjectId,
    distinct_ids: &[String],
) -> Result<bool, FlagError> {
    let existing_flag_keys = store
        .existing_override_flag_keys(team_id, distinct_ids)
        .await?;
    let continuity_flag_keys = store.continuity_flag_keys(project_id).await?;

    Ok(continuity_flag_keys
        .iter()
        .any(|flag_key| !existing_flag_keys.contains(flag_key)))
}
