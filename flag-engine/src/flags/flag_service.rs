use std::collections::HashMap;

use serde_json::Value;
use tracing::error;

use crate::config::Config;
use crate::flags::flag_cache::FlagDefinitionCache;
use crate::flags::flag_matching::{FeatureFlagMatcher, FlagsResponse};
use crate::flags::hash_key_overrides::{
    get_hash_key_overrides, set_hash_key_overrides, should_write_hash_key_override,
};
use crate::metrics_consts::FLAG_EVALUATION_ERROR_COUNTER;
use crate::store::{
    CohortStoreRef, FlagRepositoryRef, GroupTypeMappingProviderRef, OverrideStoreRef,
    PayloadDecrypterRef, PersonStoreRef, ProjectId, TeamId,
};

/// Top-level evaluation service: fetches cached definitions, manages
/// experience-continuity overrides, and delegates to the batch matcher.
///
/// Constructed once at process start and shared by the request layer; all
/// per-call state lives in the matcher it creates for each evaluation.
pub struct FeatureFlagService {
    config: Config,
    flag_cache: FlagDefinitionCache,
    person_store: PersonStoreRef,
    cohort_store: CohortStoreRef,
    group_type_mapping: GroupTypeMappingProviderRef,
    override_store: OverrideStoreRef,
    payload_decrypter: Option<PayloadDecrypterRef>,
}

impl FeatureFlagService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        flag_repository: FlagRepositoryRef,
        person_store: PersonStoreRef,
        cohort_store: CohortStoreRef,
        group_type_mapping: GroupTypeMappingProviderRef,
        override_store: OverrideStoreRef,
        payload_decrypter: Option<PayloadDecrypterRef>,
    ) -> Self {
        let flag_cache = FlagDefinitionCache::new(
            flag_repository,
            config.flag_definition_cache_ttl(),
            config.flag_definition_cache_capacity,
        );
        FeatureFlagService {
            config,
            flag_cache,
            person_store,
            cohort_store,
            group_type_mapping,
            override_store,
            payload_decrypter,
        }
    }

    /// Invalidate the cached definitions for a project; called whenever a
    /// flag is created, updated or deleted externally.
    pub async fn invalidate_flag_definitions(&self, project_id: ProjectId) {
        self.flag_cache.invalidate(project_id).await;
    }

    /// Evaluates all of a project's active flags for one subject.
    ///
    /// Continuity flags route through the override store first; when that
    /// store is unavailable the call degrades to best-effort results for the
    /// flags that don't need it, with `errors_while_computing_flags` set.
    #[allow(clippy::too_many_arguments)]
    pub async fn get_all_flags(
        &self,
        team_id: TeamId,
        project_id: ProjectId,
        distinct_id: String,
        groups: Option<HashMap<String, Value>>,
        hash_key_override: Option<String>,
        person_property_overrides: Option<HashMap<String, Value>>,
        group_property_overrides: Option<HashMap<String, HashMap<String, Value>>>,
    ) -> FlagsResponse {
        let feature_flags = match self.flag_cache.get_active_flags(project_id).await {
            Ok(flags) => flags,
            Err(e) => {
                error!(
                    project_id = project_id,
                    error = %e,
                    "Failed to fetch flag definitions"
                );
                metrics::counter!(FLAG_EVALUATION_ERROR_COUNTER, "reason" => e.error_code())
                    .increment(1);
                return FlagsResponse {
                    errors_while_computing_flags: true,
                    ..Default::default()
                };
            }
        };

        let mut matcher = FeatureFlagMatcher::new(
            distinct_id.clone(),
            team_id,
            project_id,
            self.person_store.clone(),
            self.cohort_store.clone(),
            self.group_type_mapping.clone(),
            groups,
            self.payload_decrypter.clone(),
        );

        let needs_continuity = feature_flags
            .flags
            .iter()
            .any(|flag| flag.active && !flag.deleted && flag.ensure_experience_continuity);

        // Fast path: no continuity flags means no override queries at all.
        if !needs_continuity {
            return matcher
                .evaluate_all_feature_flags(
                    &feature_flags,
                    person_property_overrides,
                    group_property_overrides,
                    None,
                    false,
                )
                .await;
        }

        let (hash_key_overrides, override_error) = self
            .process_hash_key_override(team_id, project_id, &distinct_id, hash_key_override)
            .await;

        let mut response = matcher
            .evaluate_all_feature_flags(
                &feature_flags,
                person_property_overrides,
                group_property_overrides,
                hash_key_overrides,
                override_error,
            )
            .await;
        response.errors_while_computing_flags |= override_error;
        response
    }

    /// Resolves the hash-key overrides to evaluate with. Writes new overrides
    /// only after a read-only probe confirms some continuity flag lacks one.
    /// Any failure degrades the call instead of aborting it.
    async fn process_hash_key_override(
        &self,
        team_id: TeamId,
        project_id: ProjectId,
        distinct_id: &str,
        hash_key_override: Option<String>,
    ) -> (Option<HashMap<String, String>>, bool) {
        let target_distinct_ids = match &hash_key_override {
            Some(hash_key) => vec![distinct_id.to_string(), hash_key.clone()],
            // Without a requested override there is nothing to write; still
            // read any overrides set by earlier calls.
            None => vec![distinct_id.to_string()],
        };

        if let Some(hash_key) = &hash_key_override {
            let should_write = match should_write_hash_key_override(
                &self.override_store,
                team_id,
                project_id,
                &target_distinct_ids,
            )
            .await
            {
                Ok(should_write) => should_write,
                Err(e) => {
                    error!(
                        team_id = team_id,
                        distinct_id = distinct_id,
                        error = %e,
                        "Failed to check whether hash key overrides need writing"
                    );
                    metrics::counter!(
                        FLAG_EVALUATION_ERROR_COUNTER,
                        "reason" => "hash_key_override_error"
                    )
                    .increment(1);
                    return (None, true);
                }
            };

            if should_write {
                if let Err(e) = set_hash_key_overrides(
                    &self.override_store,
                    team_id,
                    project_id,
                    &target_distinct_ids,
                    hash_key,
                    self.config.override_write_retries,
                    self.config.override_write_retry_delay(),
                )
                .await
                {
                    error!(
                        team_id = team_id,
                        distinct_id = distinct_id,
                        hash_key = hash_key,
                        error = %e,
                        "Failed to write hash key overrides"
                    );
                    metrics::counter!(
                        FLAG_EVALUATION_ERROR_COUNTER,
                        "reason" => "hash_key_override_error"
                    )
                    .increment(1);
                    return (None, true);
                }
            }
        }

        match get_hash_key_overrides(&self.override_store, team_id, &target_distinct_ids).await {
            Ok(overrides) => (Some(overrides), false),
            Err(e) => {
                error!(
                    team_id = team_id,
                    distinct_id = distinct_id,
                    error = %e,
                    "Failed to read hash key overrides"
                );
                metrics::counter!(
                    FLAG_EVALUATION_ERROR_COUNTER,
                    "reason" => "hash_key_override_error"
                )
                .increment(1);
                (None, true)
            }
        }
    }
}
