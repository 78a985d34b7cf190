use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::cohorts::cohort_expansion::expand_cohort_conditions;
use crate::cohorts::cohort_resolution::CohortResolver;
use crate::error::FlagError;
use crate::flags::flag_group_type_mapping::{GroupTypeIndex, GroupTypeMappingCache};
use crate::flags::flag_hashing::{calculate_hash, variant_lookup_table, variant_for_hash};
use crate::flags::flag_match_reason::FeatureFlagMatchReason;
use crate::flags::flag_matching_utils::{
    all_properties_match, build_property_expression, condition_key, is_set_expression,
    locally_computable_property_overrides, plan_condition, ConditionKind,
};
use crate::flags::flag_models::{FeatureFlag, FeatureFlagList, FlagPropertyGroup, FlagValue};
use crate::metrics_consts::{FLAG_CONDITION_STORE_READS_COUNTER, FLAG_EVALUATION_ERROR_COUNTER};
use crate::properties::property_models::PropertyFilter;
use crate::store::{
    CohortStoreRef, ConditionExpression, EntityTarget, GroupTypeMappingProviderRef,
    PayloadDecrypterRef, PersonStoreRef, ProjectId, TeamId,
};

#[derive(Debug)]
struct SuperConditionEvaluation {
    should_evaluate: bool,
    is_match: bool,
    reason: FeatureFlagMatchReason,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FeatureFlagMatch {
    pub matches: bool,
    pub variant: Option<String>,
    pub reason: FeatureFlagMatchReason,
    pub condition_index: Option<usize>,
    pub payload: Option<Value>,
}

impl FeatureFlagMatch {
    pub fn get_flag_value(&self) -> FlagValue {
        match (self.matches, &self.variant) {
            (true, Some(variant)) => FlagValue::String(variant.clone()),
            (true, None) => FlagValue::Boolean(true),
            (false, _) => FlagValue::Boolean(false),
        }
    }
}

/// Why a flag resolved the way it did; reported alongside the value for
/// observability, not required for correctness.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReason {
    pub reason: FeatureFlagMatchReason,
    pub condition_index: Option<usize>,
}

/// Result of evaluating a batch of flags for one subject. Flags whose
/// evaluation failed are omitted from all three maps and reflected in
/// `errors_while_computing_flags`.
#[derive(Debug, Default)]
pub struct FlagsResponse {
    pub values: HashMap<String, FlagValue>,
    pub reasons: HashMap<String, EvaluationReason>,
    pub payloads: HashMap<String, Value>,
    pub errors_while_computing_flags: bool,
}

/// Evaluation state accumulated while preparing a batch: results of the
/// batched store queries and any cohort-expanded condition lists. Scoped to a
/// single evaluation call.
#[derive(Default)]
pub struct FlagEvaluationState {
    /// Store-evaluated condition results, keyed by `condition_key`.
    condition_results: HashMap<String, bool>,
    /// Cohort-expanded condition lists, replacing `flag.get_conditions()`
    /// for the flags they cover.
    flag_conditions: HashMap<String, Vec<FlagPropertyGroup>>,
    /// The batched store query failed; later lookups short-circuit with
    /// `ConditionsUnavailable` instead of re-querying.
    conditions_unavailable: bool,
}

/// Per-flag failures discovered while planning the batch (cohort cycles,
/// malformed filters). The affected flags are skipped; their siblings are not.
#[derive(Default)]
struct PlanningOutcome {
    flag_errors: HashMap<String, FlagError>,
}

/// Evaluates feature flags for one subject (a distinct id plus optional
/// groups). Created per evaluation call; all store-derived state lives in
/// [`FlagEvaluationState`] and is never shared across calls.
pub struct FeatureFlagMatcher {
    pub distinct_id: String,
    pub team_id: TeamId,
    pub project_id: ProjectId,
    person_store: PersonStoreRef,
    cohort_store: CohortStoreRef,
    group_type_mapping: GroupTypeMappingProviderRef,
    group_type_mapping_cache: GroupTypeMappingCache,
    payload_decrypter: Option<PayloadDecrypterRef>,
    /// Group type name to the caller-supplied group key, e.g. "organization" → "acme".
    groups: HashMap<String, Value>,
    pub(crate) person_property_overrides: Option<HashMap<String, Value>>,
    pub(crate) group_property_overrides: Option<HashMap<String, HashMap<String, Value>>>,
    pub(crate) flag_evaluation_state: FlagEvaluationState,
}

impl FeatureFlagMatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        distinct_id: String,
        team_id: TeamId,
        project_id: ProjectId,
        person_store: PersonStoreRef,
        cohort_store: CohortStoreRef,
        group_type_mapping: GroupTypeMappingProviderRef,
        groups: Option<HashMap<String, Value>>,
        payload_decrypter: Option<PayloadDecrypterRef>,
    ) -> Self {
        FeatureFlagMatcher {
            distinct_id,
            team_id,
            project_id,
            person_store,
            cohort_store,
            group_type_mapping,
            group_type_mapping_cache: GroupTypeMappingCache::new(),
            payload_decrypter,
            groups: groups.unwrap_or_default(),
            person_property_overrides: None,
            group_property_overrides: None,
            flag_evaluation_state: FlagEvaluationState::default(),
        }
    }

    /// Evaluates every active flag in the list for this matcher's subject.
    ///
    /// Store-bound condition evaluation is batched up front into one query
    /// per entity target; individual flag failures are isolated and reported
    /// through `errors_while_computing_flags`. With `skip_database_flags`,
    /// flags that cannot be evaluated without the store (group-aggregated or
    /// experience-continuity flags) are skipped outright.
    pub async fn evaluate_all_feature_flags(
        &mut self,
        feature_flags: &FeatureFlagList,
        person_property_overrides: Option<HashMap<String, Value>>,
        group_property_overrides: Option<HashMap<String, HashMap<String, Value>>>,
        hash_key_overrides: Option<HashMap<String, String>>,
        skip_database_flags: bool,
    ) -> FlagsResponse {
        let mut response = FlagsResponse::default();
        self.person_property_overrides = person_property_overrides;
        self.group_property_overrides = group_property_overrides;

        let active_flags: Vec<&FeatureFlag> = feature_flags
            .flags
            .iter()
            .filter(|flag| flag.active && !flag.deleted)
            .collect();

        let mut flags_to_evaluate = Vec::with_capacity(active_flags.len());
        for flag in active_flags {
            if skip_database_flags && flag_requires_store(flag) {
                response.errors_while_computing_flags = true;
                continue;
            }
            flags_to_evaluate.push(flag);
        }

        let needs_group_mappings = flags_to_evaluate
            .iter()
            .any(|flag| flag.get_group_type_index().is_some());
        if needs_group_mappings {
            let provider = self.group_type_mapping.clone();
            if self
                .group_type_mapping_cache
                .init(&provider, self.project_id)
                .await
                .is_err()
            {
                // Remembered by the cache; group flags surface the error below.
                response.errors_while_computing_flags = true;
            }
        }

        let planning = self.prepare_flag_evaluation_state(&flags_to_evaluate).await;

        for flag in flags_to_evaluate {
            if let Some(e) = planning.flag_errors.get(&flag.key) {
                response.errors_while_computing_flags = true;
                metrics::counter!(FLAG_EVALUATION_ERROR_COUNTER, "reason" => e.error_code())
                    .increment(1);
                warn!(
                    flag = %flag.key,
                    distinct_id = %self.distinct_id,
                    error = %e,
                    "Skipping flag that failed condition planning"
                );
                continue;
            }

            match self.get_match(flag, hash_key_overrides.as_ref()) {
                Ok(flag_match) => {
                    response
                        .values
                        .insert(flag.key.clone(), flag_match.get_flag_value());
                    response.reasons.insert(
                        flag.key.clone(),
                        EvaluationReason {
                            reason: flag_match.reason.clone(),
                            condition_index: flag_match.condition_index,
                        },
                    );
                    if let Some(payload) = flag_match.payload {
                        response.payloads.insert(flag.key.clone(), payload);
                    }
                }
                Err(e) => {
                    response.errors_while_computing_flags = true;
                    metrics::counter!(FLAG_EVALUATION_ERROR_COUNTER, "reason" => e.error_code())
                        .increment(1);
                    error!(
                        flag = %flag.key,
                        distinct_id = %self.distinct_id,
                        error = %e,
                        "Error evaluating feature flag"
                    );
                }
            }
        }

        response
    }

    /// Determines whether a flag matches for this subject, which variant (if
    /// any) applies, and the payload to return.
    ///
    /// Evaluation order: missing aggregation identifier, super conditions,
    /// holdout conditions, then the ordered condition list with
    /// variant-override conditions first. When nothing matches, the highest
    /// priority reason seen (earliest condition index on ties) is reported.
    pub fn get_match(
        &self,
        flag: &FeatureFlag,
        hash_key_overrides: Option<&HashMap<String, String>>,
    ) -> Result<FeatureFlagMatch, FlagError> {
        if self.hashed_identifier(flag, hash_key_overrides)?.is_empty() {
            return Ok(FeatureFlagMatch {
                matches: false,
                variant: None,
                reason: FeatureFlagMatchReason::NoGroupType,
                condition_index: None,
                payload: None,
            });
        }

        let mut highest_match = FeatureFlagMatchReason::NoConditionMatch;
        let mut highest_index = None;

        if let Some(super_groups) = &flag.filters.super_groups {
            if !super_groups.is_empty() {
                let super_condition_evaluation =
                    self.is_super_condition_match(flag, hash_key_overrides)?;

                if super_condition_evaluation.should_evaluate {
                    let payload = if super_condition_evaluation.is_match {
                        self.get_matching_payload(None, flag)?
                    } else {
                        None
                    };
                    return Ok(FeatureFlagMatch {
                        matches: super_condition_evaluation.is_match,
                        variant: None,
                        reason: super_condition_evaluation.reason,
                        condition_index: Some(0),
                        payload,
                    });
                }
            }
        }

        // Holdouts come after super conditions. A flag should not carry both,
        // but nothing enforces that today.
        if let Some(holdout_groups) = &flag.filters.holdout_groups {
            if !holdout_groups.is_empty() {
                let (is_match, holdout_value, evaluation_reason) =
                    self.is_holdout_condition_match(flag)?;
                if is_match {
                    let payload = self.get_matching_payload(holdout_value.as_deref(), flag)?;
                    return Ok(FeatureFlagMatch {
                        matches: true,
                        variant: holdout_value,
                        reason: evaluation_reason,
                        condition_index: None,
                        payload,
                    });
                }
            }
        }

        let conditions = self
            .flag_evaluation_state
            .flag_conditions
            .get(&flag.key)
            .unwrap_or(flag.get_conditions());

        // Conditions carrying a variant override go first; original indexes
        // are kept for reporting.
        let mut sorted_conditions: Vec<(usize, &FlagPropertyGroup)> =
            conditions.iter().enumerate().collect();
        sorted_conditions
            .sort_by_key(|(_, condition)| if condition.variant.is_some() { 0 } else { 1 });

        for (index, condition) in sorted_conditions {
            let (is_match, reason) =
                self.is_condition_match(flag, condition, index, hash_key_overrides)?;

            (highest_match, highest_index) = highest_priority_evaluation(
                (highest_match, highest_index),
                (reason, Some(index)),
            );

            if is_match {
                let variant = self.get_matching_variant_with_override(
                    flag,
                    condition.variant.as_deref(),
                    hash_key_overrides,
                )?;
                let payload = self.get_matching_payload(variant.as_deref(), flag)?;
                return Ok(FeatureFlagMatch {
                    matches: true,
                    variant,
                    reason: highest_match,
                    condition_index: highest_index,
                    payload,
                });
            }
        }

        Ok(FeatureFlagMatch {
            matches: false,
            variant: None,
            reason: highest_match,
            condition_index: highest_index,
            payload: None,
        })
    }

    /// Property check first (locally when the overrides cover the condition,
    /// otherwise from the batched store results), then the rollout check.
    fn is_condition_match(
        &self,
        feature_flag: &FeatureFlag,
        condition: &FlagPropertyGroup,
        condition_index: usize,
        hash_key_overrides: Option<&HashMap<String, String>>,
    ) -> Result<(bool, FeatureFlagMatchReason), FlagError> {
        let rollout_percentage = condition.rollout_percentage.unwrap_or(100.0);

        if let Some(flag_property_filters) = &condition.properties {
            if !flag_property_filters.is_empty() {
                let property_overrides = self.relevant_property_overrides(feature_flag);
                let properties_match = match locally_computable_property_overrides(
                    property_overrides.as_ref(),
                    flag_property_filters,
                ) {
                    Some(overrides) => all_properties_match(flag_property_filters, &overrides),
                    None => self.stored_condition_result(&condition_key(
                        &feature_flag.key,
                        ConditionKind::Condition,
                        condition_index,
                    ))?,
                };

                if !properties_match {
                    return Ok((false, FeatureFlagMatchReason::NoConditionMatch));
                }
            }
        }

        self.check_rollout(feature_flag, rollout_percentage, hash_key_overrides)
    }

    /// Super conditions short-circuit normal evaluation when the subject has
    /// the enrollment marker set. A property-less super condition stands on
    /// its own rollout check.
    fn is_super_condition_match(
        &self,
        feature_flag: &FeatureFlag,
        hash_key_overrides: Option<&HashMap<String, String>>,
    ) -> Result<SuperConditionEvaluation, FlagError> {
        let Some(super_condition) = feature_flag
            .filters
            .super_groups
            .as_ref()
            .and_then(|groups| groups.first())
        else {
            return Ok(SuperConditionEvaluation {
                should_evaluate: false,
                is_match: false,
                reason: FeatureFlagMatchReason::NoConditionMatch,
            });
        };

        let properties = super_condition.properties.as_deref().unwrap_or_default();
        let rollout_percentage = super_condition.rollout_percentage.unwrap_or(100.0);

        if properties.is_empty() {
            let (is_match, rollout_reason) =
                self.check_rollout(feature_flag, rollout_percentage, hash_key_overrides)?;
            let reason = if is_match {
                FeatureFlagMatchReason::SuperConditionValue
            } else {
                rollout_reason
            };
            return Ok(SuperConditionEvaluation {
                should_evaluate: true,
                is_match,
                reason,
            });
        }

        let (value_is_set, properties_match) = if self.super_condition_locally_checkable(properties)
        {
            let overrides = self.person_property_overrides.clone().unwrap_or_default();
            (true, all_properties_match(properties, &overrides))
        } else {
            let is_set = self.stored_condition_result(&condition_key(
                &feature_flag.key,
                ConditionKind::SuperCheck,
                0,
            ))?;
            if is_set {
                let matches = self.stored_condition_result(&condition_key(
                    &feature_flag.key,
                    ConditionKind::Super,
                    0,
                ))?;
                (true, matches)
            } else {
                (false, false)
            }
        };

        if value_is_set {
            let (rollout_ok, _) =
                self.check_rollout(feature_flag, rollout_percentage, hash_key_overrides)?;
            return Ok(SuperConditionEvaluation {
                should_evaluate: true,
                is_match: properties_match && rollout_ok,
                reason: FeatureFlagMatchReason::SuperConditionValue,
            });
        }

        Ok(SuperConditionEvaluation {
            should_evaluate: false,
            is_match: false,
            reason: FeatureFlagMatchReason::NoConditionMatch,
        })
    }

    /// Holdouts only support property-less conditions with a rollout. The
    /// holdout hash is shared across flags, so one subject lands in the same
    /// holdout bucket everywhere.
    fn is_holdout_condition_match(
        &self,
        flag: &FeatureFlag,
    ) -> Result<(bool, Option<String>, FeatureFlagMatchReason), FlagError> {
        if let Some(condition) = flag
            .filters
            .holdout_groups
            .as_ref()
            .and_then(|groups| groups.first())
        {
            if condition
                .properties
                .as_ref()
                .is_some_and(|properties| !properties.is_empty())
            {
                return Ok((false, None, FeatureFlagMatchReason::NoConditionMatch));
            }

            if let Some(percentage) = condition.rollout_percentage {
                if self.get_holdout_hash(flag)? > (percentage / 100.0) {
                    return Ok((false, None, FeatureFlagMatchReason::OutOfRolloutBound));
                }
            }

            let variant = if let Some(variant_override) = condition.variant.as_ref() {
                variant_override.clone()
            } else {
                self.get_matching_variant(flag, None)?
                    .unwrap_or_else(|| "holdout".to_string())
            };

            return Ok((
                true,
                Some(variant),
                FeatureFlagMatchReason::HoldoutConditionValue,
            ));
        }
        Ok((false, None, FeatureFlagMatchReason::NoConditionMatch))
    }

    /// The identifier this flag hashes against: the group key for
    /// group-aggregated flags, otherwise the distinct id or its continuity
    /// override. Empty means the flag can never match.
    fn hashed_identifier(
        &self,
        feature_flag: &FeatureFlag,
        hash_key_overrides: Option<&HashMap<String, String>>,
    ) -> Result<String, FlagError> {
        if let Some(group_type_index) = feature_flag.get_group_type_index() {
            let index_to_type = self.group_type_mapping_cache.group_type_index_to_type_map()?;
            let group_key = index_to_type
                .get(&group_type_index)
                .and_then(|group_type| self.groups.get(group_type))
                .map(group_key_to_string)
                .unwrap_or_default();
            Ok(group_key)
        } else if let Some(hash_key_override) =
            hash_key_overrides.and_then(|overrides| overrides.get(&feature_flag.key))
        {
            Ok(hash_key_override.clone())
        } else {
            Ok(self.distinct_id.clone())
        }
    }

    /// Hash in [0, 1) for this subject and flag. A missing identifier maps to
    /// exactly 0.0 so the flag always evaluates out of rollout.
    fn get_hash(
        &self,
        feature_flag: &FeatureFlag,
        salt: &str,
        hash_key_overrides: Option<&HashMap<String, String>>,
    ) -> Result<f64, FlagError> {
        let hashed_identifier = self.hashed_identifier(feature_flag, hash_key_overrides)?;
        if hashed_identifier.is_empty() {
            return Ok(0.0);
        }
        Ok(calculate_hash(
            &format!("{}.", feature_flag.key),
            &hashed_identifier,
            salt,
        ))
    }

    fn get_holdout_hash(&self, feature_flag: &FeatureFlag) -> Result<f64, FlagError> {
        let hashed_identifier = self.hashed_identifier(feature_flag, None)?;
        if hashed_identifier.is_empty() {
            return Ok(0.0);
        }
        Ok(calculate_hash("holdout-", &hashed_identifier, ""))
    }

    fn check_rollout(
        &self,
        feature_flag: &FeatureFlag,
        rollout_percentage: f64,
        hash_key_overrides: Option<&HashMap<String, String>>,
    ) -> Result<(bool, FeatureFlagMatchReason), FlagError> {
        let hash = self.get_hash(feature_flag, "", hash_key_overrides)?;
        if rollout_percentage == 100.0 || hash <= (rollout_percentage / 100.0) {
            Ok((true, FeatureFlagMatchReason::ConditionMatch))
        } else {
            Ok((false, FeatureFlagMatchReason::OutOfRolloutBound))
        }
    }

    /// Variant for a matched multivariate flag, via the hash-based lookup
    /// table. The variant hash is computed once per flag evaluation.
    pub(crate) fn get_matching_variant(
        &self,
        feature_flag: &FeatureFlag,
        hash_key_overrides: Option<&HashMap<String, String>>,
    ) -> Result<Option<String>, FlagError> {
        let hash = self.get_hash(feature_flag, "variant", hash_key_overrides)?;
        let table = variant_lookup_table(&feature_flag.get_variants());
        Ok(variant_for_hash(&table, hash))
    }

    /// A condition's variant override wins only when it names a real variant;
    /// otherwise fall back to hash-based resolution.
    fn get_matching_variant_with_override(
        &self,
        feature_flag: &FeatureFlag,
        variant_override: Option<&str>,
        hash_key_overrides: Option<&HashMap<String, String>>,
    ) -> Result<Option<String>, FlagError> {
        if let Some(variant_override) = variant_override {
            if feature_flag
                .get_variants()
                .iter()
                .any(|variant| variant.key == variant_override)
            {
                return Ok(Some(variant_override.to_string()));
            }
        }
        self.get_matching_variant(feature_flag, hash_key_overrides)
    }

    fn get_matching_payload(
        &self,
        match_variant: Option<&str>,
        feature_flag: &FeatureFlag,
    ) -> Result<Option<Value>, FlagError> {
        let variant = match_variant.unwrap_or("true");
        let Some(payload) = feature_flag.get_payload(variant) else {
            return Ok(None);
        };
        if feature_flag.has_encrypted_payloads {
            if let Some(decrypter) = &self.payload_decrypter {
                return Ok(Some(decrypter.decrypt(&payload).map_err(FlagError::from)?));
            }
        }
        Ok(Some(payload))
    }

    /// Plans store-side evaluation for every condition the overrides can't
    /// cover, then runs one batched query per entity target. Per-flag
    /// planning failures are returned; a store failure is remembered in the
    /// evaluation state.
    async fn prepare_flag_evaluation_state(&mut self, flags: &[&FeatureFlag]) -> PlanningOutcome {
        let mut resolver = CohortResolver::new(self.project_id, self.cohort_store.clone());
        let mut outcome = PlanningOutcome::default();
        let mut person_expressions: Vec<ConditionExpression> = Vec::new();
        let mut group_expressions: HashMap<GroupTypeIndex, (String, Vec<ConditionExpression>)> =
            HashMap::new();

        for flag in flags {
            if let Err(e) = self
                .plan_flag(
                    flag,
                    &mut resolver,
                    &mut person_expressions,
                    &mut group_expressions,
                )
                .await
            {
                outcome.flag_errors.insert(flag.key.clone(), e);
            }
        }

        if !person_expressions.is_empty() {
            let target = EntityTarget::Person {
                team_id: self.team_id,
                distinct_id: self.distinct_id.clone(),
            };
            self.run_condition_query(&target, &person_expressions).await;
        }
        for (group_type_index, (group_key, expressions)) in &group_expressions {
            if self.flag_evaluation_state.conditions_unavailable {
                // One failed round-trip marks the whole call; don't pile on.
                break;
            }
            let target = EntityTarget::Group {
                team_id: self.team_id,
                group_type_index: *group_type_index,
                group_key: group_key.clone(),
            };
            self.run_condition_query(&target, expressions).await;
        }

        outcome
    }

    async fn plan_flag(
        &mut self,
        flag: &FeatureFlag,
        resolver: &mut CohortResolver,
        person_expressions: &mut Vec<ConditionExpression>,
        group_expressions: &mut HashMap<GroupTypeIndex, (String, Vec<ConditionExpression>)>,
    ) -> Result<(), FlagError> {
        let mut conditions = flag.get_conditions().clone();

        let has_cohort_filters = conditions.iter().any(|condition| {
            condition
                .properties
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|filter| filter.is_cohort())
        });
        if has_cohort_filters {
            // A dependency cycle fails the flag here; an unexpandable cohort
            // just stays on the store path.
            if let Some(expanded) = expand_cohort_conditions(&conditions, resolver).await? {
                conditions = expanded.clone();
                self.flag_evaluation_state
                    .flag_conditions
                    .insert(flag.key.clone(), expanded);
            }
        }

        let property_overrides = self.relevant_property_overrides(flag);

        for (index, condition) in conditions.iter().enumerate() {
            let Some(properties) = condition
                .properties
                .as_ref()
                .filter(|properties| !properties.is_empty())
            else {
                continue;
            };
            if locally_computable_property_overrides(property_overrides.as_ref(), properties)
                .is_some()
            {
                continue;
            }
            let expression = build_property_expression(properties, resolver).await?;
            let planned = plan_condition(
                &flag.key,
                ConditionKind::Condition,
                index,
                expression,
                properties,
            );
            match flag.get_group_type_index() {
                None => person_expressions.push(planned),
                Some(group_type_index) => {
                    // Without a group key the flag resolves to no_group_type;
                    // nothing to query.
                    if let Some(group_key) = self.group_key_for_index(group_type_index) {
                        group_expressions
                            .entry(group_type_index)
                            .or_insert_with(|| (group_key, Vec::new()))
                            .1
                            .push(planned);
                    }
                }
            }
        }

        // Super conditions always check person state, even on group flags.
        if let Some(super_condition) = flag
            .filters
            .super_groups
            .as_ref()
            .and_then(|groups| groups.first())
        {
            if let Some(properties) = super_condition
                .properties
                .as_ref()
                .filter(|properties| !properties.is_empty())
            {
                if !self.super_condition_locally_checkable(properties) {
                    person_expressions.push(plan_condition(
                        &flag.key,
                        ConditionKind::SuperCheck,
                        0,
                        is_set_expression(properties),
                        &[],
                    ));
                    let expression = build_property_expression(properties, resolver).await?;
                    person_expressions.push(plan_condition(
                        &flag.key,
                        ConditionKind::Super,
                        0,
                        expression,
                        properties,
                    ));
                }
            }
        }

        Ok(())
    }

    async fn run_condition_query(
        &mut self,
        target: &EntityTarget,
        expressions: &[ConditionExpression],
    ) {
        metrics::counter!(FLAG_CONDITION_STORE_READS_COUNTER).increment(1);
        let store = self.person_store.clone();
        match store.query_conditions(target, expressions).await {
            Ok(result) => {
                for expression in expressions {
                    let value = if expression.all_negative && !result.entity_exists {
                        // A nonexistent entity satisfies a condition made
                        // entirely of is_not_set / is_not properties.
                        true
                    } else {
                        result.matches.get(&expression.key).copied().unwrap_or(false)
                    };
                    self.flag_evaluation_state
                        .condition_results
                        .insert(expression.key.clone(), value);
                }
            }
            Err(e) => {
                self.flag_evaluation_state.conditions_unavailable = true;
                metrics::counter!(
                    FLAG_EVALUATION_ERROR_COUNTER,
                    "reason" => "conditions_unavailable"
                )
                .increment(1);
                error!(
                    team_id = self.team_id,
                    distinct_id = %self.distinct_id,
                    error = %e,
                    "Batched condition query failed; conditions unavailable for this call"
                );
            }
        }
    }

    fn stored_condition_result(&self, key: &str) -> Result<bool, FlagError> {
        if self.flag_evaluation_state.conditions_unavailable {
            return Err(FlagError::ConditionsUnavailable);
        }
        self.flag_evaluation_state
            .condition_results
            .get(key)
            .copied()
            .ok_or(FlagError::ConditionsUnavailable)
    }

    /// Overrides relevant to a flag: group-property overrides for its group
    /// type when group-aggregated, person-property overrides otherwise.
    fn relevant_property_overrides(&self, flag: &FeatureFlag) -> Option<HashMap<String, Value>> {
        match flag.get_group_type_index() {
            Some(group_type_index) => {
                let index_to_type = self
                    .group_type_mapping_cache
                    .group_type_index_to_type_map()
                    .ok()?;
                let group_type = index_to_type.get(&group_type_index)?;
                self.group_property_overrides
                    .as_ref()?
                    .get(group_type)
                    .cloned()
            }
            None => self.person_property_overrides.clone(),
        }
    }

    fn super_condition_locally_checkable(&self, properties: &[PropertyFilter]) -> bool {
        self.person_property_overrides
            .as_ref()
            .is_some_and(|overrides| {
                properties
                    .iter()
                    .any(|property| overrides.contains_key(&property.key))
            })
    }

    fn group_key_for_index(&self, group_type_index: GroupTypeIndex) -> Option<String> {
        let index_to_type = self
            .group_type_mapping_cache
            .group_type_index_to_type_map()
            .ok()?;
        let group_type = index_to_type.get(&group_type_index)?;
        let key = group_key_to_string(self.groups.get(group_type)?);
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }
}

fn flag_requires_store(flag: &FeatureFlag) -> bool {
    flag.get_group_type_index().is_some() || flag.ensure_experience_continuity
}

fn group_key_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        // Any other JSON type yields the empty identifier, which never
        // matches.
        _ => String::new(),
    }
}

/// Keeps the higher priority (reason, index) pair; ties keep the earliest
/// condition index.
fn highest_priority_evaluation(
    current: (FeatureFlagMatchReason, Option<usize>),
    new: (FeatureFlagMatchReason, Option<usize>),
) -> (FeatureFlagMatchReason, Option<usize>) {
    match new.0.cmp(&current.0) {
        std::cmp::Ordering::Greater => new,
        std::cmp::Ordering::Equal => match (current.1, new.1) {
            (None, _) => new,
            (Some(current_index), Some(new_index)) if new_index < current_index => new,
            _ => current,
        },
        std::cmp::Ordering::Less => current,
    }
}
