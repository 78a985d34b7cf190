use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::cohorts::cohort_models::Cohort;
use crate::flags::flag_hashing::{calculate_hash, variant_for_hash, variant_lookup_table};
use crate::flags::flag_match_reason::FeatureFlagMatchReason;
use crate::flags::flag_matching::FeatureFlagMatcher;
use crate::flags::flag_models::{
    FeatureFlag, FeatureFlagList, FlagFilters, FlagPropertyGroup, FlagValue,
};
use crate::properties::property_models::OperatorType;
use crate::store::{
    CohortStoreRef, GroupTypeMappingProviderRef, PayloadDecrypterRef, PersonStoreRef,
};
use crate::test_utils::{
    create_boolean_flag, create_condition, create_multivariate, create_person_filter,
    create_test_flag, MemoryCohortStore, MemoryGroupTypeMappings, MemoryPersonStore,
    TestPayloadDecrypter,
};

const TEAM_ID: i32 = 1;
const PROJECT_ID: i64 = 1;

struct TestContext {
    person_store: Arc<MemoryPersonStore>,
    cohort_store: Arc<MemoryCohortStore>,
    mappings: Arc<MemoryGroupTypeMappings>,
    decrypter: Option<PayloadDecrypterRef>,
}

impl TestContext {
    fn new() -> Self {
        TestContext {
            person_store: Arc::new(MemoryPersonStore::new()),
            cohort_store: Arc::new(MemoryCohortStore::new(vec![])),
            mappings: Arc::new(MemoryGroupTypeMappings::standard()),
            decrypter: None,
        }
    }

    fn with_cohorts(cohorts: Vec<Cohort>) -> Self {
        TestContext {
            cohort_store: Arc::new(MemoryCohortStore::new(cohorts)),
            ..Self::new()
        }
    }

    fn matcher(&self, distinct_id: &str, groups: Option<HashMap<String, Value>>) -> FeatureFlagMatcher {
        let person_store: PersonStoreRef = self.person_store.clone();
        let cohort_store: CohortStoreRef = self.cohort_store.clone();
        let mappings: GroupTypeMappingProviderRef = self.mappings.clone();
        FeatureFlagMatcher::new(
            distinct_id.to_string(),
            TEAM_ID,
            PROJECT_ID,
            person_store,
            cohort_store,
            mappings,
            groups,
            self.decrypter.clone(),
        )
    }
}

fn flag_list(flags: Vec<FeatureFlag>) -> FeatureFlagList {
    FeatureFlagList::new(flags)
}

#[test]
fn test_rollout_boundary_is_exact() {
    let context = TestContext::new();
    let flag = create_boolean_flag(1, TEAM_ID, "rollout-flag", Some(30.0));

    for i in 0..50 {
        let distinct_id = format!("user_{i}");
        let expected = calculate_hash("rollout-flag.", &distinct_id, "") <= 0.3;
        let matcher = context.matcher(&distinct_id, None);
        let result = matcher.get_match(&flag, None).unwrap();
        assert_eq!(result.matches, expected, "mismatch for {distinct_id}");
        if expected {
            assert_eq!(result.reason, FeatureFlagMatchReason::ConditionMatch);
        } else {
            assert_eq!(result.reason, FeatureFlagMatchReason::OutOfRolloutBound);
        }
        assert_eq!(result.condition_index, Some(0));
    }
}

#[test]
fn test_fifty_percent_rollout_is_deterministic() {
    let context = TestContext::new();
    let flag = create_boolean_flag(1, TEAM_ID, "beta", Some(50.0));
    let matcher = context.matcher("user_42", None);

    let first = matcher.get_match(&flag, None).unwrap();
    let second = matcher.get_match(&flag, None).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first.matches,
        calculate_hash("beta.", "user_42", "") <= 0.5
    );
}

#[test]
fn test_hundred_percent_rollout_always_matches() {
    let context = TestContext::new();
    let flag = create_boolean_flag(1, TEAM_ID, "always-on", Some(100.0));
    let result = context
        .matcher("any_user", None)
        .get_match(&flag, None)
        .unwrap();
    assert!(result.matches);
    assert_eq!(result.reason, FeatureFlagMatchReason::ConditionMatch);
}

#[test]
fn test_missing_rollout_percentage_means_full_rollout() {
    let context = TestContext::new();
    let flag = create_boolean_flag(1, TEAM_ID, "no-rollout-set", None);
    assert!(context
        .matcher("any_user", None)
        .get_match(&flag, None)
        .unwrap()
        .matches);
}

#[test]
fn test_group_flag_without_group_key_is_no_group_type() {
    let context = TestContext::new();
    let mut flag = create_boolean_flag(1, TEAM_ID, "group-flag", Some(100.0));
    flag.filters.aggregation_group_type_index = Some(0);

    let result = context
        .matcher("user_1", None)
        .get_match(&flag, None)
        .unwrap();
    assert!(!result.matches);
    assert_eq!(result.reason, FeatureFlagMatchReason::NoGroupType);
    assert_eq!(result.condition_index, None);
}

#[tokio::test]
async fn test_group_flag_without_group_key_via_batch() {
    let context = TestContext::new();
    let mut flag = create_boolean_flag(1, TEAM_ID, "group-flag", Some(100.0));
    flag.filters.aggregation_group_type_index = Some(0);

    let mut matcher = context.matcher("user_1", None);
    let response = matcher
        .evaluate_all_feature_flags(&flag_list(vec![flag]), None, None, None, false)
        .await;

    assert_eq!(
        response.values.get("group-flag"),
        Some(&FlagValue::Boolean(false))
    );
    assert_eq!(
        response.reasons.get("group-flag").unwrap().reason,
        FeatureFlagMatchReason::NoGroupType
    );
    assert!(!response.errors_while_computing_flags);
}

#[tokio::test]
async fn test_store_failure_isolates_affected_flags() {
    let context = TestContext::new();
    context.person_store.set_failing(true);

    let flag_one = create_boolean_flag(1, TEAM_ID, "flag_1", Some(100.0));
    let flag_two = create_test_flag(
        2,
        TEAM_ID,
        "flag_2",
        FlagFilters {
            groups: vec![create_condition(
                vec![create_person_filter("email", json!("@example.com"), Some(OperatorType::Icontains))],
                Some(100.0),
            )],
            ..Default::default()
        },
    );
    let flag_three = create_boolean_flag(3, TEAM_ID, "flag_3", Some(100.0));

    let mut matcher = context.matcher("user_1", None);
    let response = matcher
        .evaluate_all_feature_flags(
            &flag_list(vec![flag_one, flag_two, flag_three]),
            None,
            None,
            None,
            false,
        )
        .await;

    assert!(response.errors_while_computing_flags);
    assert!(response.values.contains_key("flag_1"));
    assert!(!response.values.contains_key("flag_2"));
    assert!(response.values.contains_key("flag_3"));
}

#[tokio::test]
async fn test_local_evaluation_never_touches_the_store() {
    let context = TestContext::new();
    let flag = create_test_flag(
        1,
        TEAM_ID,
        "local-flag",
        FlagFilters {
            groups: vec![create_condition(
                vec![create_person_filter("plan", json!("pro"), None)],
                Some(100.0),
            )],
            ..Default::default()
        },
    );

    let overrides = HashMap::from([("plan".to_string(), json!("pro"))]);
    let mut matcher = context.matcher("user_1", None);
    let response = matcher
        .evaluate_all_feature_flags(&flag_list(vec![flag]), Some(overrides), None, None, false)
        .await;

    assert_eq!(
        response.values.get("local-flag"),
        Some(&FlagValue::Boolean(true))
    );
    assert_eq!(context.person_store.query_count(), 0);
}

#[tokio::test]
async fn test_partial_overrides_fall_back_to_the_store() {
    let context = TestContext::new();
    context.person_store.add_person(
        TEAM_ID,
        "user_1",
        HashMap::from([
            ("plan".to_string(), json!("pro")),
            ("email".to_string(), json!("a@example.com")),
        ]),
    );
    let flag = create_test_flag(
        1,
        TEAM_ID,
        "partial-flag",
        FlagFilters {
            groups: vec![create_condition(
                vec![
                    create_person_filter("plan", json!("pro"), None),
                    create_person_filter("email", json!("@example.com"), Some(OperatorType::Icontains)),
                ],
                Some(100.0),
            )],
            ..Default::default()
        },
    );

    // Overrides cover one of two keys: not locally computable.
    let overrides = HashMap::from([("plan".to_string(), json!("pro"))]);
    let mut matcher = context.matcher("user_1", None);
    let response = matcher
        .evaluate_all_feature_flags(&flag_list(vec![flag]), Some(overrides), None, None, false)
        .await;

    assert_eq!(
        response.values.get("partial-flag"),
        Some(&FlagValue::Boolean(true))
    );
    assert_eq!(context.person_store.query_count(), 1);
}

#[tokio::test]
async fn test_condition_queries_are_batched_across_flags() {
    let context = TestContext::new();
    context.person_store.add_person(
        TEAM_ID,
        "user_1",
        HashMap::from([("plan".to_string(), json!("pro"))]),
    );

    let flags: Vec<FeatureFlag> = (0..5)
        .map(|i| {
            create_test_flag(
                i,
                TEAM_ID,
                &format!("flag_{i}"),
                FlagFilters {
                    groups: vec![create_condition(
                        vec![create_person_filter("plan", json!("pro"), None)],
                        Some(100.0),
                    )],
                    ..Default::default()
                },
            )
        })
        .collect();

    let mut matcher = context.matcher("user_1", None);
    let response = matcher
        .evaluate_all_feature_flags(&flag_list(flags), None, None, None, false)
        .await;

    assert_eq!(response.values.len(), 5);
    assert!(response
        .values
        .values()
        .all(|value| value == &FlagValue::Boolean(true)));
    // One round-trip for the whole batch, not one per flag.
    assert_eq!(context.person_store.query_count(), 1);
}

#[tokio::test]
async fn test_pure_negative_condition_matches_nonexistent_person() {
    let context = TestContext::new();
    let flag = create_test_flag(
        1,
        TEAM_ID,
        "negative-flag",
        FlagFilters {
            groups: vec![create_condition(
                vec![create_person_filter("email", json!("x"), Some(OperatorType::IsNotSet))],
                Some(100.0),
            )],
            ..Default::default()
        },
    );

    let mut matcher = context.matcher("ghost_user", None);
    let response = matcher
        .evaluate_all_feature_flags(&flag_list(vec![flag]), None, None, None, false)
        .await;

    assert_eq!(
        response.values.get("negative-flag"),
        Some(&FlagValue::Boolean(true))
    );
}

#[tokio::test]
async fn test_variant_resolution_matches_lookup_table() {
    let context = TestContext::new();
    let mut flag = create_boolean_flag(1, TEAM_ID, "multivariate-flag", Some(100.0));
    flag.filters.multivariate = Some(create_multivariate(&[
        ("control", 33.0),
        ("test_a", 33.0),
        ("test_b", 34.0),
    ]));

    let table = variant_lookup_table(&flag.get_variants());
    for i in 0..20 {
        let distinct_id = format!("user_{i}");
        let hash = calculate_hash("multivariate-flag.", &distinct_id, "variant");
        let expected = variant_for_hash(&table, hash);

        let mut matcher = context.matcher(&distinct_id, None);
        let response = matcher
            .evaluate_all_feature_flags(
                &flag_list(vec![flag.clone()]),
                None,
                None,
                None,
                false,
            )
            .await;
        let value = response.values.get("multivariate-flag").unwrap();
        match expected {
            Some(variant) => assert_eq!(value, &FlagValue::String(variant)),
            None => assert_eq!(value, &FlagValue::Boolean(true)),
        }
    }
}

#[test]
fn test_variant_override_must_name_a_real_variant() {
    let context = TestContext::new();
    let mut flag = create_boolean_flag(1, TEAM_ID, "override-flag", Some(100.0));
    flag.filters.multivariate = Some(create_multivariate(&[("control", 50.0), ("test", 50.0)]));
    flag.filters.groups[0].variant = Some("control".to_string());

    let matcher = context.matcher("user_1", None);
    let result = matcher.get_match(&flag, None).unwrap();
    assert_eq!(result.variant, Some("control".to_string()));

    // An override naming a nonexistent variant falls back to the hash.
    flag.filters.groups[0].variant = Some("does_not_exist".to_string());
    let result = matcher.get_match(&flag, None).unwrap();
    let hash = calculate_hash("override-flag.", "user_1", "variant");
    let expected = variant_for_hash(&variant_lookup_table(&flag.get_variants()), hash);
    assert_eq!(result.variant, expected);
}

#[test]
fn test_conditions_with_variant_overrides_evaluate_first() {
    let context = TestContext::new();
    let mut flag = create_test_flag(
        1,
        TEAM_ID,
        "sorted-flag",
        FlagFilters {
            groups: vec![
                create_condition(vec![], Some(100.0)),
                create_condition(vec![], Some(100.0)),
            ],
            multivariate: Some(create_multivariate(&[("control", 50.0), ("test", 50.0)])),
            ..Default::default()
        },
    );
    flag.filters.groups[1].variant = Some("test".to_string());

    let result = context
        .matcher("user_1", None)
        .get_match(&flag, None)
        .unwrap();
    assert!(result.matches);
    // The second condition won because its variant override sorted it first.
    assert_eq!(result.condition_index, Some(1));
    assert_eq!(result.variant, Some("test".to_string()));
}

#[test]
fn test_no_match_reports_highest_priority_reason() {
    let context = TestContext::new();

    // Pick an identifier that is out of a 30% rollout for this flag key.
    let distinct_id = (0..)
        .map(|i| format!("user_{i}"))
        .find(|id| calculate_hash("priority-flag.", id, "") > 0.3)
        .unwrap();

    let flag = create_test_flag(
        1,
        TEAM_ID,
        "priority-flag",
        FlagFilters {
            groups: vec![
                create_condition(vec![], Some(30.0)),
                create_condition(
                    vec![create_person_filter("plan", json!("pro"), None)],
                    Some(100.0),
                ),
            ],
            ..Default::default()
        },
    );

    let mut matcher = context.matcher(&distinct_id, None);
    matcher.person_property_overrides = Some(HashMap::from([("plan".to_string(), json!("free"))]));

    let result = matcher.get_match(&flag, None).unwrap();
    assert!(!result.matches);
    // OUT_OF_ROLLOUT_BOUND outranks NO_CONDITION_MATCH.
    assert_eq!(result.reason, FeatureFlagMatchReason::OutOfRolloutBound);
    assert_eq!(result.condition_index, Some(0));
}

#[test]
fn test_payload_for_boolean_match() {
    let context = TestContext::new();
    let mut flag = create_boolean_flag(1, TEAM_ID, "payload-flag", Some(100.0));
    flag.filters.payloads = Some(json!({"true": {"plan": "premium"}}));

    let result = context
        .matcher("user_1", None)
        .get_match(&flag, None)
        .unwrap();
    assert!(result.matches);
    assert_eq!(result.payload, Some(json!({"plan": "premium"})));
}

#[test]
fn test_payload_for_variant_match() {
    let context = TestContext::new();
    let mut flag = create_boolean_flag(1, TEAM_ID, "variant-payload-flag", Some(100.0));
    flag.filters.multivariate = Some(create_multivariate(&[("control", 100.0)]));
    flag.filters.payloads = Some(json!({"control": [1, 2, 3], "true": "unused"}));

    let result = context
        .matcher("user_1", None)
        .get_match(&flag, None)
        .unwrap();
    assert_eq!(result.variant, Some("control".to_string()));
    assert_eq!(result.payload, Some(json!([1, 2, 3])));
}

#[test]
fn test_no_payload_when_not_matched() {
    let context = TestContext::new();

    let distinct_id = (0..)
        .map(|i| format!("user_{i}"))
        .find(|id| calculate_hash("gated-flag.", id, "") > 0.01)
        .unwrap();

    let mut flag = create_boolean_flag(1, TEAM_ID, "gated-flag", Some(1.0));
    flag.filters.payloads = Some(json!({"true": "secret"}));

    let result = context
        .matcher(&distinct_id, None)
        .get_match(&flag, None)
        .unwrap();
    assert!(!result.matches);
    assert_eq!(result.payload, None);
}

#[test]
fn test_encrypted_payload_goes_through_decrypter() {
    let mut context = TestContext::new();
    context.decrypter = Some(Arc::new(TestPayloadDecrypter));

    let mut flag = create_boolean_flag(1, TEAM_ID, "secret-flag", Some(100.0));
    flag.has_encrypted_payloads = true;
    flag.filters.payloads = Some(json!({"true": "ciphertext"}));

    let result = context
        .matcher("user_1", None)
        .get_match(&flag, None)
        .unwrap();
    assert_eq!(result.payload, Some(json!({"decrypted": "ciphertext"})));
}

fn super_flag(key: &str) -> FeatureFlag {
    let marker = format!("$feature_enrollment/{key}");
    create_test_flag(
        1,
        TEAM_ID,
        key,
        FlagFilters {
            groups: vec![create_condition(vec![], Some(0.0))],
            super_groups: Some(vec![create_condition(
                vec![create_person_filter(&marker, json!(["true"]), None)],
                Some(100.0),
            )]),
            ..Default::default()
        },
    )
}

#[test]
fn test_super_condition_enrolled_via_overrides() {
    let context = TestContext::new();
    let flag = super_flag("early-access");

    let mut matcher = context.matcher("user_1", None);
    matcher.person_property_overrides = Some(HashMap::from([(
        "$feature_enrollment/early-access".to_string(),
        json!("true"),
    )]));

    let result = matcher.get_match(&flag, None).unwrap();
    assert!(result.matches);
    assert_eq!(result.reason, FeatureFlagMatchReason::SuperConditionValue);
    assert_eq!(result.condition_index, Some(0));
}

#[test]
fn test_super_condition_opted_out_via_overrides() {
    let context = TestContext::new();
    let flag = super_flag("early-access");

    let mut matcher = context.matcher("user_1", None);
    matcher.person_property_overrides = Some(HashMap::from([(
        "$feature_enrollment/early-access".to_string(),
        json!("false"),
    )]));

    // Marker set to false: explicit opt-out, still reported as the super
    // condition's decision.
    let result = matcher.get_match(&flag, None).unwrap();
    assert!(!result.matches);
    assert_eq!(result.reason, FeatureFlagMatchReason::SuperConditionValue);
}

#[tokio::test]
async fn test_super_condition_from_store() {
    let context = TestContext::new();
    context.person_store.add_person(
        TEAM_ID,
        "enrolled_user",
        HashMap::from([("$feature_enrollment/early-access".to_string(), json!("true"))]),
    );

    let flag = super_flag("early-access");
    let mut matcher = context.matcher("enrolled_user", None);
    let response = matcher
        .evaluate_all_feature_flags(&flag_list(vec![flag]), None, None, None, false)
        .await;

    assert_eq!(
        response.values.get("early-access"),
        Some(&FlagValue::Boolean(true))
    );
    assert_eq!(
        response.reasons.get("early-access").unwrap().reason,
        FeatureFlagMatchReason::SuperConditionValue
    );
}

#[tokio::test]
async fn test_super_condition_unset_falls_through_to_conditions() {
    let context = TestContext::new();
    context.person_store.add_person(
        TEAM_ID,
        "regular_user",
        HashMap::from([("plan".to_string(), json!("pro"))]),
    );

    let mut flag = super_flag("early-access");
    // Regular condition that matches everyone.
    flag.filters.groups = vec![create_condition(vec![], Some(100.0))];

    let mut matcher = context.matcher("regular_user", None);
    let response = matcher
        .evaluate_all_feature_flags(&flag_list(vec![flag]), None, None, None, false)
        .await;

    assert_eq!(
        response.values.get("early-access"),
        Some(&FlagValue::Boolean(true))
    );
    assert_eq!(
        response.reasons.get("early-access").unwrap().reason,
        FeatureFlagMatchReason::ConditionMatch
    );
}

#[test]
fn test_property_less_super_condition_stands_on_its_rollout() {
    let context = TestContext::new();
    let flag = create_test_flag(
        1,
        TEAM_ID,
        "rollout-super",
        FlagFilters {
            groups: vec![create_condition(vec![], Some(0.0))],
            super_groups: Some(vec![create_condition(vec![], Some(100.0))]),
            ..Default::default()
        },
    );

    let result = context
        .matcher("user_1", None)
        .get_match(&flag, None)
        .unwrap();
    assert!(result.matches);
    assert_eq!(result.reason, FeatureFlagMatchReason::SuperConditionValue);
}

#[test]
fn test_holdout_condition_at_full_rollout() {
    let context = TestContext::new();
    let mut flag = create_boolean_flag(1, TEAM_ID, "holdout-flag", Some(0.0));
    flag.filters.holdout_groups = Some(vec![FlagPropertyGroup {
        properties: Some(vec![]),
        rollout_percentage: Some(100.0),
        variant: Some("holdout".to_string()),
    }]);

    let result = context
        .matcher("user_1", None)
        .get_match(&flag, None)
        .unwrap();
    assert!(result.matches);
    assert_eq!(result.variant, Some("holdout".to_string()));
    assert_eq!(result.reason, FeatureFlagMatchReason::HoldoutConditionValue);
}

#[test]
fn test_holdout_bucket_is_shared_across_flags() {
    let context = TestContext::new();
    let holdout = |id: i32, key: &str| {
        let mut flag = create_boolean_flag(id, TEAM_ID, key, Some(100.0));
        flag.filters.holdout_groups = Some(vec![FlagPropertyGroup {
            properties: Some(vec![]),
            rollout_percentage: Some(70.0),
            variant: Some("holdout".to_string()),
        }]);
        flag
    };
    let flag_a = holdout(1, "flag-a");
    let flag_b = holdout(2, "flag-b");

    for i in 0..20 {
        let distinct_id = format!("user_{i}");
        let expected_in_holdout = calculate_hash("holdout-", &distinct_id, "") <= 0.7;
        let matcher = context.matcher(&distinct_id, None);
        let in_a = matcher.get_match(&flag_a, None).unwrap().reason
            == FeatureFlagMatchReason::HoldoutConditionValue;
        let in_b = matcher.get_match(&flag_b, None).unwrap().reason
            == FeatureFlagMatchReason::HoldoutConditionValue;
        assert_eq!(in_a, expected_in_holdout, "flag-a for {distinct_id}");
        // The same subject lands in the same bucket for every flag.
        assert_eq!(in_a, in_b, "bucket differs between flags for {distinct_id}");
    }
}

#[test]
fn test_holdout_with_properties_is_ignored() {
    let context = TestContext::new();
    let mut flag = create_boolean_flag(1, TEAM_ID, "prop-holdout", Some(100.0));
    flag.filters.holdout_groups = Some(vec![FlagPropertyGroup {
        properties: Some(vec![create_person_filter("plan", json!("pro"), None)]),
        rollout_percentage: Some(100.0),
        variant: Some("holdout".to_string()),
    }]);

    let result = context
        .matcher("user_1", None)
        .get_match(&flag, None)
        .unwrap();
    // Falls through to the normal conditions.
    assert!(result.matches);
    assert_eq!(result.reason, FeatureFlagMatchReason::ConditionMatch);
}

#[test]
fn test_super_condition_is_checked_before_holdout() {
    // A flag should not carry both super and holdout groups; nothing enforces
    // that, and the super condition winning is the documented behavior.
    let context = TestContext::new();
    let mut flag = super_flag("quirky-flag");
    flag.filters.holdout_groups = Some(vec![FlagPropertyGroup {
        properties: Some(vec![]),
        rollout_percentage: Some(100.0),
        variant: Some("holdout".to_string()),
    }]);

    let mut matcher = context.matcher("user_1", None);
    matcher.person_property_overrides = Some(HashMap::from([(
        "$feature_enrollment/quirky-flag".to_string(),
        json!("true"),
    )]));

    let result = matcher.get_match(&flag, None).unwrap();
    assert!(result.matches);
    assert_eq!(result.reason, FeatureFlagMatchReason::SuperConditionValue);
    assert_eq!(result.variant, None);
}

#[tokio::test]
async fn test_group_flag_matches_on_group_properties() {
    let context = TestContext::new();
    context.person_store.add_group(
        TEAM_ID,
        0,
        "acme",
        HashMap::from([("industry".to_string(), json!("tech"))]),
    );

    let mut flag = create_test_flag(
        1,
        TEAM_ID,
        "group-flag",
        FlagFilters {
            groups: vec![create_condition(
                vec![create_person_filter("industry", json!("tech"), None)],
                Some(100.0),
            )],
            aggregation_group_type_index: Some(0),
            ..Default::default()
        },
    );
    flag.filters.groups[0].properties.as_mut().unwrap()[0].prop_type =
        crate::properties::property_models::PropertyType::Group;

    let groups = HashMap::from([("organization".to_string(), json!("acme"))]);
    let mut matcher = context.matcher("user_1", Some(groups));
    let response = matcher
        .evaluate_all_feature_flags(&flag_list(vec![flag]), None, None, None, false)
        .await;

    assert_eq!(
        response.values.get("group-flag"),
        Some(&FlagValue::Boolean(true))
    );
    assert_eq!(context.person_store.query_count(), 1);
}

#[tokio::test]
async fn test_group_property_overrides_evaluate_locally() {
    let context = TestContext::new();
    let flag = create_test_flag(
        1,
        TEAM_ID,
        "group-override-flag",
        FlagFilters {
            groups: vec![create_condition(
                vec![create_person_filter("industry", json!("tech"), None)],
                Some(100.0),
            )],
            aggregation_group_type_index: Some(0),
            ..Default::default()
        },
    );

    let groups = HashMap::from([("organization".to_string(), json!("acme"))]);
    let group_overrides = HashMap::from([(
        "organization".to_string(),
        HashMap::from([("industry".to_string(), json!("tech"))]),
    )]);

    let mut matcher = context.matcher("user_1", Some(groups));
    let response = matcher
        .evaluate_all_feature_flags(
            &flag_list(vec![flag]),
            None,
            Some(group_overrides),
            None,
            false,
        )
        .await;

    assert_eq!(
        response.values.get("group-override-flag"),
        Some(&FlagValue::Boolean(true))
    );
    assert_eq!(context.person_store.query_count(), 0);
}

#[tokio::test]
async fn test_group_mapping_failure_only_affects_group_flags() {
    let mut context = TestContext::new();
    context.mappings = Arc::new(MemoryGroupTypeMappings::failing());

    let mut group_flag = create_boolean_flag(1, TEAM_ID, "group-flag", Some(100.0));
    group_flag.filters.aggregation_group_type_index = Some(0);
    let person_flag = create_boolean_flag(2, TEAM_ID, "person-flag", Some(100.0));

    let groups = HashMap::from([("organization".to_string(), json!("acme"))]);
    let mut matcher = context.matcher("user_1", Some(groups));
    let response = matcher
        .evaluate_all_feature_flags(
            &flag_list(vec![group_flag, person_flag]),
            None,
            None,
            None,
            false,
        )
        .await;

    assert!(response.errors_while_computing_flags);
    assert!(!response.values.contains_key("group-flag"));
    assert_eq!(
        response.values.get("person-flag"),
        Some(&FlagValue::Boolean(true))
    );
}

#[tokio::test]
async fn test_skip_database_flags() {
    let context = TestContext::new();
    let mut group_flag = create_boolean_flag(1, TEAM_ID, "group-flag", Some(100.0));
    group_flag.filters.aggregation_group_type_index = Some(0);
    let mut continuity_flag = create_boolean_flag(2, TEAM_ID, "continuity-flag", Some(100.0));
    continuity_flag.ensure_experience_continuity = true;
    let plain_flag = create_boolean_flag(3, TEAM_ID, "plain-flag", Some(100.0));

    let mut matcher = context.matcher("user_1", None);
    let response = matcher
        .evaluate_all_feature_flags(
            &flag_list(vec![group_flag, continuity_flag, plain_flag]),
            None,
            None,
            None,
            true,
        )
        .await;

    assert!(response.errors_while_computing_flags);
    assert_eq!(response.values.len(), 1);
    assert_eq!(
        response.values.get("plain-flag"),
        Some(&FlagValue::Boolean(true))
    );
}

#[tokio::test]
async fn test_hash_key_override_changes_bucketing_identity() {
    let context = TestContext::new();
    let mut flag = create_boolean_flag(1, TEAM_ID, "continuity-flag", Some(50.0));
    flag.ensure_experience_continuity = true;

    let overrides = HashMap::from([("continuity-flag".to_string(), "anon_device_id".to_string())]);
    let mut matcher = context.matcher("identified_user", None);
    let response = matcher
        .evaluate_all_feature_flags(
            &flag_list(vec![flag.clone()]),
            None,
            None,
            Some(overrides),
            false,
        )
        .await;

    let expected = calculate_hash("continuity-flag.", "anon_device_id", "") <= 0.5;
    assert_eq!(
        response.values.get("continuity-flag"),
        Some(&FlagValue::Boolean(expected))
    );

    // Without the override the identity is the distinct id itself.
    let mut matcher = context.matcher("identified_user", None);
    let response = matcher
        .evaluate_all_feature_flags(&flag_list(vec![flag]), None, None, None, false)
        .await;
    let expected = calculate_hash("continuity-flag.", "identified_user", "") <= 0.5;
    assert_eq!(
        response.values.get("continuity-flag"),
        Some(&FlagValue::Boolean(expected))
    );
}

#[tokio::test]
async fn test_inactive_and_deleted_flags_are_not_evaluated() {
    let context = TestContext::new();
    let mut inactive = create_boolean_flag(1, TEAM_ID, "inactive", Some(100.0));
    inactive.active = false;
    let mut deleted = create_boolean_flag(2, TEAM_ID, "deleted", Some(100.0));
    deleted.deleted = true;
    let live = create_boolean_flag(3, TEAM_ID, "live", Some(100.0));

    let mut matcher = context.matcher("user_1", None);
    let response = matcher
        .evaluate_all_feature_flags(
            &flag_list(vec![inactive, deleted, live]),
            None,
            None,
            None,
            false,
        )
        .await;

    assert_eq!(response.values.len(), 1);
    assert!(response.values.contains_key("live"));
    assert!(!response.errors_while_computing_flags);
}

#[tokio::test]
async fn test_cohort_flag_expands_for_local_evaluation() {
    let cohort = Cohort {
        id: 7,
        name: None,
        team_id: TEAM_ID,
        deleted: false,
        filters: Some(json!({"properties": {"type": "AND", "values": [{"type": "property", "values": [
            {"key": "plan", "type": "person", "value": "pro", "operator": "exact"}
        ]}]}})),
    };
    let context = TestContext::with_cohorts(vec![cohort]);

    let flag = create_test_flag(
        1,
        TEAM_ID,
        "cohort-flag",
        FlagFilters {
            groups: vec![create_condition(
                vec![serde_json::from_value(
                    json!({"key": "id", "type": "cohort", "value": 7}),
                )
                .unwrap()],
                Some(100.0),
            )],
            ..Default::default()
        },
    );

    let overrides = HashMap::from([("plan".to_string(), json!("pro"))]);
    let mut matcher = context.matcher("user_1", None);
    let response = matcher
        .evaluate_all_feature_flags(&flag_list(vec![flag]), Some(overrides), None, None, false)
        .await;

    assert_eq!(
        response.values.get("cohort-flag"),
        Some(&FlagValue::Boolean(true))
    );
    // Expansion turned the cohort into plain person properties the overrides
    // cover, so the store is never consulted.
    assert_eq!(context.person_store.query_count(), 0);
}

#[tokio::test]
async fn test_cohort_flag_falls_back_to_store_without_overrides() {
    let cohort = Cohort {
        id: 7,
        name: None,
        team_id: TEAM_ID,
        deleted: false,
        filters: Some(json!({"properties": {"type": "AND", "values": [{"type": "property", "values": [
            {"key": "plan", "type": "person", "value": "pro", "operator": "exact"}
        ]}]}})),
    };
    let context = TestContext::with_cohorts(vec![cohort]);
    context.person_store.add_person(
        TEAM_ID,
        "pro_user",
        HashMap::from([("plan".to_string(), json!("pro"))]),
    );
    context
        .person_store
        .add_person(TEAM_ID, "free_user", HashMap::from([("plan".to_string(), json!("free"))]));

    let flag = create_test_flag(
        1,
        TEAM_ID,
        "cohort-flag",
        FlagFilters {
            groups: vec![create_condition(
                vec![serde_json::from_value(
                    json!({"key": "id", "type": "cohort", "value": 7}),
                )
                .unwrap()],
                Some(100.0),
            )],
            ..Default::default()
        },
    );

    for (distinct_id, expected) in [("pro_user", true), ("free_user", false)] {
        let mut matcher = context.matcher(distinct_id, None);
        let response = matcher
            .evaluate_all_feature_flags(&flag_list(vec![flag.clone()]), None, None, None, false)
            .await;
        assert_eq!(
            response.values.get("cohort-flag"),
            Some(&FlagValue::Boolean(expected)),
            "for {distinct_id}"
        );
    }
}

#[tokio::test]
async fn test_cohort_cycle_fails_only_that_flag() {
    let cyclic = |id: i32, other: i32| Cohort {
        id,
        name: None,
        team_id: TEAM_ID,
        deleted: false,
        filters: Some(json!({"properties": {"type": "AND", "values": [{"type": "property", "values": [
            {"key": "id", "type": "cohort", "value": other}
        ]}]}})),
    };
    let context = TestContext::with_cohorts(vec![cyclic(7, 8), cyclic(8, 7)]);

    let cyclic_flag = create_test_flag(
        1,
        TEAM_ID,
        "cyclic-flag",
        FlagFilters {
            groups: vec![create_condition(
                vec![serde_json::from_value(
                    json!({"key": "id", "type": "cohort", "value": 7}),
                )
                .unwrap()],
                Some(100.0),
            )],
            ..Default::default()
        },
    );
    let healthy_flag = create_boolean_flag(2, TEAM_ID, "healthy-flag", Some(100.0));

    let mut matcher = context.matcher("user_1", None);
    let response = matcher
        .evaluate_all_feature_flags(
            &flag_list(vec![cyclic_flag, healthy_flag]),
            None,
            None,
            None,
            false,
        )
        .await;

    assert!(response.errors_while_computing_flags);
    assert!(!response.values.contains_key("cyclic-flag"));
    assert_eq!(
        response.values.get("healthy-flag"),
        Some(&FlagValue::Boolean(true))
    );
}

#[tokio::test]
async fn test_distinct_id_is_always_a_person_property() {
    let context = TestContext::new();
    // No person row for this distinct id at all.
    let flag = create_test_flag(
        1,
        TEAM_ID,
        "distinct-id-flag",
        FlagFilters {
            groups: vec![create_condition(
                vec![create_person_filter("distinct_id", json!("special_user"), None)],
                Some(100.0),
            )],
            ..Default::default()
        },
    );

    let mut matcher = context.matcher("special_user", None);
    let response = matcher
        .evaluate_all_feature_flags(&flag_list(vec![flag.clone()]), None, None, None, false)
        .await;
    assert_eq!(
        response.values.get("distinct-id-flag"),
        Some(&FlagValue::Boolean(true))
    );

    let mut matcher = context.matcher("other_user", None);
    let response = matcher
        .evaluate_all_feature_flags(&flag_list(vec![flag]), None, None, None, false)
        .await;
    assert_eq!(
        response.values.get("distinct-id-flag"),
        Some(&FlagValue::Boolean(false))
    );
}
