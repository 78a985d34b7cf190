use std::collections::HashMap;

use serde_json::Value;

use crate::cohorts::cohort_resolution::CohortResolver;
use crate::error::FlagError;
use crate::properties::property_matching::match_property;
use crate::properties::property_models::{OperatorType, PropertyFilter};
use crate::store::{ConditionExpression, PropertyExpression};

/// Which part of a flag a planned condition result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Condition,
    Super,
    /// The "is the super-condition marker set at all" probe.
    SuperCheck,
}

impl ConditionKind {
    fn as_str(&self) -> &'static str {
        match self {
            ConditionKind::Condition => "condition",
            ConditionKind::Super => "super",
            ConditionKind::SuperCheck => "super_check",
        }
    }
}

/// Stable key routing a batched store result back to its flag and condition.
pub fn condition_key(flag_key: &str, kind: ConditionKind, index: usize) -> String {
    format!("{flag_key}:{}:{index}", kind.as_str())
}

/// All properties must match; a property that errors (missing, inconclusive)
/// counts as a non-match.
pub fn all_properties_match(
    flag_condition_properties: &[PropertyFilter],
    matching_property_values: &HashMap<String, Value>,
) -> bool {
    flag_condition_properties
        .iter()
        .all(|property| match_property(property, matching_property_values, false).unwrap_or(false))
}

/// The overrides usable for local evaluation of a condition: present, covering
/// every property key, with no cohort filter forcing a store lookup.
pub fn locally_computable_property_overrides(
    property_overrides: Option<&HashMap<String, Value>>,
    property_filters: &[PropertyFilter],
) -> Option<HashMap<String, Value>> {
    let overrides = property_overrides?;

    if property_filters.iter().any(|filter| filter.is_cohort()) {
        return None;
    }

    if property_filters
        .iter()
        .all(|filter| overrides.contains_key(&filter.key))
    {
        Some(overrides.clone())
    } else {
        None
    }
}

/// A condition whose properties are all is_not_set / is_not holds trivially
/// for an entity that does not exist in the store.
pub fn is_all_negative(property_filters: &[PropertyFilter]) -> bool {
    !property_filters.is_empty()
        && property_filters.iter().all(|filter| {
            matches!(
                filter.operator,
                Some(OperatorType::IsNotSet | OperatorType::IsNot)
            )
        })
}

/// AND of a condition's properties, with cohort references resolved into
/// their own property expressions through the store-backed resolver.
pub async fn build_property_expression(
    properties: &[PropertyFilter],
    resolver: &mut CohortResolver,
) -> Result<PropertyExpression, FlagError> {
    let mut parts = Vec::with_capacity(properties.len());
    for filter in properties {
        if filter.is_cohort() {
            let cohort_id = filter
                .get_cohort_id()
                .ok_or(FlagError::CohortFiltersParsingError)?;
            let expression = resolver.property_expression(cohort_id).await?;
            if matches!(filter.operator, Some(OperatorType::NotIn)) {
                parts.push(PropertyExpression::Not(Box::new(expression)));
            } else {
                parts.push(expression);
            }
        } else {
            parts.push(PropertyExpression::Match(filter.clone()));
        }
    }
    Ok(PropertyExpression::And(parts))
}

/// Expression probing whether the super-condition marker properties exist at
/// all, regardless of their value.
pub fn is_set_expression(properties: &[PropertyFilter]) -> PropertyExpression {
    PropertyExpression::And(
        properties
            .iter()
            .map(|filter| {
                PropertyExpression::Match(PropertyFilter {
                    key: filter.key.clone(),
                    value: None,
                    operator: Some(OperatorType::IsSet),
                    prop_type: filter.prop_type,
                    negation: None,
                    group_type_index: filter.group_type_index,
                })
            })
            .collect(),
    )
}

/// Planned store-side evaluation of one condition.
pub fn plan_condition(
    flag_key: &str,
    kind: ConditionKind,
    index: usize,
    expression: PropertyExpression,
    properties: &[PropertyFilter],
) -> ConditionExpression {
    ConditionExpression {
        key: condition_key(flag_key, kind, index),
        expression,
        all_negative: is_all_negative(properties),
    }
}
