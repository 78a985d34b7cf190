use serde::{Deserialize, Serialize};

use crate::cohorts::cohort_models::CohortId;
use crate::flags::flag_group_type_mapping::GroupTypeIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorType {
    Exact,
    IsNot,
    Icontains,
    NotIcontains,
    Regex,
    NotRegex,
    Gt,
    Lt,
    Gte,
    Lte,
    IsSet,
    IsNotSet,
    IsDateExact,
    IsDateAfter,
    IsDateBefore,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Person,
    Group,
    Cohort,
    Event,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PropertyFilter {
    pub key: String,
    // Not guaranteed to be present for operators like is_set / is_not_set
    // when the filter was authored through the external API.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub operator: Option<OperatorType>,
    #[serde(rename = "type")]
    pub prop_type: PropertyType,
    #[serde(default)]
    pub negation: Option<bool>,
    #[serde(default)]
    pub group_type_index: Option<GroupTypeIndex>,
}

impl PropertyFilter {
    pub fn is_cohort(&self) -> bool {
        self.prop_type == PropertyType::Cohort
    }

    /// Cohort filters carry the referenced cohort id in `value`.
    pub fn get_cohort_id(&self) -> Option<CohortId> {
        self.value
            .as_ref()
            .and_then(|value| value.as_i64())
            .map(|id| id as CohortId)
    }

    /// True when the filter only matches in the absence of something: an
    /// explicit negation flag or a negative operator.
    pub fn is_negated(&self) -> bool {
        self.negation.unwrap_or(false)
            || matches!(
                self.operator,
                Some(
                    OperatorType::IsNot
                        | OperatorType::IsNotSet
                        | OperatorType::NotIcontains
                        | OperatorType::NotRegex
                        | OperatorType::NotIn
                )
            )
    }
}
