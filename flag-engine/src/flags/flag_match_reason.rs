use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureFlagMatchReason {
    SuperConditionValue,
    HoldoutConditionValue,
    ConditionMatch,
    NoGroupType,
    OutOfRolloutBound,
    NoConditionMatch,
}

impl FeatureFlagMatchReason {
    /// Priority used when no condition matched: the highest-scoring reason
    /// encountered across all evaluated conditions is reported.
    pub fn score(&self) -> i32 {
        match self {
            FeatureFlagMatchReason::SuperConditionValue => 5,
            FeatureFlagMatchReason::HoldoutConditionValue => 4,
            FeatureFlagMatchReason::ConditionMatch => 3,
            FeatureFlagMatchReason::NoGroupType => 2,
            FeatureFlagMatchReason::OutOfRolloutBound => 1,
            FeatureFlagMatchReason::NoConditionMatch => 0,
        }
    }
}

impl PartialOrd for FeatureFlagMatchReason {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FeatureFlagMatchReason {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score().cmp(&other.score())
    }
}

impl std::fmt::Display for FeatureFlagMatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                FeatureFlagMatchReason::SuperConditionValue => "super_condition_value",
                FeatureFlagMatchReason::HoldoutConditionValue => "holdout_condition_value",
                FeatureFlagMatchReason::ConditionMatch => "condition_match",
                FeatureFlagMatchReason::NoGroupType => "no_group_type",
                FeatureFlagMatchReason::OutOfRolloutBound => "out_of_rollout_bound",
                FeatureFlagMatchReason::NoConditionMatch => "no_condition_match",
            }
        )
    }
}
