use serde::{Deserialize, Serialize};

use crate::flags::flag_group_type_mapping::GroupTypeIndex;
use crate::properties::property_models::PropertyFilter;
use crate::store::TeamId;

pub type FeatureFlagId = i32;

/// One condition group: properties AND'ed together, with an optional rollout
/// percentage and variant override. Conditions on a flag are OR'ed.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct FlagPropertyGroup {
    #[serde(default)]
    pub properties: Option<Vec<PropertyFilter>>,
    #[serde(default)]
    pub rollout_percentage: Option<f64>,
    #[serde(default)]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultivariateFlagVariant {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    pub rollout_percentage: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultivariateFlagOptions {
    pub variants: Vec<MultivariateFlagVariant>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct FlagFilters {
    #[serde(default)]
    pub groups: Vec<FlagPropertyGroup>,
    #[serde(default)]
    pub multivariate: Option<MultivariateFlagOptions>,
    #[serde(default)]
    pub aggregation_group_type_index: Option<GroupTypeIndex>,
    #[serde(default)]
    pub payloads: Option<serde_json::Value>,
    #[serde(default)]
    pub super_groups: Option<Vec<FlagPropertyGroup>>,
    #[serde(default)]
    pub holdout_groups: Option<Vec<FlagPropertyGroup>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeatureFlag {
    pub id: FeatureFlagId,
    pub team_id: TeamId,
    #[serde(default)]
    pub name: Option<String>,
    pub key: String,
    pub filters: FlagFilters,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub ensure_experience_continuity: bool,
    #[serde(default)]
    pub has_encrypted_payloads: bool,
}

impl FeatureFlag {
    pub fn get_group_type_index(&self) -> Option<GroupTypeIndex> {
        self.filters.aggregation_group_type_index
    }

    pub fn get_conditions(&self) -> &Vec<FlagPropertyGroup> {
        &self.filters.groups
    }

    pub fn get_variants(&self) -> Vec<MultivariateFlagVariant> {
        self.filters
            .multivariate
            .as_ref()
            .map(|options| options.variants.clone())
            .unwrap_or_default()
    }

    /// Payload for a match value: the variant key, or "true" for a plain
    /// boolean match.
    pub fn get_payload(&self, match_value: &str) -> Option<serde_json::Value> {
        self.filters
            .payloads
            .as_ref()
            .and_then(|payloads| payloads.get(match_value))
            .cloned()
    }
}

/// The value a flag resolves to for a subject: a variant key for matched
/// multivariate flags, a boolean otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FlagValue {
    Boolean(bool),
    String(String),
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FeatureFlagList {
    pub flags: Vec<FeatureFlag>,
}

impl FeatureFlagList {
    pub fn new(flags: Vec<FeatureFlag>) -> Self {
        Self { flags }
    }
}
