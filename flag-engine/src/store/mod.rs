pub mod postgres;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::cohorts::cohort_models::{Cohort, CohortId};
use crate::error::{OverrideWriteError, StoreError};
use crate::flags::flag_group_type_mapping::GroupTypeIndex;
use crate::flags::flag_models::FeatureFlagList;
use crate::properties::property_matching::match_property;
use crate::properties::property_models::PropertyFilter;

pub type TeamId = i32;
pub type ProjectId = i64;
pub type PersonId = i64;

pub type PersonStoreRef = Arc<dyn PersonStore>;
pub type CohortStoreRef = Arc<dyn CohortStore>;
pub type OverrideStoreRef = Arc<dyn OverrideStore>;
pub type FlagRepositoryRef = Arc<dyn FlagRepository>;
pub type GroupTypeMappingProviderRef = Arc<dyn GroupTypeMappingProvider>;
pub type PayloadDecrypterRef = Arc<dyn PayloadDecrypter>;

/// The entity one batched condition query runs against: the person behind a
/// distinct id, or one group identified by type index and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityTarget {
    Person {
        team_id: TeamId,
        distinct_id: String,
    },
    Group {
        team_id: TeamId,
        group_type_index: GroupTypeIndex,
        group_key: String,
    },
}

/// Boolean combination of property filters, produced by condition planning
/// after cohort references have been resolved away.
#[derive(Debug, Clone)]
pub enum PropertyExpression {
    Match(PropertyFilter),
    And(Vec<PropertyExpression>),
    Or(Vec<PropertyExpression>),
    Not(Box<PropertyExpression>),
}

impl PropertyExpression {
    /// Reference semantics for expression evaluation against a property map.
    /// Store implementations must agree with this, whatever the backend.
    pub fn matches(&self, properties: &HashMap<String, Value>) -> bool {
        match self {
            PropertyExpression::Match(filter) => {
                match_property(filter, properties, false).unwrap_or(false)
            }
            PropertyExpression::And(parts) => parts.iter().all(|part| part.matches(properties)),
            PropertyExpression::Or(parts) => parts.iter().any(|part| part.matches(properties)),
            PropertyExpression::Not(part) => !part.matches(properties),
        }
    }
}

/// One condition from the evaluation batch, keyed so results can be routed
/// back to the owning flag and condition index.
#[derive(Debug, Clone)]
pub struct ConditionExpression {
    pub key: String,
    pub expression: PropertyExpression,
    /// All of the condition's own properties are is_not_set / is_not. A
    /// nonexistent entity satisfies such a condition trivially.
    pub all_negative: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConditionQueryResult {
    pub matches: HashMap<String, bool>,
    pub entity_exists: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OverrideRow {
    pub person_id: PersonId,
    pub distinct_id: String,
    pub feature_flag_key: String,
    pub hash_key: String,
}

/// Person/group store: evaluates a batch of condition expressions against one
/// entity in a single round-trip, reporting entity existence alongside.
#[async_trait]
pub trait PersonStore: Send + Sync {
    async fn query_conditions(
        &self,
        target: &EntityTarget,
        conditions: &[ConditionExpression],
    ) -> Result<ConditionQueryResult, StoreError>;
}

#[async_trait]
pub trait CohortStore: Send + Sync {
    async fn get_cohort(
        &self,
        project_id: ProjectId,
        cohort_id: CohortId,
    ) -> Result<Cohort, StoreError>;
}

#[async_trait]
pub trait FlagRepository: Send + Sync {
    async fn get_active_flags(&self, project_id: ProjectId) -> Result<FeatureFlagList, StoreError>;
}

#[async_trait]
pub trait GroupTypeMappingProvider: Send + Sync {
    async fn group_types_to_indexes(
        &self,
        project_id: ProjectId,
    ) -> Result<HashMap<String, GroupTypeIndex>, StoreError>;
}

/// Durable hash-key override store backing experience continuity.
///
/// `insert_overrides` is conditional and conflict-safe: it covers every
/// continuity flag of the team that lacks an override for the persons behind
/// the given distinct ids, as one atomic statement, ignoring conflicts so
/// concurrent writers race benignly (first write wins).
#[async_trait]
pub trait OverrideStore: Send + Sync {
    async fn insert_overrides(
        &self,
        team_id: TeamId,
        project_id: ProjectId,
        distinct_ids: &[String],
        hash_key: &str,
    ) -> Result<u64, OverrideWriteError>;

    async fn overrides_for_distinct_ids(
        &self,
        team_id: TeamId,
        distinct_ids: &[String],
    ) -> Result<Vec<OverrideRow>, StoreError>;

    async fn existing_override_flag_keys(
        &self,
        team_id: TeamId,
        distinct_ids: &[String],
    ) -> Result<HashSet<String>, StoreError>;

    async fn continuity_flag_keys(&self, project_id: ProjectId)
        -> Result<Vec<String>, StoreError>;
}

/// Decryption of encrypted flag payloads is provided from outside the engine.
pub trait PayloadDecrypter: Send + Sync {
    fn decrypt(&self, payload: &Value) -> Result<Value, StoreError>;
}
