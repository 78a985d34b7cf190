use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::cohorts::cohort_models::{Cohort, CohortId};
use crate::error::{OverrideWriteError, StoreError};
use crate::flags::flag_group_type_mapping::GroupTypeIndex;
use crate::flags::flag_models::{
    FeatureFlag, FeatureFlagList, FlagFilters, FlagPropertyGroup, MultivariateFlagOptions,
    MultivariateFlagVariant,
};
use crate::properties::property_models::{OperatorType, PropertyFilter, PropertyType};
use crate::store::{
    CohortStore, ConditionExpression, ConditionQueryResult, EntityTarget, FlagRepository,
    GroupTypeMappingProvider, OverrideRow, OverrideStore, PayloadDecrypter, PersonId, PersonStore,
    ProjectId, TeamId,
};

pub fn create_person_filter(
    key: &str,
    value: Value,
    operator: Option<OperatorType>,
) -> PropertyFilter {
    PropertyFilter {
        key: key.to_string(),
        value: Some(value),
        operator,
        prop_type: PropertyType::Person,
        negation: None,
        group_type_index: None,
    }
}

pub fn create_group_filter(
    key: &str,
    value: Value,
    group_type_index: GroupTypeIndex,
) -> PropertyFilter {
    PropertyFilter {
        key: key.to_string(),
        value: Some(value),
        operator: Some(OperatorType::Exact),
        prop_type: PropertyType::Group,
        negation: None,
        group_type_index: Some(group_type_index),
    }
}

pub fn create_condition(
    properties: Vec<PropertyFilter>,
    rollout_percentage: Option<f64>,
) -> FlagPropertyGroup {
    FlagPropertyGroup {
        properties: Some(properties),
        rollout_percentage,
        variant: None,
    }
}

pub fn create_multivariate(variants: &[(&str, f64)]) -> MultivariateFlagOptions {
    MultivariateFlagOptions {
        variants: variants
            .iter()
            .map(|(key, rollout_percentage)| MultivariateFlagVariant {
                key: key.to_string(),
                name: None,
                rollout_percentage: *rollout_percentage,
            })
            .collect(),
    }
}

pub fn create_test_flag(
    id: i32,
    team_id: TeamId,
    key: &str,
    filters: FlagFilters,
) -> FeatureFlag {
    FeatureFlag {
        id,
        team_id,
        name: Some(format!("{key} flag")),
        key: key.to_string(),
        filters,
        deleted: false,
        active: true,
        ensure_experience_continuity: false,
        has_encrypted_payloads: false,
    }
}

/// Boolean flag with one property-less condition at the given rollout.
pub fn create_boolean_flag(
    id: i32,
    team_id: TeamId,
    key: &str,
    rollout_percentage: Option<f64>,
) -> FeatureFlag {
    create_test_flag(
        id,
        team_id,
        key,
        FlagFilters {
            groups: vec![create_condition(vec![], rollout_percentage)],
            ..Default::default()
        },
    )
}

/// In-memory person/group store evaluating condition expressions with the
/// reference semantics from `PropertyExpression::matches`. Tracks round-trips
/// so tests can assert the batching discipline, and can be told to fail.
#[derive(Default)]
pub struct MemoryPersonStore {
    persons: RwLock<HashMap<(TeamId, String), HashMap<String, Value>>>,
    groups: RwLock<HashMap<(TeamId, GroupTypeIndex, String), HashMap<String, Value>>>,
    fail_queries: AtomicBool,
    query_count: AtomicUsize,
}

impl MemoryPersonStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_person(&self, team_id: TeamId, distinct_id: &str, properties: HashMap<String, Value>) {
        self.persons
            .write()
            .expect("persons lock poisoned")
            .insert((team_id, distinct_id.to_string()), properties);
    }

    pub fn add_group(
        &self,
        team_id: TeamId,
        group_type_index: GroupTypeIndex,
        group_key: &str,
        properties: HashMap<String, Value>,
    ) {
        self.groups
            .write()
            .expect("groups lock poisoned")
            .insert((team_id, group_type_index, group_key.to_string()), properties);
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_queries.store(failing, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersonStore for MemoryPersonStore {
    async fn query_conditions(
        &self,
        target: &EntityTarget,
        conditions: &[ConditionExpression],
    ) -> Result<ConditionQueryResult, StoreError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout);
        }

        let (entity_exists, mut properties) = match target {
            EntityTarget::Person {
                team_id,
                distinct_id,
            } => {
                let persons = self.persons.read().expect("persons lock poisoned");
                match persons.get(&(*team_id, distinct_id.clone())) {
                    Some(properties) => (true, properties.clone()),
                    None => (false, HashMap::new()),
                }
            }
            EntityTarget::Group {
                team_id,
                group_type_index,
                group_key,
            } => {
                let groups = self.groups.read().expect("groups lock poisoned");
                match groups.get(&(*team_id, *group_type_index, group_key.clone())) {
                    Some(properties) => (true, properties.clone()),
                    None => (false, HashMap::new()),
                }
            }
        };

        if let EntityTarget::Person { distinct_id, .. } = target {
            properties
                .entry("distinct_id".to_string())
                .or_insert_with(|| Value::String(distinct_id.clone()));
        }

        let matches = conditions
            .iter()
            .map(|condition| (condition.key.clone(), condition.expression.matches(&properties)))
            .collect();

        Ok(ConditionQueryResult {
            matches,
            entity_exists,
        })
    }
}

#[derive(Default)]
pub struct MemoryCohortStore {
    cohorts: HashMap<CohortId, Cohort>,
}

impl MemoryCohortStore {
    pub fn new(cohorts: Vec<Cohort>) -> Self {
        MemoryCohortStore {
            cohorts: cohorts.into_iter().map(|cohort| (cohort.id, cohort)).collect(),
        }
    }
}

#[async_trait]
impl CohortStore for MemoryCohortStore {
    async fn get_cohort(
        &self,
        _project_id: ProjectId,
        cohort_id: CohortId,
    ) -> Result<Cohort, StoreError> {
        self.cohorts
            .get(&cohort_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[derive(Default)]
pub struct MemoryFlagRepository {
    flags: RwLock<HashMap<ProjectId, Vec<FeatureFlag>>>,
    fetch_count: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryFlagRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let repository = Self::default();
        repository.failing.store(true, Ordering::SeqCst);
        repository
    }

    pub fn set_flags(&self, project_id: ProjectId, flags: Vec<FeatureFlag>) {
        self.flags
            .write()
            .expect("flags lock poisoned")
            .insert(project_id, flags);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlagRepository for MemoryFlagRepository {
    async fn get_active_flags(&self, project_id: ProjectId) -> Result<FeatureFlagList, StoreError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        let flags = self
            .flags
            .read()
            .expect("flags lock poisoned")
            .get(&project_id)
            .cloned()
            .unwrap_or_default();
        Ok(FeatureFlagList::new(flags))
    }
}

#[derive(Default)]
pub struct MemoryGroupTypeMappings {
    mappings: HashMap<String, GroupTypeIndex>,
    failing: bool,
}

impl MemoryGroupTypeMappings {
    pub fn new(mappings: HashMap<String, GroupTypeIndex>) -> Self {
        MemoryGroupTypeMappings {
            mappings,
            failing: false,
        }
    }

    /// Standard organization/project mapping most tests want.
    pub fn standard() -> Self {
        Self::new(HashMap::from([
            ("organization".to_string(), 0),
            ("project".to_string(), 1),
        ]))
    }

    pub fn failing() -> Self {
        MemoryGroupTypeMappings {
            mappings: HashMap::new(),
            failing: true,
        }
    }
}

#[async_trait]
impl GroupTypeMappingProvider for MemoryGroupTypeMappings {
    async fn group_types_to_indexes(
        &self,
        _project_id: ProjectId,
    ) -> Result<HashMap<String, GroupTypeIndex>, StoreError> {
        if self.failing {
            return Err(StoreError::Unavailable);
        }
        Ok(self.mappings.clone())
    }
}

/// In-memory override store with first-write-wins semantics and injectable
/// write failures for exercising the retry path.
#[derive(Default)]
pub struct MemoryOverrideStore {
    persons: RwLock<HashMap<(TeamId, String), PersonId>>,
    continuity_flags: RwLock<HashMap<ProjectId, Vec<String>>>,
    overrides: RwLock<HashMap<(TeamId, PersonId, String), String>>,
    fail_queue: Mutex<Vec<OverrideWriteError>>,
    fail_reads: AtomicBool,
    insert_attempts: AtomicUsize,
}

impl MemoryOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_person(&self, team_id: TeamId, distinct_id: &str, person_id: PersonId) {
        self.persons
            .write()
            .expect("persons lock poisoned")
            .insert((team_id, distinct_id.to_string()), person_id);
    }

    pub fn set_continuity_flags(&self, project_id: ProjectId, flag_keys: Vec<String>) {
        self.continuity_flags
            .write()
            .expect("flags lock poisoned")
            .insert(project_id, flag_keys);
    }

    /// Direct insert, bypassing the conditional write; for test setup.
    pub fn insert_override(
        &self,
        team_id: TeamId,
        person_id: PersonId,
        flag_key: &str,
        hash_key: &str,
    ) {
        self.overrides
            .write()
            .expect("overrides lock poisoned")
            .entry((team_id, person_id, flag_key.to_string()))
            .or_insert_with(|| hash_key.to_string());
    }

    /// Queue errors returned by the next `insert_overrides` calls, in order.
    pub fn fail_next_inserts(&self, errors: Vec<OverrideWriteError>) {
        let mut queue = self.fail_queue.lock().expect("fail queue poisoned");
        *queue = errors;
        queue.reverse();
    }

    pub fn set_fail_reads(&self, failing: bool) {
        self.fail_reads.store(failing, Ordering::SeqCst);
    }

    pub fn insert_attempts(&self) -> usize {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    pub fn override_count(&self) -> usize {
        self.overrides.read().expect("overrides lock poisoned").len()
    }

    fn person_ids(&self, team_id: TeamId, distinct_ids: &[String]) -> Vec<(String, PersonId)> {
        let persons = self.persons.read().expect("persons lock poisoned");
        distinct_ids
            .iter()
            .filter_map(|distinct_id| {
                persons
                    .get(&(team_id, distinct_id.clone()))
                    .map(|person_id| (distinct_id.clone(), *person_id))
            })
            .collect()
    }
}

#[async_trait]
impl OverrideStore for MemoryOverrideStore {
    async fn insert_overrides(
        &self,
        team_id: TeamId,
        project_id: ProjectId,
        distinct_ids: &[String],
        hash_key: &str,
    ) -> Result<u64, OverrideWriteError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self
            .fail_queue
            .lock()
            .expect("fail queue poisoned")
            .pop()
        {
            return Err(error);
        }

        let flag_keys = self
            .continuity_flags
            .read()
            .expect("flags lock poisoned")
            .get(&project_id)
            .cloned()
            .unwrap_or_default();

        let mut written: u64 = 0;
        let mut overrides = self.overrides.write().expect("overrides lock poisoned");
        for (_, person_id) in self.person_ids(team_id, distinct_ids) {
            for flag_key in &flag_keys {
                if let std::collections::hash_map::Entry::Vacant(entry) =
                    overrides.entry((team_id, person_id, flag_key.clone()))
                {
                    entry.insert(hash_key.to_string());
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn overrides_for_distinct_ids(
        &self,
        team_id: TeamId,
        distinct_ids: &[String],
    ) -> Result<Vec<OverrideRow>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout);
        }
        let overrides = self.overrides.read().expect("overrides lock poisoned");
        let mut rows = Vec::new();
        for (distinct_id, person_id) in self.person_ids(team_id, distinct_ids) {
            for ((override_team, override_person, flag_key), hash_key) in overrides.iter() {
                if *override_team == team_id && *override_person == person_id {
                    rows.push(OverrideRow {
                        person_id,
                        distinct_id: distinct_id.clone(),
                        feature_flag_key: flag_key.clone(),
                        hash_key: hash_key.clone(),
                    });
                }
            }
        }
        Ok(rows)
    }

    async fn existing_override_flag_keys(
        &self,
        team_id: TeamId,
        distinct_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let rows = self
            .overrides_for_distinct_ids(team_id, distinct_ids)
            .await?;
        Ok(rows.into_iter().map(|row| row.feature_flag_key).collect())
    }

    async fn continuity_flag_keys(
        &self,
        project_id: ProjectId,
    ) -> Result<Vec<String>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout);
        }
        Ok(self
            .continuity_flags
            .read()
            .expect("flags lock poisoned")
            .get(&project_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Install a fmt subscriber honoring RUST_LOG; safe to call from every test.
pub fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// Marks payloads as decrypted so tests can observe the decryption hop.
pub struct TestPayloadDecrypter;

impl PayloadDecrypter for TestPayloadDecrypter {
    fn decrypt(&self, payload: &Value) -> Result<Value, StoreError> {
        Ok(serde_json::json!({ "decrypted": payload }))
    }
}
