use std::collections::HashMap;

use crate::error::FlagError;
use crate::metrics_consts::FLAG_EVALUATION_ERROR_COUNTER;
use crate::store::{GroupTypeMappingProviderRef, ProjectId};

pub type GroupTypeIndex = i32;

/// Per-call cache of the project's group-type mapping, in both directions.
///
/// Fetched once per evaluation call, and only when the batch contains
/// group-aggregated flags. A failed fetch is remembered so later lookups in
/// the same call short-circuit instead of re-querying; an absent mapping for
/// a specific index is not an error (the flag resolves to `no_group_type`).
#[derive(Clone, Default)]
pub struct GroupTypeMappingCache {
    group_types_to_indexes: HashMap<String, GroupTypeIndex>,
    group_indexes_to_types: HashMap<GroupTypeIndex, String>,
    failed_to_fetch: bool,
}

impl GroupTypeMappingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn init(
        &mut self,
        provider: &GroupTypeMappingProviderRef,
        project_id: ProjectId,
    ) -> Result<(), FlagError> {
        match provider.group_types_to_indexes(project_id).await {
            Ok(mapping) => {
                self.group_indexes_to_types =
                    mapping.iter().map(|(k, v)| (*v, k.clone())).collect();
                self.group_types_to_indexes = mapping;
                Ok(())
            }
            Err(e) => {
                self.failed_to_fetch = true;
                metrics::counter!(
                    FLAG_EVALUATION_ERROR_COUNTER,
                    "reason" => "group_mapping_unavailable"
                )
                .increment(1);
                tracing::error!(
                    project_id = project_id,
                    error = %e,
                    "Failed to fetch group type mappings"
                );
                Err(FlagError::GroupMappingUnavailable)
            }
        }
    }

    pub fn group_types_to_indexes(
        &self,
    ) -> Result<&HashMap<String, GroupTypeIndex>, FlagError> {
        if self.failed_to_fetch {
            return Err(FlagError::GroupMappingUnavailable);
        }
        Ok(&self.group_types_to_indexes)
    }

    pub fn group_type_index_to_type_map(
        &self,
    ) -> Result<&HashMap<GroupTypeIndex, String>, FlagError> {
        if self.failed_to_fetch {
            return Err(FlagError::GroupMappingUnavailable);
        }
        Ok(&self.group_indexes_to_types)
    }

    #[cfg(test)]
    pub fn set_test_mappings(&mut self, types_to_indexes: HashMap<String, GroupTypeIndex>) {
        self.group_indexes_to_types = types_to_indexes
            .iter()
            .map(|(k, v)| (*v, k.clone()))
            .collect();
        self.group_types_to_indexes = types_to_indexes;
    }
}
