use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::error::FlagError;
use crate::flags::flag_models::FeatureFlagList;
use crate::metrics_consts::{
    FLAG_DEFINITION_CACHE_HIT_COUNTER, FLAG_DEFINITION_CACHE_MISS_COUNTER,
};
use crate::store::{FlagRepositoryRef, ProjectId};

/// TTL cache over the flag repository, keyed by project id.
///
/// Definitions stay cached until the TTL elapses or `invalidate` is called
/// from the external write path whenever a flag is saved or deleted. Callers
/// must tolerate snapshots up to one TTL stale.
pub struct FlagDefinitionCache {
    repository: FlagRepositoryRef,
    cache: Cache<ProjectId, Arc<FeatureFlagList>>,
}

impl FlagDefinitionCache {
    pub fn new(repository: FlagRepositoryRef, ttl: Duration, capacity: u64) -> Self {
        FlagDefinitionCache {
            repository,
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn get_active_flags(
        &self,
        project_id: ProjectId,
    ) -> Result<Arc<FeatureFlagList>, FlagError> {
        if let Some(flags) = self.cache.get(&project_id).await {
            metrics::counter!(FLAG_DEFINITION_CACHE_HIT_COUNTER).increment(1);
            return Ok(flags);
        }

        metrics::counter!(FLAG_DEFINITION_CACHE_MISS_COUNTER).increment(1);
        let flags = Arc::new(self.repository.get_active_flags(project_id).await?);
        self.cache.insert(project_id, flags.clone()).await;
        Ok(flags)
    }

    /// Called from the external authoring path when a flag changes.
    pub async fn invalidate(&self, project_id: ProjectId) {
        self.cache.invalidate(&project_id).await;
    }
}
