use thiserror::Error;

use crate::cohorts::cohort_models::CohortId;

/// Errors surfaced by the store collaborators (person/group store, cohort
/// store, flag repository, override store).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,
    #[error("timed out while querying the store")]
    Timeout,
    #[error("row not found")]
    NotFound,
    #[error("store query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::PoolTimedOut => StoreError::Timeout,
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) => StoreError::Unavailable,
            other => {
                // Statement timeouts arrive as a database error with the
                // query_canceled SQLSTATE rather than an io error.
                if is_statement_timeout(&other) {
                    StoreError::Timeout
                } else {
                    StoreError::Query(other.to_string())
                }
            }
        }
    }
}

fn is_statement_timeout(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| code == "57014")
}

/// Outcome of a single hash-key override write attempt. The write path only
/// retries `PersonDeleted`; everything else is fatal for the write phase.
#[derive(Error, Debug)]
pub enum OverrideWriteError {
    /// Foreign-key violation caused by a person deleted or merged away while
    /// the insert was in flight.
    #[error("person deleted while writing hash key override")]
    PersonDeleted,
    #[error(transparent)]
    Fatal(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum FlagError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("timed out while fetching data")]
    Timeout,
    /// The batched condition query failed. Remembered for the rest of the
    /// evaluation call so later conditions short-circuit instead of
    /// re-querying.
    #[error("condition results unavailable")]
    ConditionsUnavailable,
    /// Fetching the group-type mapping failed; remembered the same way.
    #[error("group type mapping unavailable")]
    GroupMappingUnavailable,
    #[error("cohort {0} not found")]
    CohortNotFound(CohortId),
    #[error("failed to parse cohort filters")]
    CohortFiltersParsingError,
    #[error("cohort dependency cycle starting at cohort {0}")]
    CohortDependencyCycle(CohortId),
    #[error("invalid flag definition: {0}")]
    InvalidFlagDefinition(String),
    #[error("failed to write hash key overrides: {0}")]
    OverrideWrite(#[from] OverrideWriteError),
}

impl FlagError {
    /// Short stable label for metrics; mirrors the variant names rather than
    /// the human-readable messages.
    pub fn error_code(&self) -> &'static str {
        match self {
            FlagError::Internal(_) => "internal_error",
            FlagError::StoreUnavailable => "store_unavailable",
            FlagError::Timeout => "timeout",
            FlagError::ConditionsUnavailable => "conditions_unavailable",
            FlagError::GroupMappingUnavailable => "group_mapping_unavailable",
            FlagError::CohortNotFound(_) => "cohort_not_found",
            FlagError::CohortFiltersParsingError => "cohort_filters_parsing_error",
            FlagError::CohortDependencyCycle(_) => "cohort_dependency_cycle",
            FlagError::InvalidFlagDefinition(_) => "invalid_flag_definition",
            FlagError::OverrideWrite(_) => "override_write_failed",
        }
    }
}

impl From<StoreError> for FlagError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable => FlagError::StoreUnavailable,
            StoreError::Timeout => FlagError::Timeout,
            StoreError::NotFound | StoreError::Query(_) => FlagError::Internal(e.to_string()),
        }
    }
}
