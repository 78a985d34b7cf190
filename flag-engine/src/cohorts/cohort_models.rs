use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::FlagError;
use crate::properties::property_models::PropertyFilter;
use crate::store::TeamId;

pub type CohortId = i32;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Cohort {
    pub id: CohortId,
    pub name: Option<String>,
    pub team_id: TeamId,
    #[serde(default)]
    pub deleted: bool,
    /// Raw property tree as stored; parsed on demand so one malformed cohort
    /// only fails the flags that reference it.
    pub filters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CohortPropertyType {
    AND,
    OR,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CohortProperty {
    pub properties: InnerCohortProperty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InnerCohortProperty {
    #[serde(rename = "type")]
    pub prop_type: CohortPropertyType,
    pub values: Vec<CohortValues>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CohortValues {
    #[serde(rename = "type")]
    pub prop_type: String,
    pub values: Vec<PropertyFilter>,
}

impl Cohort {
    /// Parses the stored filters JSON into the AND/OR property tree.
    pub fn parse_filters(&self) -> Result<Option<CohortProperty>, FlagError> {
        let filters = match &self.filters {
            Some(filters) => filters,
            None => return Ok(None),
        };

        let cohort_property: CohortProperty =
            serde_json::from_value(filters.clone()).map_err(|e| {
                tracing::error!("Failed to parse filters for cohort {}: {}", self.id, e);
                FlagError::CohortFiltersParsingError
            })?;
        Ok(Some(cohort_property))
    }

    /// Extracts the cohort ids this cohort's filters reference.
    pub fn extract_dependencies(&self) -> Result<HashSet<CohortId>, FlagError> {
        let mut dependencies = HashSet::new();
        let Some(cohort_property) = self.parse_filters()? else {
            return Ok(dependencies);
        };

        for group in &cohort_property.properties.values {
            for filter in &group.values {
                if filter.is_cohort() {
                    let cohort_id = filter
                        .get_cohort_id()
                        .ok_or(FlagError::CohortFiltersParsingError)?;
                    dependencies.insert(cohort_id);
                }
            }
        }
        Ok(dependencies)
    }
}
