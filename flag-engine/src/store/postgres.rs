use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::warn;

use crate::cohorts::cohort_models::{Cohort, CohortId};
use crate::config::Config;
use crate::error::{FlagError, OverrideWriteError, StoreError};
use crate::metrics_consts::FLAG_EVALUATION_ERROR_COUNTER;
use crate::flags::flag_group_type_mapping::GroupTypeIndex;
use crate::flags::flag_models::{FeatureFlag, FeatureFlagList, FlagFilters};
use crate::properties::property_models::{OperatorType, PropertyFilter};
use crate::store::{
    CohortStore, ConditionExpression, ConditionQueryResult, EntityTarget, FlagRepository,
    GroupTypeMappingProvider, OverrideRow, OverrideStore, PersonStore, ProjectId,
    PropertyExpression, TeamId,
};

/// Postgres-backed implementation of the store collaborators.
///
/// Every query is bounded by the configured statement timeout: client-side
/// via `tokio::time::timeout`, and server-side with `SET LOCAL
/// statement_timeout` on the override write transaction.
pub struct PostgresStore {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PostgresStore {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        PostgresStore {
            pool,
            statement_timeout,
        }
    }

    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .acquire_timeout(config.statement_timeout())
            .connect(&config.database_url)
            .await?;
        Ok(PostgresStore::new(pool, config.statement_timeout()))
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.statement_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

#[async_trait]
impl PersonStore for PostgresStore {
    /// One round-trip per entity: the entity row is looked up once via a
    /// lateral join and every condition expression is computed as its own
    /// boolean column against the entity's properties.
    async fn query_conditions(
        &self,
        target: &EntityTarget,
        conditions: &[ConditionExpression],
    ) -> Result<ConditionQueryResult, StoreError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");

        let properties_column = match target {
            EntityTarget::Person { .. } => {
                builder.push("(entity.id IS NOT NULL) AS entity_exists");
                "entity.properties"
            }
            EntityTarget::Group { .. } => {
                builder.push("(entity.group_key IS NOT NULL) AS entity_exists");
                "entity.group_properties"
            }
        };

        for (index, condition) in conditions.iter().enumerate() {
            builder.push(", COALESCE(");
            push_expression(&mut builder, &condition.expression, properties_column);
            builder.push(format!(", FALSE) AS cond_{index}"));
        }

        builder.push(" FROM (SELECT 1) AS one LEFT JOIN LATERAL (");
        match target {
            EntityTarget::Person {
                team_id,
                distinct_id,
            } => {
                // distinct_id is always visible as a person property, even
                // when the person row has none.
                builder.push(
                    "SELECT p.id, \
                            (COALESCE(p.properties, '{}'::jsonb) \
                             || jsonb_build_object('distinct_id', pd.distinct_id)) AS properties \
                     FROM person_distinct_ids pd \
                     JOIN persons p ON p.id = pd.person_id AND p.team_id = pd.team_id \
                     WHERE pd.team_id = ",
                );
                builder.push_bind(*team_id);
                builder.push(" AND pd.distinct_id = ");
                builder.push_bind(distinct_id.clone());
                builder.push(" LIMIT 1");
            }
            EntityTarget::Group {
                team_id,
                group_type_index,
                group_key,
            } => {
                builder.push(
                    "SELECT g.group_key, g.group_properties \
                     FROM entity_groups g \
                     WHERE g.team_id = ",
                );
                builder.push_bind(*team_id);
                builder.push(" AND g.group_type_index = ");
                builder.push_bind(*group_type_index);
                builder.push(" AND g.group_key = ");
                builder.push_bind(group_key.clone());
                builder.push(" LIMIT 1");
            }
        }
        builder.push(") AS entity ON TRUE");

        let query = builder.build();
        let row = self.bounded(query.fetch_one(&self.pool)).await?;

        let entity_exists: bool = row.try_get("entity_exists").map_err(StoreError::from)?;
        let mut matches = HashMap::with_capacity(conditions.len());
        for (index, condition) in conditions.iter().enumerate() {
            let value: bool = row
                .try_get(format!("cond_{index}").as_str())
                .map_err(StoreError::from)?;
            matches.insert(condition.key.clone(), value);
        }

        Ok(ConditionQueryResult {
            matches,
            entity_exists,
        })
    }
}

#[async_trait]
impl CohortStore for PostgresStore {
    async fn get_cohort(
        &self,
        project_id: ProjectId,
        cohort_id: CohortId,
    ) -> Result<Cohort, StoreError> {
        let cohort = self
            .bounded(
                sqlx::query_as::<_, Cohort>(
                    "SELECT id, name, team_id, deleted, filters \
                     FROM cohorts \
                     WHERE project_id = $1 AND id = $2 AND deleted = FALSE",
                )
                .bind(project_id)
                .bind(cohort_id)
                .fetch_optional(&self.pool),
            )
            .await?;
        cohort.ok_or(StoreError::NotFound)
    }
}

#[derive(sqlx::FromRow)]
struct FeatureFlagRow {
    id: i32,
    team_id: TeamId,
    name: Option<String>,
    key: String,
    filters: serde_json::Value,
    deleted: bool,
    active: bool,
    ensure_experience_continuity: bool,
    has_encrypted_payloads: bool,
}

#[async_trait]
impl FlagRepository for PostgresStore {
    async fn get_active_flags(&self, project_id: ProjectId) -> Result<FeatureFlagList, StoreError> {
        let rows = self
            .bounded(
                sqlx::query_as::<_, FeatureFlagRow>(
                    "SELECT id, team_id, name, key, filters, deleted, active, \
                            ensure_experience_continuity, has_encrypted_payloads \
                     FROM feature_flags \
                     WHERE project_id = $1 AND active = TRUE AND deleted = FALSE",
                )
                .bind(project_id)
                .fetch_all(&self.pool),
            )
            .await?;

        let mut flags = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<FlagFilters>(row.filters) {
                Ok(filters) => flags.push(FeatureFlag {
                    id: row.id,
                    team_id: row.team_id,
                    name: row.name,
                    key: row.key,
                    filters,
                    deleted: row.deleted,
                    active: row.active,
                    ensure_experience_continuity: row.ensure_experience_continuity,
                    has_encrypted_payloads: row.has_encrypted_payloads,
                }),
                Err(e) => {
                    // One malformed definition must not take the batch down.
                    let error = FlagError::InvalidFlagDefinition(row.key.clone());
                    metrics::counter!(
                        FLAG_EVALUATION_ERROR_COUNTER,
                        "reason" => error.error_code()
                    )
                    .increment(1);
                    warn!(flag = %row.key, parse_error = %e, error = %error, "Skipping flag with unparseable filters");
                }
            }
        }
        Ok(FeatureFlagList::new(flags))
    }
}

#[async_trait]
impl GroupTypeMappingProvider for PostgresStore {
    async fn group_types_to_indexes(
        &self,
        project_id: ProjectId,
    ) -> Result<HashMap<String, GroupTypeIndex>, StoreError> {
        let rows = self
            .bounded(
                sqlx::query_as::<_, (String, GroupTypeIndex)>(
                    "SELECT group_type, group_type_index \
                     FROM group_type_mappings \
                     WHERE project_id = $1",
                )
                .bind(project_id)
                .fetch_all(&self.pool),
            )
            .await?;
        Ok(rows.into_iter().collect())
    }
}

#[async_trait]
impl OverrideStore for PostgresStore {
    /// One atomic conditional insert covering every continuity flag that
    /// lacks an override for the persons behind the distinct ids.
    /// `ON CONFLICT DO NOTHING` keeps concurrent writers first-write-wins; a
    /// foreign-key violation means a person vanished mid-write and is
    /// surfaced as the retryable error kind.
    async fn insert_overrides(
        &self,
        team_id: TeamId,
        project_id: ProjectId,
        distinct_ids: &[String],
        hash_key: &str,
    ) -> Result<u64, OverrideWriteError> {
        let mut transaction = self.pool.begin().await.map_err(StoreError::from)?;

        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        ))
        .execute(&mut *transaction)
        .await
        .map_err(StoreError::from)?;

        let insert = sqlx::query(
            "INSERT INTO feature_flag_hash_key_overrides \
                 (team_id, person_id, feature_flag_key, hash_key) \
             SELECT pd.team_id, pd.person_id, ff.key, $1 \
             FROM person_distinct_ids pd \
             CROSS JOIN feature_flags ff \
             WHERE pd.team_id = $2 \
               AND pd.distinct_id = ANY($3) \
               AND ff.project_id = $4 \
               AND ff.ensure_experience_continuity = TRUE \
               AND ff.active = TRUE \
               AND ff.deleted = FALSE \
               AND NOT EXISTS ( \
                   SELECT 1 FROM feature_flag_hash_key_overrides existing \
                   WHERE existing.team_id = pd.team_id \
                     AND existing.person_id = pd.person_id \
                     AND existing.feature_flag_key = ff.key) \
             ON CONFLICT DO NOTHING",
        )
        .bind(hash_key)
        .bind(team_id)
        .bind(distinct_ids)
        .bind(project_id)
        .execute(&mut *transaction)
        .await;

        match insert {
            Ok(done) => {
                transaction.commit().await.map_err(StoreError::from)?;
                Ok(done.rows_affected())
            }
            Err(e) => {
                if let Err(rollback_error) = transaction.rollback().await {
                    warn!(error = %rollback_error, "Failed to roll back override write");
                }
                if is_foreign_key_violation(&e) {
                    Err(OverrideWriteError::PersonDeleted)
                } else {
                    Err(OverrideWriteError::Fatal(StoreError::from(e)))
                }
            }
        }
    }

    async fn overrides_for_distinct_ids(
        &self,
        team_id: TeamId,
        distinct_ids: &[String],
    ) -> Result<Vec<OverrideRow>, StoreError> {
        self.bounded(
            sqlx::query_as::<_, OverrideRow>(
                "SELECT pd.person_id, pd.distinct_id, o.feature_flag_key, o.hash_key \
                 FROM person_distinct_ids pd \
                 JOIN feature_flag_hash_key_overrides o \
                     ON o.person_id = pd.person_id AND o.team_id = pd.team_id \
                 WHERE pd.team_id = $1 AND pd.distinct_id = ANY($2)",
            )
            .bind(team_id)
            .bind(distinct_ids)
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn existing_override_flag_keys(
        &self,
        team_id: TeamId,
        distinct_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let keys = self
            .bounded(
                sqlx::query_scalar::<_, String>(
                    "SELECT DISTINCT o.feature_flag_key \
                     FROM person_distinct_ids pd \
                     JOIN feature_flag_hash_key_overrides o \
                         ON o.person_id = pd.person_id AND o.team_id = pd.team_id \
                     WHERE pd.team_id = $1 AND pd.distinct_id = ANY($2)",
                )
                .bind(team_id)
                .bind(distinct_ids)
                .fetch_all(&self.pool),
            )
            .await?;
        Ok(keys.into_iter().collect())
    }

    async fn continuity_flag_keys(
        &self,
        project_id: ProjectId,
    ) -> Result<Vec<String>, StoreError> {
        self.bounded(
            sqlx::query_scalar::<_, String>(
                "SELECT key FROM feature_flags \
                 WHERE project_id = $1 \
                   AND ensure_experience_continuity = TRUE \
                   AND active = TRUE \
                   AND deleted = FALSE",
            )
            .bind(project_id)
            .fetch_all(&self.pool),
        )
        .await
    }
}

fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| code == "23503")
}

fn push_expression(
    builder: &mut QueryBuilder<Postgres>,
    expression: &PropertyExpression,
    properties_column: &str,
) {
    match expression {
        PropertyExpression::And(parts) => {
            if parts.is_empty() {
                builder.push("TRUE");
                return;
            }
            builder.push("(");
            for (index, part) in parts.iter().enumerate() {
                if index > 0 {
                    builder.push(" AND ");
                }
                push_expression(builder, part, properties_column);
            }
            builder.push(")");
        }
        PropertyExpression::Or(parts) => {
            if parts.is_empty() {
                builder.push("FALSE");
                return;
            }
            builder.push("(");
            for (index, part) in parts.iter().enumerate() {
                if index > 0 {
                    builder.push(" OR ");
                }
                push_expression(builder, part, properties_column);
            }
            builder.push(")");
        }
        PropertyExpression::Not(part) => {
            builder.push("NOT ");
            push_expression(builder, part, properties_column);
        }
        PropertyExpression::Match(filter) => {
            push_filter(builder, filter, properties_column);
        }
    }
}

/// Emit the SQL predicate for one property filter against a JSONB column.
/// Numeric comparisons are typeof-guarded so `"25" > 3` compares numbers, not
/// strings; text predicates treat a missing key per the in-memory semantics
/// (negative operators match, positive ones don't).
fn push_filter(
    builder: &mut QueryBuilder<Postgres>,
    filter: &PropertyFilter,
    properties_column: &str,
) {
    let operator = filter.operator.unwrap_or(OperatorType::Exact);
    let text_value = format!("{properties_column}->>");
    let json_value = format!("{properties_column}->");

    match operator {
        OperatorType::IsSet => {
            builder.push(format!("({properties_column} ? "));
            builder.push_bind(filter.key.clone());
            builder.push(")");
        }
        OperatorType::IsNotSet => {
            builder.push(format!("NOT COALESCE({properties_column} ? "));
            builder.push_bind(filter.key.clone());
            builder.push(", FALSE)");
        }
        OperatorType::Exact | OperatorType::IsNot => {
            let values: Vec<String> = match &filter.value {
                Some(serde_json::Value::Array(values)) => values
                    .iter()
                    .map(|v| json_value_to_text(v).to_lowercase())
                    .collect(),
                Some(value) => vec![json_value_to_text(value).to_lowercase()],
                None => vec![],
            };
            if operator == OperatorType::Exact {
                builder.push("(");
                push_text_access(builder, &text_value, &filter.key);
                builder.push(" IS NOT NULL AND lower(");
                push_text_access(builder, &text_value, &filter.key);
                builder.push(") = ANY(");
                builder.push_bind(values);
                builder.push("))");
            } else {
                builder.push("(");
                push_text_access(builder, &text_value, &filter.key);
                builder.push(" IS NULL OR lower(");
                push_text_access(builder, &text_value, &filter.key);
                builder.push(") <> ALL(");
                builder.push_bind(values);
                builder.push("))");
            }
        }
        OperatorType::Icontains | OperatorType::NotIcontains => {
            let needle = filter
                .value
                .as_ref()
                .map(json_value_to_text)
                .unwrap_or_default();
            if operator == OperatorType::Icontains {
                builder.push("(");
                push_text_access(builder, &text_value, &filter.key);
                builder.push(" ILIKE '%' || ");
                builder.push_bind(needle);
                builder.push(" || '%')");
            } else {
                builder.push("(");
                push_text_access(builder, &text_value, &filter.key);
                builder.push(" IS NULL OR ");
                push_text_access(builder, &text_value, &filter.key);
                builder.push(" NOT ILIKE '%' || ");
                builder.push_bind(needle);
                builder.push(" || '%')");
            }
        }
        OperatorType::Regex | OperatorType::NotRegex => {
            let pattern = filter
                .value
                .as_ref()
                .map(json_value_to_text)
                .unwrap_or_default();
            if operator == OperatorType::Regex {
                builder.push("(");
                push_text_access(builder, &text_value, &filter.key);
                builder.push(" ~ ");
                builder.push_bind(pattern);
                builder.push(")");
            } else {
                builder.push("(");
                push_text_access(builder, &text_value, &filter.key);
                builder.push(" IS NULL OR ");
                push_text_access(builder, &text_value, &filter.key);
                builder.push(" !~ ");
                builder.push_bind(pattern);
                builder.push(")");
            }
        }
        OperatorType::Gt | OperatorType::Gte | OperatorType::Lt | OperatorType::Lte => {
            let sql_operator = match operator {
                OperatorType::Gt => ">",
                OperatorType::Gte => ">=",
                OperatorType::Lt => "<",
                OperatorType::Lte => "<=",
                _ => unreachable!(),
            };
            let value = filter
                .value
                .as_ref()
                .map(json_value_to_text)
                .unwrap_or_default();
            builder.push("(CASE WHEN jsonb_typeof(");
            builder.push(&json_value);
            builder.push_bind(filter.key.clone());
            builder.push(") = 'number' OR ");
            push_text_access(builder, &text_value, &filter.key);
            builder.push(" ~ '^-?[0-9]+(\\.[0-9]+)?$' THEN (");
            push_text_access(builder, &text_value, &filter.key);
            builder.push(format!(")::numeric {sql_operator} ("));
            builder.push_bind(value);
            builder.push(")::numeric ELSE FALSE END)");
        }
        OperatorType::IsDateExact | OperatorType::IsDateAfter | OperatorType::IsDateBefore => {
            let sql_operator = match operator {
                OperatorType::IsDateExact => "=",
                OperatorType::IsDateAfter => ">",
                OperatorType::IsDateBefore => "<",
                _ => unreachable!(),
            };
            let value = filter
                .value
                .as_ref()
                .map(json_value_to_text)
                .unwrap_or_default();
            builder.push("(CASE WHEN ");
            push_text_access(builder, &text_value, &filter.key);
            builder.push(" ~ '^[0-9]{4}-[0-9]{2}-[0-9]{2}' THEN (");
            push_text_access(builder, &text_value, &filter.key);
            builder.push(format!(")::timestamptz {sql_operator} ("));
            builder.push_bind(value);
            builder.push(")::timestamptz ELSE FALSE END)");
        }
        // Cohort membership operators are resolved before planning; they
        // never reach the store.
        OperatorType::In | OperatorType::NotIn => {
            builder.push("FALSE");
        }
    }
}

fn push_text_access(builder: &mut QueryBuilder<Postgres>, text_accessor: &str, key: &str) {
    builder.push("(");
    builder.push(text_accessor);
    builder.push_bind(key.to_string());
    builder.push(")");
}

fn json_value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
