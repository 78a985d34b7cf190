use std::collections::{HashMap, VecDeque};

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::DiGraph;

use crate::cohorts::cohort_models::{Cohort, CohortId, CohortPropertyType, InnerCohortProperty};
use crate::error::{FlagError, StoreError};
use crate::properties::property_models::OperatorType;
use crate::store::{CohortStoreRef, ProjectId, PropertyExpression};

/// Store-backed cohort resolver, scoped to a single evaluation call. Memoizes
/// cohort lookups so each cohort is fetched at most once per call, and rejects
/// cyclic dependency graphs instead of recursing into them.
pub struct CohortResolver {
    project_id: ProjectId,
    store: CohortStoreRef,
    cohorts: HashMap<CohortId, Cohort>,
}

impl CohortResolver {
    pub fn new(project_id: ProjectId, store: CohortStoreRef) -> Self {
        CohortResolver {
            project_id,
            store,
            cohorts: HashMap::new(),
        }
    }

    pub async fn cohort(&mut self, cohort_id: CohortId) -> Result<&Cohort, FlagError> {
        if !self.cohorts.contains_key(&cohort_id) {
            let cohort = self
                .store
                .get_cohort(self.project_id, cohort_id)
                .await
                .map_err(|e| match e {
                    StoreError::NotFound => FlagError::CohortNotFound(cohort_id),
                    other => FlagError::from(other),
                })?;
            self.cohorts.insert(cohort_id, cohort);
        }
        Ok(&self.cohorts[&cohort_id])
    }

    /// Fetches `cohort_id` and its transitive dependencies breadth-first,
    /// returning ids in dependency-first order. A cycle anywhere in the
    /// reachable graph fails resolution for this cohort.
    pub async fn resolve_dependencies(
        &mut self,
        cohort_id: CohortId,
    ) -> Result<Vec<CohortId>, FlagError> {
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();
        let mut queue = VecDeque::new();

        queue.push_back(cohort_id);
        node_map.insert(cohort_id, graph.add_node(cohort_id));

        while let Some(current) = queue.pop_front() {
            let dependencies = self.cohort(current).await?.extract_dependencies()?;
            for dep_id in dependencies {
                let current_node = node_map[&current];
                let is_new_dep = !node_map.contains_key(&dep_id);
                let dep_node = *node_map
                    .entry(dep_id)
                    .or_insert_with(|| graph.add_node(dep_id));
                graph.add_edge(current_node, dep_node, ());
                if is_new_dep {
                    queue.push_back(dep_id);
                }
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(FlagError::CohortDependencyCycle(cohort_id));
        }

        let sorted =
            toposort(&graph, None).map_err(|_| FlagError::CohortDependencyCycle(cohort_id))?;

        // toposort yields dependents first; evaluation wants dependencies first.
        Ok(sorted.into_iter().rev().map(|node| graph[node]).collect())
    }

    /// Reduces a cohort, plus everything it depends on, to one property
    /// expression the person/group store can evaluate in a single pass.
    pub async fn property_expression(
        &mut self,
        cohort_id: CohortId,
    ) -> Result<PropertyExpression, FlagError> {
        let order = self.resolve_dependencies(cohort_id).await?;

        let mut resolved: HashMap<CohortId, PropertyExpression> = HashMap::new();
        for id in order {
            let cohort = &self.cohorts[&id];
            let expression = match cohort.parse_filters()? {
                Some(tree) => expression_from_tree(&tree.properties, &resolved)?,
                // A cohort without filters constrains nothing.
                None => PropertyExpression::And(vec![]),
            };
            resolved.insert(id, expression);
        }

        resolved
            .remove(&cohort_id)
            .ok_or(FlagError::CohortNotFound(cohort_id))
    }
}

fn expression_from_tree(
    inner: &InnerCohortProperty,
    resolved: &HashMap<CohortId, PropertyExpression>,
) -> Result<PropertyExpression, FlagError> {
    let mut parts = Vec::with_capacity(inner.values.len());
    for group in &inner.values {
        let mut leaves = Vec::with_capacity(group.values.len());
        for filter in &group.values {
            if filter.is_cohort() {
                let dep_id = filter
                    .get_cohort_id()
                    .ok_or(FlagError::CohortFiltersParsingError)?;
                let expression = resolved
                    .get(&dep_id)
                    .cloned()
                    .ok_or(FlagError::CohortNotFound(dep_id))?;
                if matches!(filter.operator, Some(OperatorType::NotIn)) {
                    leaves.push(PropertyExpression::Not(Box::new(expression)));
                } else {
                    leaves.push(expression);
                }
            } else {
                leaves.push(PropertyExpression::Match(filter.clone()));
            }
        }
        parts.push(match group.prop_type.as_str() {
            "OR" => PropertyExpression::Or(leaves),
            "AND" | "property" => PropertyExpression::And(leaves),
            _ => return Err(FlagError::CohortFiltersParsingError),
        });
    }

    Ok(match inner.prop_type {
        CohortPropertyType::OR => PropertyExpression::Or(parts),
        CohortPropertyType::AND => PropertyExpression::And(parts),
    })
}
