use std::collections::{HashMap, HashSet};

use crate::cohorts::cohort_models::{CohortId, CohortPropertyType, CohortValues, InnerCohortProperty};
use crate::cohorts::cohort_resolution::CohortResolver;
use crate::error::FlagError;
use crate::flags::flag_models::FlagPropertyGroup;
use crate::properties::property_models::{OperatorType, PropertyFilter, PropertyType};

/// Inline a flag's single referenced cohort into its conditions so the flag
/// can be evaluated without the store.
///
/// Returns `Ok(None)` when expansion is not safe, in which case the caller
/// keeps the original conditions:
/// - the conditions reference zero or more than one distinct cohort,
/// - the cohort is referenced with `not_in` or carries negated properties,
/// - the cohort contains non-person properties,
/// - the tree can't be flattened into OR-of-ANDs,
/// - a condition combines a variant override with a multi-property cohort.
///
/// A dependency cycle is an error, not a fallback; the same cycle would fail
/// the store path too.
pub async fn expand_cohort_conditions(
    conditions: &[FlagPropertyGroup],
    resolver: &mut CohortResolver,
) -> Result<Option<Vec<FlagPropertyGroup>>, FlagError> {
    let mut cohort_ids = HashSet::new();
    for condition in conditions {
        for filter in condition.properties.as_deref().unwrap_or_default() {
            if filter.is_cohort() {
                if matches!(filter.operator, Some(OperatorType::NotIn)) {
                    return Ok(None);
                }
                cohort_ids.insert(
                    filter
                        .get_cohort_id()
                        .ok_or(FlagError::CohortFiltersParsingError)?,
                );
            }
        }
    }

    let mut ids = cohort_ids.into_iter();
    let (Some(cohort_id), None) = (ids.next(), ids.next()) else {
        return Ok(None);
    };

    // Flatten the cohort and its dependencies bottom-up. Each entry is a list
    // of alternative property lists (OR of ANDs).
    let order = resolver.resolve_dependencies(cohort_id).await?;
    let mut flattened: HashMap<CohortId, Vec<Vec<PropertyFilter>>> = HashMap::new();
    for id in order {
        let cohort = resolver.cohort(id).await?;
        let lists = match cohort.parse_filters()? {
            Some(tree) => match flatten_tree(&tree.properties, &flattened) {
                Some(lists) => lists,
                None => return Ok(None),
            },
            None => vec![vec![]],
        };
        flattened.insert(id, lists);
    }
    let cohort_conditions = &flattened[&cohort_id];

    let mut result = Vec::new();
    for condition in conditions {
        let properties = condition.properties.as_deref().unwrap_or_default();
        let (cohort_filters, other_filters): (Vec<&PropertyFilter>, Vec<&PropertyFilter>) =
            properties.iter().partition(|filter| filter.is_cohort());

        if cohort_filters.is_empty() {
            result.push(condition.clone());
            continue;
        }

        let total_properties: usize = cohort_conditions.iter().map(|c| c.len()).sum();
        if condition.variant.is_some() && total_properties > 1 {
            return Ok(None);
        }

        // One new condition per OR branch of the cohort, each inheriting the
        // original rollout percentage and variant override.
        for cohort_properties in cohort_conditions {
            let mut merged: Vec<PropertyFilter> =
                other_filters.iter().map(|&filter| filter.clone()).collect();
            merged.extend(cohort_properties.iter().cloned());
            result.push(FlagPropertyGroup {
                properties: Some(merged),
                rollout_percentage: condition.rollout_percentage,
                variant: condition.variant.clone(),
            });
        }
    }

    Ok(Some(result))
}

/// Flatten an AND/OR property tree into OR-of-ANDs. `None` means the tree is
/// not expressible that way (or a leaf disqualifies the whole expansion).
fn flatten_tree(
    inner: &InnerCohortProperty,
    flattened: &HashMap<CohortId, Vec<Vec<PropertyFilter>>>,
) -> Option<Vec<Vec<PropertyFilter>>> {
    let groups: Vec<Vec<Vec<PropertyFilter>>> = inner
        .values
        .iter()
        .map(|group| flatten_values(group, flattened))
        .collect::<Option<Vec<_>>>()?;

    match inner.prop_type {
        CohortPropertyType::OR => Some(groups.into_iter().flatten().collect()),
        CohortPropertyType::AND => {
            // AND across multi-branch groups would need distribution; refuse
            // rather than multiply conditions.
            let mut combined = Vec::new();
            for group in groups {
                match group.len() {
                    0 => {}
                    1 => combined.extend(group.into_iter().flatten()),
                    _ => return None,
                }
            }
            Some(vec![combined])
        }
    }
}

fn flatten_values(
    group: &CohortValues,
    flattened: &HashMap<CohortId, Vec<Vec<PropertyFilter>>>,
) -> Option<Vec<Vec<PropertyFilter>>> {
    match group.prop_type.as_str() {
        "OR" => {
            let mut branches = Vec::new();
            for filter in &group.values {
                if filter.is_cohort() {
                    branches.extend(flattened.get(&filter.get_cohort_id()?)?.iter().cloned());
                } else {
                    expandable_leaf(filter)?;
                    branches.push(vec![filter.clone()]);
                }
            }
            Some(branches)
        }
        "AND" | "property" => {
            let mut properties = Vec::new();
            for filter in &group.values {
                if filter.is_cohort() {
                    let dependency = flattened.get(&filter.get_cohort_id()?)?;
                    // Splicing an OR-shaped dependency into an AND group
                    // would need distribution.
                    if dependency.len() != 1 {
                        return None;
                    }
                    properties.extend(dependency[0].iter().cloned());
                } else {
                    expandable_leaf(filter)?;
                    properties.push(filter.clone());
                }
            }
            Some(vec![properties])
        }
        _ => None,
    }
}

fn expandable_leaf(filter: &PropertyFilter) -> Option<()> {
    if filter.prop_type != PropertyType::Person || filter.is_negated() {
        return None;
    }
    Some(())
}
