use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dateparser::parse as parse_date;
use regex::Regex;
use serde_json::Value;

use crate::properties::property_models::{OperatorType, PropertyFilter};

#[derive(Debug, PartialEq, Eq)]
pub enum PropertyMatchError {
    ValidationError(String),
    MissingProperty(String),
    InconclusiveMatch,
}

pub fn to_string_representation(value: &Value) -> String {
    if let Some(s) = value.as_str() {
        return s.to_string();
    }
    value.to_string()
}

pub fn to_f64_representation(value: &Value) -> Option<f64> {
    if value.is_number() {
        return value.as_f64();
    }
    to_string_representation(value).parse::<f64>().ok()
}

/// Evaluate a single property filter against a map of property values.
///
/// With `partial_props` the map is known to be incomplete (caller-supplied
/// overrides), so a missing key is inconclusive rather than a non-match.
pub fn match_property(
    property: &PropertyFilter,
    matching_property_values: &HashMap<String, Value>,
    partial_props: bool,
) -> Result<bool, PropertyMatchError> {
    if partial_props && !matching_property_values.contains_key(&property.key) {
        return Err(PropertyMatchError::MissingProperty(format!(
            "can't match properties without a value. Missing property: {}",
            property.key
        )));
    }

    let key = &property.key;
    let operator = property.operator.unwrap_or(OperatorType::Exact);
    let match_value = matching_property_values.get(key);

    // Operators that don't need a filter value.
    match operator {
        OperatorType::IsSet => return Ok(matching_property_values.contains_key(key)),
        OperatorType::IsNotSet => {
            return if partial_props {
                if matching_property_values.contains_key(key) {
                    Ok(false)
                } else {
                    Err(PropertyMatchError::InconclusiveMatch)
                }
            } else {
                Ok(!matching_property_values.contains_key(key))
            }
        }
        _ => {}
    }

    let value = match &property.value {
        Some(value) => value,
        None => return Ok(false),
    };

    match operator {
        OperatorType::Exact | OperatorType::IsNot => {
            let Some(match_value) = match_value else {
                // Missing property: not a match for Exact, a match for IsNot.
                return Ok(operator == OperatorType::IsNot);
            };
            let matched = compute_exact_match(value, match_value);
            if operator == OperatorType::Exact {
                Ok(matched)
            } else {
                Ok(!matched)
            }
        }
        OperatorType::Icontains | OperatorType::NotIcontains => {
            let Some(match_value) = match_value else {
                return Ok(operator == OperatorType::NotIcontains);
            };
            let is_contained = to_string_representation(match_value)
                .to_ascii_lowercase()
                .contains(&to_string_representation(value).to_ascii_lowercase());
            if operator == OperatorType::Icontains {
                Ok(is_contained)
            } else {
                Ok(!is_contained)
            }
        }
        OperatorType::Regex | OperatorType::NotRegex => {
            let Some(match_value) = match_value else {
                return Ok(operator == OperatorType::NotRegex);
            };
            let pattern = match Regex::new(&to_string_representation(value)) {
                Ok(pattern) => pattern,
                // An unparseable pattern never matches; it is not an error.
                Err(_) => return Ok(false),
            };
            let found = pattern
                .find(&to_string_representation(match_value))
                .is_some();
            if operator == OperatorType::Regex {
                Ok(found)
            } else {
                Ok(!found)
            }
        }
        OperatorType::Gt | OperatorType::Gte | OperatorType::Lt | OperatorType::Lte => {
            let Some(match_value) = match_value else {
                return Ok(false);
            };
            let parsed_value = to_f64_representation(match_value).ok_or_else(|| {
                PropertyMatchError::ValidationError("value is not a number".to_string())
            })?;
            let override_value = to_f64_representation(value).ok_or_else(|| {
                PropertyMatchError::ValidationError("filter value is not a number".to_string())
            })?;
            Ok(match operator {
                OperatorType::Gt => parsed_value > override_value,
                OperatorType::Gte => parsed_value >= override_value,
                OperatorType::Lt => parsed_value < override_value,
                OperatorType::Lte => parsed_value <= override_value,
                _ => false,
            })
        }
        OperatorType::IsDateExact | OperatorType::IsDateAfter | OperatorType::IsDateBefore => {
            let Some(parsed_date) = determine_parsed_date_for_property_matching(match_value) else {
                return Ok(false);
            };
            let Some(filter_date) = value.as_str().and_then(parse_date_string) else {
                return Ok(false);
            };
            Ok(match operator {
                OperatorType::IsDateBefore => parsed_date < filter_date,
                OperatorType::IsDateAfter => parsed_date > filter_date,
                OperatorType::IsDateExact => parsed_date == filter_date,
                _ => false,
            })
        }
        // In/NotIn only appear on cohort filters, which are decomposed into
        // plain property filters before this point.
        OperatorType::In | OperatorType::NotIn => Err(PropertyMatchError::ValidationError(
            "In/NotIn operators are reserved for cohort membership".to_string(),
        )),
        OperatorType::IsSet => Ok(matching_property_values.contains_key(key)),
        OperatorType::IsNotSet => {
            if partial_props {
                if matching_property_values.contains_key(key) {
                    Ok(false)
                } else {
                    Err(PropertyMatchError::InconclusiveMatch)
                }
            } else {
                Ok(!matching_property_values.contains_key(key))
            }
        }
    }
}

fn compute_exact_match(value: &Value, override_value: &Value) -> bool {
    if is_truthy_or_falsy_property_value(value) {
        // "true" / "True" / true are all equivalent as matching values.
        return is_truthy_property_value(value) == is_truthy_property_value(override_value);
    }

    if let Some(values) = value.as_array() {
        return values
            .iter()
            .map(|v| to_string_representation(v).to_lowercase())
            .any(|v| v == to_string_representation(override_value).to_lowercase());
    }
    to_string_representation(value).to_lowercase()
        == to_string_representation(override_value).to_lowercase()
}

fn is_truthy_or_falsy_property_value(value: &Value) -> bool {
    match value {
        Value::Bool(_) => true,
        Value::String(s) => {
            let lowered = s.to_lowercase();
            lowered == "true" || lowered == "false"
        }
        Value::Array(values) => values.iter().all(is_truthy_or_falsy_property_value),
        _ => false,
    }
}

fn is_truthy_property_value(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.to_lowercase() == "true",
        Value::Array(values) => !values.is_empty() && values.iter().all(is_truthy_property_value),
        _ => false,
    }
}

fn parse_date_string(date_str: &str) -> Option<DateTime<Utc>> {
    parse_date(date_str).ok()
}

fn determine_parsed_date_for_property_matching(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let value = value?;

    if let Some(date_str) = value.as_str() {
        // Epoch seconds arrive as strings often enough to try that first.
        if let Ok(seconds) = date_str.parse::<f64>() {
            return parse_float_timestamp(seconds);
        }
        return parse_date_string(date_str);
    }

    if let Some(number) = value.as_f64() {
        return parse_float_timestamp(number);
    }

    None
}

fn parse_float_timestamp(value: f64) -> Option<DateTime<Utc>> {
    let whole_seconds = value.floor() as i64;
    let nanos = ((value % 1.0) * 1_000_000_000.0).round() as u32;
    DateTime::from_timestamp(whole_seconds, nanos)
}
