//! Normalization of query results into flat find values
//!
//! Every strategy's output funnels through [`to_metric_find_values`] before
//! option building. Frames are scanned for well-known columns (`text`,
//! `value`, `expandable`, matched case-insensitively) with a first-string-
//! column fallback; pre-normalized values pass through untouched, which makes
//! the operator idempotent.

use crate::datasource::frame::{DataFrame, FieldType};
use crate::datasource::QueryResultPayload;
use crate::error::{Result, TransformError};
use crate::types::{FieldValue, MetricFindValue};

#[derive(Debug, Default)]
struct RoleIndices {
    text: Option<usize>,
    value: Option<usize>,
    expandable: Option<usize>,
    string: Option<usize>,
}

fn scan_roles(frames: &[DataFrame]) -> RoleIndices {
    let mut roles = RoleIndices::default();

    for frame in frames {
        for (index, field) in frame.fields.iter().enumerate() {
            let name = field.name.to_lowercase();

            if field.field_type == FieldType::String && roles.string.is_none() {
                roles.string = Some(index);
            }
            if name == "text" && field.field_type == FieldType::String && roles.text.is_none() {
                roles.text = Some(index);
            }
            if name == "value" && field.field_type == FieldType::String && roles.value.is_none() {
                roles.value = Some(index);
            }
            if name == "expandable"
                && matches!(field.field_type, FieldType::Boolean | FieldType::Number)
                && roles.expandable.is_none()
            {
                roles.expandable = Some(index);
            }
        }
    }

    roles
}

fn cell(frame: &DataFrame, index: Option<usize>, row: usize) -> Option<FieldValue> {
    index
        .and_then(|i| frame.field(i))
        .and_then(|f| f.value_at(row))
        .cloned()
}

/// Reduce a query result payload to flat find values
///
/// Pre-normalized values pass through unchanged. Frames resolve their role
/// columns once across the whole list (first match wins per role) and then
/// produce one find value per row, mirroring text and value into each other
/// when only one side has a column. Frames with no string-typed column
/// anywhere are an error: there is nothing to build options from.
pub fn to_metric_find_values(payload: QueryResultPayload) -> Result<Vec<MetricFindValue>> {
    let frames = match payload {
        QueryResultPayload::Values(values) => return Ok(values),
        QueryResultPayload::Frames(frames) => frames,
    };

    if frames.is_empty() {
        return Ok(Vec::new());
    }

    let roles = scan_roles(&frames);
    let string_index = roles.string.ok_or(TransformError::NoStringField)?;

    let mut metrics = Vec::new();
    for frame in &frames {
        for row in 0..frame.row_count() {
            let expandable = cell(frame, roles.expandable, row)
                .as_ref()
                .and_then(FieldValue::as_bool_like);

            let entry = match (roles.text, roles.value) {
                (None, None) => {
                    let string = cell(frame, Some(string_index), row);
                    MetricFindValue {
                        text: string.clone(),
                        value: string,
                        expandable,
                    }
                }
                (Some(_), None) => {
                    let text = cell(frame, roles.text, row);
                    MetricFindValue {
                        text: text.clone(),
                        value: text,
                        expandable,
                    }
                }
                (None, Some(_)) => {
                    let value = cell(frame, roles.value, row);
                    MetricFindValue {
                        text: value.clone(),
                        value,
                        expandable,
                    }
                }
                (Some(_), Some(_)) => MetricFindValue {
                    text: cell(frame, roles.text, row),
                    value: cell(frame, roles.value, row),
                    expandable,
                },
            };

            metrics.push(entry);
        }
    }

    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::frame::Field;
    use crate::error::Error;

    fn frames(frames: Vec<DataFrame>) -> QueryResultPayload {
        QueryResultPayload::Frames(frames)
    }

    #[test]
    fn test_empty_frames_yield_no_values() {
        let result = to_metric_find_values(frames(vec![])).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_values_pass_through_unchanged() {
        let values = vec![
            MetricFindValue::text("A"),
            MetricFindValue::pair("B", "b"),
        ];
        let payload = QueryResultPayload::Values(values.clone());
        assert_eq!(to_metric_find_values(payload).unwrap(), values);
    }

    #[test]
    fn test_idempotent_over_own_output() {
        let frame = DataFrame::new().with_field(Field::strings("text", ["A", "B"]));
        let first = to_metric_find_values(frames(vec![frame])).unwrap();
        let second = to_metric_find_values(QueryResultPayload::Values(first.clone())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_text_column_mirrors_into_value() {
        let frame = DataFrame::new().with_field(Field::strings("text", ["A", "B"]));
        let result = to_metric_find_values(frames(vec![frame])).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].text_string(), "A");
        assert_eq!(result[0].value_string(), "A");
        assert_eq!(result[1].value_string(), "B");
    }

    #[test]
    fn test_value_column_mirrors_into_text() {
        let frame = DataFrame::new().with_field(Field::strings("value", ["a", "b"]));
        let result = to_metric_find_values(frames(vec![frame])).unwrap();

        assert_eq!(result[0].text_string(), "a");
        assert_eq!(result[0].value_string(), "a");
    }

    #[test]
    fn test_text_and_value_columns_taken_verbatim() {
        let frame = DataFrame::new()
            .with_field(Field::strings("text", ["A", "B"]))
            .with_field(Field::strings("value", ["a", "b"]));
        let result = to_metric_find_values(frames(vec![frame])).unwrap();

        assert_eq!(result[0].text_string(), "A");
        assert_eq!(result[0].value_string(), "a");
        assert_eq!(result[1].text_string(), "B");
        assert_eq!(result[1].value_string(), "b");
    }

    #[test]
    fn test_column_names_match_case_insensitively() {
        let frame = DataFrame::new()
            .with_field(Field::strings("Text", ["A"]))
            .with_field(Field::strings("VALUE", ["a"]));
        let result = to_metric_find_values(frames(vec![frame])).unwrap();

        assert_eq!(result[0].text_string(), "A");
        assert_eq!(result[0].value_string(), "a");
    }

    #[test]
    fn test_first_string_column_fallback() {
        let frame = DataFrame::new()
            .with_field(Field::numbers("id", [1.0, 2.0]))
            .with_field(Field::strings("instance", ["web-1", "web-2"]));
        let result = to_metric_find_values(frames(vec![frame])).unwrap();

        assert_eq!(result[0].text_string(), "web-1");
        assert_eq!(result[0].value_string(), "web-1");
        assert_eq!(result[1].text_string(), "web-2");
    }

    #[test]
    fn test_expandable_boolean_column() {
        let frame = DataFrame::new()
            .with_field(Field::strings("text", ["A", "B"]))
            .with_field(Field::booleans("expandable", [true, false]));
        let result = to_metric_find_values(frames(vec![frame])).unwrap();

        assert_eq!(result[0].expandable, Some(true));
        assert_eq!(result[1].expandable, Some(false));
    }

    #[test]
    fn test_expandable_numeric_column() {
        let frame = DataFrame::new()
            .with_field(Field::strings("text", ["A", "B"]))
            .with_field(Field::numbers("expandable", [1.0, 0.0]));
        let result = to_metric_find_values(frames(vec![frame])).unwrap();

        assert_eq!(result[0].expandable, Some(true));
        assert_eq!(result[1].expandable, Some(false));
    }

    #[test]
    fn test_no_string_field_errors() {
        let frame = DataFrame::new().with_field(Field::numbers("value", [1.0]));
        let err = to_metric_find_values(frames(vec![frame])).unwrap_err();

        assert!(matches!(
            err,
            Error::Transform(TransformError::NoStringField)
        ));
        assert_eq!(
            err.to_string(),
            "Transform error: Couldn't find any field of type string in the results."
        );
    }

    #[test]
    fn test_rows_collected_across_frames() {
        let a = DataFrame::new().with_field(Field::strings("text", ["A"]));
        let b = DataFrame::new().with_field(Field::strings("text", ["B", "C"]));
        let result = to_metric_find_values(frames(vec![a, b])).unwrap();

        let texts: Vec<_> = result.iter().map(MetricFindValue::text_string).collect();
        assert_eq!(texts, vec!["A", "B", "C"]);
    }
}
