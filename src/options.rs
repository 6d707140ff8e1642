//! Option building from normalized find values
//!
//! Turns flat find values into the option list stored on a variable:
//! coerce numbers to text, apply the variable's extraction regex, drop
//! duplicates, and sort. The regex arrives already interpolated; patterns
//! may use the `/pattern/flags` form or a bare pattern, which matches the
//! whole value. Named capture groups `value` and `text` pick the respective
//! option sides; a plain first capture group extracts one option per match.
//!
//! The synthetic All/None options are not added here; they are a store-side
//! decoration applied when options are written to a variable.

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Result, TransformError};
use crate::types::{MetricFindValue, VariableOption, VariableSort};

lazy_static! {
    /// First run of digits in an option text, for numeric sorting
    static ref FIRST_DIGIT_RUN: Regex = Regex::new(r"\d+").expect("static digit pattern");
}

/// Build the option list for a variable from its query results
///
/// An empty `templated_regex` keeps every value. With a regex, values that
/// do not match are dropped entirely; capture groups extract replacement
/// text/value sides as described in the module docs. Duplicate values keep
/// their first occurrence. Sorting happens last, per [`VariableSort`].
pub fn metric_names_to_option_values(
    values: &[MetricFindValue],
    sort: VariableSort,
    templated_regex: &str,
) -> Result<Vec<VariableOption>> {
    let regex = if templated_regex.is_empty() {
        None
    } else {
        Some(compile_templated_regex(templated_regex)?)
    };

    let mut options = Vec::with_capacity(values.len());

    for item in values {
        let mut text = item.text_string();
        let mut value = item.value_string();

        if let Some(regex) = &regex {
            let matches: Vec<_> = regex.captures_iter(&value).collect();
            if matches.is_empty() {
                continue;
            }

            let value_group = matches.iter().find_map(|c| c.name("value"));
            let text_group = matches.iter().find_map(|c| c.name("text"));
            let first_capture = matches.iter().find_map(|c| c.get(1));

            if value_group.is_some() || text_group.is_some() {
                let extracted_value = value_group.or(text_group).map(|m| m.as_str().to_string());
                let extracted_text = text_group.or(value_group).map(|m| m.as_str().to_string());
                if let (Some(v), Some(t)) = (extracted_value, extracted_text) {
                    value = v;
                    text = t;
                }
            } else if matches.len() > 1 && first_capture.is_some() {
                for capture in matches.iter().filter_map(|c| c.get(1)) {
                    options.push(VariableOption::from_text(capture.as_str()));
                }
                continue;
            } else if let Some(capture) = first_capture {
                let extracted = capture.as_str().to_string();
                text = extracted.clone();
                value = extracted;
            }
        }

        options.push(VariableOption::new(text, value));
    }

    let mut seen = HashSet::with_capacity(options.len());
    options.retain(|option| seen.insert(option.value.clone()));

    Ok(sort_option_values(options, sort))
}

/// Sort options per the variable's sort policy
///
/// All orderings key on the option text. The numeric policy keys on the
/// first digit run in the text; texts without digits sort before everything.
/// Descending variants sort ascending and then reverse, so ties flip order
/// the same way they always have.
pub fn sort_option_values(
    mut options: Vec<VariableOption>,
    sort: VariableSort,
) -> Vec<VariableOption> {
    let reverse = matches!(
        sort,
        VariableSort::AlphabeticalDesc
            | VariableSort::NumericalDesc
            | VariableSort::AlphabeticalCaseInsensitiveDesc
    );

    match sort {
        VariableSort::Disabled => return options,
        VariableSort::AlphabeticalAsc | VariableSort::AlphabeticalDesc => {
            options.sort_by_key(|o| option_text(o).to_string());
        }
        VariableSort::NumericalAsc | VariableSort::NumericalDesc => {
            options.sort_by_key(|o| numeric_sort_key(option_text(o)));
        }
        VariableSort::AlphabeticalCaseInsensitiveAsc
        | VariableSort::AlphabeticalCaseInsensitiveDesc => {
            options.sort_by_key(|o| option_text(o).to_lowercase());
        }
    }

    if reverse {
        options.reverse();
    }
    options
}

fn option_text(option: &VariableOption) -> &str {
    option.text.as_single().unwrap_or("")
}

fn numeric_sort_key(text: &str) -> i64 {
    match FIRST_DIGIT_RUN.find(text) {
        Some(digits) => digits.as_str().parse().unwrap_or(i64::MAX),
        None => -1,
    }
}

fn compile_templated_regex(pattern: &str) -> Result<Regex> {
    let invalid = || TransformError::InvalidRegex(pattern.to_string());

    let source = match pattern.strip_prefix('/') {
        // Bare patterns match the whole value
        None => format!("^{}$", pattern),
        Some(rest) => {
            let close = rest.rfind('/').ok_or_else(invalid)?;
            let (body, flags) = rest.split_at(close);
            let flags = &flags[1..];

            if !flags.chars().all(|c| "gimsyu".contains(c)) {
                return Err(invalid().into());
            }

            // g/y/u have no meaning here; matching is always global
            let inline: String = flags.chars().filter(|c| "ims".contains(*c)).collect();
            if inline.is_empty() {
                body.to_string()
            } else {
                format!("(?{}){}", inline, body)
            }
        }
    };

    Regex::new(&source).map_err(|_| invalid().into())
}
