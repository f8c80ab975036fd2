use regex::Regex;

use crate::{
    models::{Operator, PropertyCondition},
    AttributeValue, Attributes, Timestamp,
};

use super::{dates, InconclusiveReason};

/// Match a single person or group property condition against `attributes`.
///
/// Negation is not applied here; callers flip the result for negated conditions.
///
/// # Errors
///
/// Returns an [`InconclusiveReason`] when the property is missing, the operator has no local
/// implementation (including `is_not_set`), or a date operator cannot parse its inputs.
pub fn match_property(
    condition: &PropertyCondition,
    attributes: &Attributes,
    now: Timestamp,
) -> Result<bool, InconclusiveReason> {
    let operator = condition.operator;
    let Some(attribute) = attributes.get(&condition.key) else {
        return Err(InconclusiveReason::MissingProperty(condition.key.clone()));
    };
    let expected = &condition.value;

    match operator {
        Operator::Exact => Ok(exact_match(expected, attribute)),
        Operator::IsNot => Ok(!exact_match(expected, attribute)),
        Operator::IsSet => Ok(true),
        Operator::Icontains => Ok(contains_ignore_case(attribute, expected)),
        Operator::NotIcontains => Ok(!contains_ignore_case(attribute, expected)),
        Operator::Regex => Ok(regex_match(expected, attribute).unwrap_or(false)),
        Operator::NotRegex => Ok(regex_match(expected, attribute).map_or(false, |m| !m)),
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            Ok(compare(operator, attribute, expected))
        }
        Operator::IsDateBefore | Operator::IsDateAfter => {
            let expected = expected.to_comparable_string();
            let target = dates::parse_relative_date(&expected, now)
                .or_else(|| dates::parse_date(&expected));
            compare_dates(operator, condition, attribute, target)
        }
        Operator::IsRelativeDateBefore | Operator::IsRelativeDateAfter => {
            let target = dates::parse_relative_date(&expected.to_comparable_string(), now);
            compare_dates(operator, condition, attribute, target)
        }
        Operator::IsNotSet
        | Operator::In
        | Operator::NotIn
        | Operator::FlagEvaluatesTo
        | Operator::Unknown => Err(InconclusiveReason::UnsupportedOperator(operator)),
    }
}

/// Case-insensitive equality, or membership when `expected` is a list.
fn exact_match(expected: &AttributeValue, attribute: &AttributeValue) -> bool {
    let actual = attribute.to_comparable_string().to_lowercase();
    match expected {
        AttributeValue::List(values) => values
            .iter()
            .any(|value| value.to_comparable_string().to_lowercase() == actual),
        value => value.to_comparable_string().to_lowercase() == actual,
    }
}

fn contains_ignore_case(attribute: &AttributeValue, expected: &AttributeValue) -> bool {
    attribute
        .to_comparable_string()
        .to_lowercase()
        .contains(&expected.to_comparable_string().to_lowercase())
}

/// `None` if the pattern does not compile. Invalid patterns never match, negated or not.
fn regex_match(expected: &AttributeValue, attribute: &AttributeValue) -> Option<bool> {
    let regex = Regex::new(&expected.to_comparable_string()).ok()?;
    Some(regex.is_match(&attribute.to_comparable_string()))
}

/// Ordering operators compare numerically when both sides are numeric and the attribute is not a
/// string. Otherwise both sides are compared as strings.
fn compare(operator: Operator, attribute: &AttributeValue, expected: &AttributeValue) -> bool {
    let expected_number = expected.parse_number();
    let attribute_number = attribute.as_number();
    match (expected_number, attribute, attribute_number) {
        (Some(_), AttributeValue::String(actual), _) => ordered(
            operator,
            actual.as_str(),
            expected.to_comparable_string().as_str(),
        ),
        (Some(expected), _, Some(actual)) => ordered(operator, &actual, &expected),
        _ => ordered(
            operator,
            attribute.to_comparable_string().as_str(),
            expected.to_comparable_string().as_str(),
        ),
    }
}

fn ordered<T: PartialOrd + ?Sized>(operator: Operator, actual: &T, expected: &T) -> bool {
    match operator {
        Operator::Gt => actual > expected,
        Operator::Gte => actual >= expected,
        Operator::Lt => actual < expected,
        Operator::Lte => actual <= expected,
        _ => false,
    }
}

fn compare_dates(
    operator: Operator,
    condition: &PropertyCondition,
    attribute: &AttributeValue,
    target: Option<Timestamp>,
) -> Result<bool, InconclusiveReason> {
    let invalid = || InconclusiveReason::InvalidDate(condition.key.clone());
    let target = target.ok_or_else(invalid)?;
    let actual = dates::attribute_to_date(attribute).ok_or_else(invalid)?;
    Ok(match operator {
        Operator::IsDateBefore | Operator::IsRelativeDateBefore => actual < target,
        _ => actual > target,
    })
}
