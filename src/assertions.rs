use std::cmp::Ordering;

use serde_json::Value;

use crate::database::SqlClient;
use crate::error::{ApiTestError, Result};
use crate::expression::{self, CodeAssertion};
use crate::extract::find_first;
use crate::models::{AssertItem, Comparator, ResponseMeta, StructuredAssert};
use crate::variables::stringify;

/// Run the items of one teardown `assert` action in order.
/// Code assertions are parsed up front, so a grammar error fails before anything is evaluated.
pub fn run_assertions(
    items: &[AssertItem],
    response: &ResponseMeta,
    database: Option<&dyn SqlClient>,
    location: &str,
) -> Result<()> {
    let mut parsed: Vec<Option<CodeAssertion>> = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        parsed.push(match item {
            AssertItem::Code(source) => {
                Some(expression::parse_assertion(source).map_err(|e| e.at(&item_location(location, index)))?)
            }
            AssertItem::Structured(_) => None,
        });
    }

    let tree = response.to_value();
    for (index, (item, code)) in items.iter().zip(parsed).enumerate() {
        let item_location = item_location(location, index);
        match (item, code) {
            (_, Some(code)) => assert_code(&code, &tree).map_err(|e| e.at(&item_location))?,
            (AssertItem::Structured(assertion), None) => {
                assert_structured(assertion, response, database).map_err(|e| e.at(&item_location))?
            }
            (AssertItem::Code(_), None) => {}
        }
    }
    Ok(())
}

fn item_location(location: &str, index: usize) -> String {
    format!("{location}[{index}]")
}

/// Evaluate a parsed code assertion against the `pm.response` tree
pub fn assert_code(assertion: &CodeAssertion, response: &Value) -> Result<()> {
    if expression::evaluate(&assertion.comparison, Some(response), &assertion.source)? {
        log::debug!("Assertion passed: {}", assertion.source);
        return Ok(());
    }
    Err(ApiTestError::Assert(match &assertion.message {
        Some(message) => message.clone(),
        None => format!("'{}' evaluated to false", assertion.source),
    }))
}

/// Extract the first JSONPath match from the response JSON (or an SQL row) and compare it with `value`
pub fn assert_structured(
    assertion: &StructuredAssert,
    response: &ResponseMeta,
    database: Option<&dyn SqlClient>,
) -> Result<()> {
    let actual = match &assertion.sql {
        Some(sql) => {
            let database = database.ok_or_else(|| {
                ApiTestError::Sql(format!("'{sql}': no database is configured for SQL assertions"))
            })?;
            let row = database
                .query(sql)?
                .ok_or_else(|| ApiTestError::Sql(format!("'{sql}' returned no rows")))?;
            find_first(&Value::Object(row), &assertion.jsonpath, "sql")?
        }
        None => find_first(&response.json, &assertion.jsonpath, "json")?,
    };

    let passed = compare(assertion.comparator, &actual, &assertion.value)?;
    log::debug!(
        "Structured assertion {:?}: actual {actual} expected {} -> {passed}",
        assertion.comparator,
        assertion.value
    );

    if passed {
        Ok(())
    } else {
        Err(ApiTestError::Assert(assertion.check.clone().unwrap_or_else(|| {
            format!(
                "{} {:?} failed: actual {actual}, expected {}",
                assertion.jsonpath, assertion.comparator, assertion.value
            )
        })))
    }
}

/// Apply a comparator with the actual value on the left
pub fn compare(comparator: Comparator, actual: &Value, expected: &Value) -> Result<bool> {
    let result = match comparator {
        Comparator::Eq => loose_equal(actual, expected),
        Comparator::NotEq => !loose_equal(actual, expected),
        Comparator::Gt => order(actual, expected)? == Ordering::Greater,
        Comparator::Ge => order(actual, expected)? != Ordering::Less,
        Comparator::Lt => order(actual, expected)? == Ordering::Less,
        Comparator::Le => order(actual, expected)? != Ordering::Greater,
        Comparator::StrEq => stringify(actual) == stringify(expected),
        Comparator::LenEq => length(actual)? == threshold(expected)?,
        Comparator::NotLenEq => length(actual)? != threshold(expected)?,
        Comparator::LenGt => length(actual)? > threshold(expected)?,
        Comparator::LenGe => length(actual)? >= threshold(expected)?,
        Comparator::LenLt => length(actual)? < threshold(expected)?,
        Comparator::LenLe => length(actual)? <= threshold(expected)?,
        Comparator::Contains => contains(actual, expected)?,
        Comparator::NotContains => !contains(actual, expected)?,
        Comparator::Startswith => stringify(actual).starts_with(&stringify(expected)),
        Comparator::Endswith => stringify(actual).ends_with(&stringify(expected)),
    };
    Ok(result)
}

// numeric strings compare equal to numbers, values in documents are often stringified by placeholders
fn loose_equal(actual: &Value, expected: &Value) -> bool {
    if expression::values_equal(actual, expected) {
        return true;
    }
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn order(actual: &Value, expected: &Value) -> Result<Ordering> {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        if let Some(ordering) = a.partial_cmp(&b) {
            return Ok(ordering);
        }
    }
    expression::compare_values(actual, expected)
        .ok_or_else(|| ApiTestError::Assert(format!("cannot order {actual} against {expected}")))
}

fn length(value: &Value) -> Result<usize> {
    match value {
        Value::String(s) => Ok(s.chars().count()),
        Value::Array(items) => Ok(items.len()),
        Value::Object(fields) => Ok(fields.len()),
        other => Err(ApiTestError::Assert(format!("{other} has no length"))),
    }
}

// a number is the length itself, anything else is measured
fn threshold(value: &Value) -> Result<usize> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| ApiTestError::Assert(format!("{n} is not a valid length"))),
        other => length(other),
    }
}

fn contains(actual: &Value, expected: &Value) -> Result<bool> {
    let needle = match (actual, expected) {
        (Value::String(_), Value::String(_)) | (Value::Array(_), _) | (Value::Object(_), Value::String(_)) => {
            expected.clone()
        }
        (Value::String(_), other) => Value::String(stringify(other)),
        _ => expected.clone(),
    };
    expression::contains(actual, &needle)
        .ok_or_else(|| ApiTestError::Assert(format!("cannot check whether {actual} contains {expected}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response() -> ResponseMeta {
        ResponseMeta {
            status_code: 200,
            json: json!({"code": 0, "data": {"email": "a@example.com", "tags": ["x", "y"]}}),
            ..Default::default()
        }
    }

    #[test]
    fn test_comparator_table() {
        assert!(compare(Comparator::Contains, &json!("example.com"), &json!("com")).unwrap());
        assert!(!compare(Comparator::LenGt, &json!("ab"), &json!("abc")).unwrap());
        assert!(compare(Comparator::LenGt, &json!("abcd"), &json!("abc")).unwrap());
        assert!(compare(Comparator::LenEq, &json!(["x", "y"]), &json!(2)).unwrap());
        assert!(compare(Comparator::Eq, &json!(200), &json!("200")).unwrap());
        assert!(compare(Comparator::Gt, &json!("10"), &json!(9)).unwrap());
        assert!(compare(Comparator::StrEq, &json!(true), &json!("true")).unwrap());
        assert!(compare(Comparator::Startswith, &json!("example.com"), &json!("exa")).unwrap());
        assert!(!compare(Comparator::NotContains, &json!(["x"]), &json!("x")).unwrap());
    }

    #[test]
    fn test_structured_failure_uses_check_message() {
        let assertion = StructuredAssert {
            check: Some("email domain".to_string()),
            value: json!("test.org"),
            comparator: Comparator::Endswith,
            jsonpath: "$.data.email".to_string(),
            sql: None,
        };
        let err = assert_structured(&assertion, &response(), None).unwrap_err();
        assert!(err.is_assertion_failure());
        assert!(err.to_string().contains("email domain"));
    }

    #[test]
    fn test_missing_jsonpath_is_not_an_assertion_failure() {
        let assertion = StructuredAssert {
            check: None,
            value: json!(1),
            comparator: Comparator::Eq,
            jsonpath: "$.data.missing".to_string(),
            sql: None,
        };
        let err = assert_structured(&assertion, &response(), None).unwrap_err();
        assert!(matches!(err, ApiTestError::JsonPathFind(_)));
    }

    #[test]
    fn test_syntax_error_fails_before_evaluation() {
        let items = vec![
            AssertItem::Code("assert 500 == pm.response.get('status_code')".to_string()),
            AssertItem::Code("assert 200 === pm.response.get('status_code')".to_string()),
        ];
        let err = run_assertions(&items, &response(), None, "t.yaml:teardown[0]:assert").unwrap_err();
        assert!(matches!(err, ApiTestError::AssertSyntax(_)));
        assert!(err.to_string().contains("t.yaml:teardown[0]:assert[1]"));
    }
}
