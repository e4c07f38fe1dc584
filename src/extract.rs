use jsonpath::Selector;
use serde_json::Value;

use crate::error::{ApiTestError, Result};

/// All matches of a JSONPath expression
pub fn find_all(value: &Value, path: &str, location: &str) -> Result<Vec<Value>> {
    let selector = Selector::new(path).map_err(|e| {
        ApiTestError::JsonPathFind(format!("{location}: invalid jsonpath '{path}': {e}"))
    })?;
    Ok(selector.find(value).cloned().collect())
}

/// The first match of a JSONPath expression. No match is a `JsonPathFindError`.
pub fn find_first(value: &Value, path: &str, location: &str) -> Result<Value> {
    find_all(value, path, location)?
        .into_iter()
        .next()
        .ok_or_else(|| {
            ApiTestError::JsonPathFind(format!(
                "{location}: jsonpath '{path}' found nothing in {}",
                preview(value)
            ))
        })
}

// keeps error messages readable for large bodies
fn preview(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 200 {
        format!("{}...", text.chars().take(200).collect::<String>())
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_find_first_nested_value() {
        let body = json!({"data": {"items": [{"id": 1}, {"id": 2}]}});
        assert_eq!(find_first(&body, "$.data.items[1].id", "t").unwrap(), json!(2));
    }

    #[test]
    fn test_find_first_missing_path() {
        let body = json!({"data": {}});
        let err = find_first(&body, "$.data.token", "case.yaml:teardown[0]").unwrap_err();
        assert!(matches!(err, ApiTestError::JsonPathFind(_)));
        assert!(err.to_string().contains("case.yaml:teardown[0]"));
    }
}
