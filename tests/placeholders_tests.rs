use apicase::functions::FunctionRegistry;
use apicase::models::Scope;
use apicase::placeholders::{evaluate_hook, replace_placeholders, replace_relations};
use apicase::variables::{MemoryCache, VariableStore};
use apicase::ApiTestError;
use serde_json::json;

fn store() -> VariableStore {
    let mut store = VariableStore::new(Box::new(MemoryCache::new())).with_env([("HOST", "http://api.local")]);
    store.set("uid", "42", Scope::Cache, None).unwrap();
    store
}

#[test]
fn test_resolution_covers_nested_leaves_and_is_idempotent() {
    let registry = FunctionRegistry::with_builtins();
    let store = store();
    let mut step = json!({
        "case_id": "user_$uid",
        "request": {
            "url": "/users/${uid}",
            "params": {"page": "${add(1, 1)}", "id": "$uid"},
            "body": {"ids": ["$uid", 7, null], "price$amount": "price$amount"}
        }
    });

    replace_placeholders(&mut step, &registry, &store, "cases.yaml:test_steps[0]").unwrap();
    let resolved = step.clone();
    assert_eq!(step["request"]["url"], "/users/42");
    assert_eq!(step["request"]["params"]["page"], "2");
    assert_eq!(step["request"]["params"]["id"], "42");
    assert_eq!(step["request"]["body"]["ids"], json!(["42", 7, null]));
    // neither keys nor embedded bare names are touched
    assert_eq!(step["request"]["body"]["price$amount"], "price$amount");
    assert_eq!(step["case_id"], "user_$uid");

    replace_placeholders(&mut step, &registry, &store, "cases.yaml:test_steps[0]").unwrap();
    assert_eq!(step, resolved);
}

#[test]
fn test_hook_payloads_wait_until_the_hook_runs() {
    let mut registry = FunctionRegistry::with_builtins();
    registry.register("seed", |_| Ok("seeded".to_string()));
    let mut step = json!({
        "setup": [{"hook": "${seed()}"}],
        "request": {"url": "/${seed()}"}
    });

    replace_placeholders(&mut step, &registry, &store(), "hooks.yaml").unwrap();
    assert_eq!(step["setup"][0]["hook"], "${seed()}");
    assert_eq!(step["request"]["url"], "/seeded");
    assert_eq!(evaluate_hook("${seed()}", &registry, "hooks.yaml:setup[0]").unwrap(), "seeded");
    assert!(evaluate_hook("print(1)", &registry, "hooks.yaml:setup[0]").is_err());
}

#[test]
fn test_unknown_function_and_variable_errors_name_the_path() {
    let registry = FunctionRegistry::with_builtins();

    let mut doc = json!({"request": {"headers": {"X-Run": "${eval(1)}"}}});
    let err = replace_placeholders(&mut doc, &registry, &store(), "a.yaml").unwrap_err();
    assert!(matches!(err, ApiTestError::Function(_)));
    assert!(err.to_string().contains("a.yaml:request:headers:X-Run"));

    let mut doc = json!({"request": {"url": "/${nope}"}});
    let err = replace_placeholders(&mut doc, &registry, &store(), "a.yaml").unwrap_err();
    assert!(matches!(err, ApiTestError::Variable(_)));
    assert!(err.to_string().contains("a.yaml:request:url"));
}

#[test]
fn test_relation_entries_are_consumed() {
    let mut store = store();
    store.set_relation("token", "t-1");

    let mut request = json!({"headers": {"Authorization": "Bearer ^token", "X-Again": "^{token}"}});
    replace_relations(&mut request, &mut store, "a.yaml:request").unwrap();
    assert_eq!(request["headers"]["Authorization"], "Bearer t-1");
    assert_eq!(request["headers"]["X-Again"], "t-1");

    let mut again = json!({"headers": {"Authorization": "Bearer ^token"}});
    let err = replace_relations(&mut again, &mut store, "b.yaml:request").unwrap_err();
    assert!(matches!(err, ApiTestError::Variable(_)));
    assert!(err.to_string().contains("b.yaml:request:headers:Authorization"));
}

#[test]
fn test_long_templates_resolve_every_placeholder() {
    let registry = FunctionRegistry::with_builtins();
    let store = store();
    let template = " $uid".repeat(40);
    let macros = "${add(1, 2)}-".repeat(40);
    let mut body = json!({"request": {"body": template, "data": macros}});

    replace_placeholders(&mut body, &registry, &store, "long.yaml").unwrap();
    assert_eq!(body["request"]["body"], " 42".repeat(40));
    assert_eq!(body["request"]["data"], "3-".repeat(40));
}

#[test]
fn test_variables_expanding_into_themselves_are_bounded() {
    let registry = FunctionRegistry::with_builtins();
    let mut store = store();
    store.set("loop", "$loop", Scope::Cache, None).unwrap();
    store.set("outer", "${uid}", Scope::Cache, None).unwrap();

    let mut doc = json!({"request": {"url": "/${outer}"}});
    replace_placeholders(&mut doc, &registry, &store, "nested.yaml").unwrap();
    assert_eq!(doc["request"]["url"], "/42");

    let mut doc = json!({"request": {"body": "$loop"}});
    let err = replace_placeholders(&mut doc, &registry, &store, "loop.yaml").unwrap_err();
    assert!(matches!(err, ApiTestError::Variable(_)));
    assert!(err.to_string().contains("loop.yaml:request:body"));
}

#[test]
fn test_relation_inside_a_path_is_resolved_and_consumed() {
    let mut store = store();
    store.set_relation("uid", "7");

    let mut request = json!({"url": "/users/^uid/orders"});
    replace_relations(&mut request, &mut store, "a.yaml:request").unwrap();
    assert_eq!(request["url"], "/users/7/orders");
    assert!(store.get_relation("uid").is_err());

    let mut missing = json!({"url": "/users/^uid"});
    let err = replace_relations(&mut missing, &mut store, "b.yaml:request").unwrap_err();
    assert!(matches!(err, ApiTestError::Variable(_)));
    assert!(err.to_string().contains("b.yaml:request:url"));
}
