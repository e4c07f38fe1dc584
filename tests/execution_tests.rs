use std::sync::Arc;

use apicase::database::{SqlClient, SqliteClient};
use apicase::models::{CaseReport, Scope, Verdict};
use apicase::relations::CaseSet;
use apicase::settings::Settings;
use apicase::variables::{MemoryCache, VariableStore};
use apicase::Session;
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn document(yaml: &str) -> Value {
    serde_yaml::from_str(yaml).unwrap()
}

fn settings() -> Settings {
    Settings {
        retry: 0,
        ..Default::default()
    }
}

fn session(server: &MockServer, documents: &[&str]) -> Session {
    let mut cases = CaseSet::new();
    for (index, yaml) in documents.iter().enumerate() {
        cases.add_document(&format!("case_{index}.yaml"), document(yaml)).unwrap();
    }
    let store = VariableStore::new(Box::new(MemoryCache::new())).with_env([("HOST", server.uri())]);
    Session::new(settings(), store, cases)
}

fn failure(report: &CaseReport) -> &str {
    match &report.verdict {
        Verdict::Failed(reason) | Verdict::Error(reason) => reason,
        other => panic!("expected a failing verdict, got {other:?}"),
    }
}

#[tokio::test]
async fn test_extract_and_assert() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": {"id": 1, "token": "abc"}})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut session = session(
        &mock_server,
        &[r#"
test_steps:
  - name: fetch user
    case_id: user_01
    request:
      method: GET
      url: /users/1
    teardown:
      - extract:
          key: token
          jsonpath: $.data.token
      - assert:
          - "assert 200 == pm.response.get('status_code')"
          - "assert pm.response.get('json').get('data').get('id') == IsInt, 'id is an integer'"
          - {value: 0, type: eq, jsonpath: $.code}
          - {value: 2, type: len_eq, jsonpath: $.data}
"#],
    );

    let report = session.run_case("user_01").await.unwrap();
    assert_eq!(report.verdict, Verdict::Passed);
    assert_eq!(report.name, "fetch user");
    assert_eq!(report.response.as_ref().map(|r| r.status_code), Some(200));
    assert_eq!(session.store.get("token", Some(Scope::Cache)).unwrap(), "abc");
}

#[tokio::test]
async fn test_false_assertion_fails_the_case() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&mock_server)
        .await;

    let mut session = session(
        &mock_server,
        &[r#"
test_steps:
  case_id: health
  request: {method: GET, url: /health}
  teardown:
    - assert: "assert 500 == pm.response.get('status_code'), 'expected a server error'"
"#],
    );

    let report = session.run_case("health").await.unwrap();
    assert!(matches!(&report.verdict, Verdict::Failed(reason) if reason.contains("expected a server error")));
    assert!(failure(&report).contains("case_0.yaml:test_steps[0]:teardown[0]:assert[0]"));
}

#[tokio::test]
async fn test_skipped_case_sends_nothing() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let mut session = session(
        &mock_server,
        &[r#"
test_steps:
  - case_id: disabled
    is_run: false
    request: {method: GET, url: /never}
  - case_id: conditional
    is_run:
      skip_if: ["'dev' in ['dev', 'test']"]
      reason: not on dev
    request: {method: GET, url: /never}
"#],
    );

    let reports = session.run_all().await.unwrap();
    assert!(matches!(reports[0].verdict, Verdict::Skipped(_)));
    assert_eq!(reports[1].verdict, Verdict::Skipped("not on dev".to_string()));
}

#[tokio::test]
async fn test_variables_and_functions_in_request() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(query_param("count", "3"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"x": "1", "user": "u-7"})))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut session = session(
        &mock_server,
        &[r#"
test_steps:
  - case_id: order_01
    request:
      method: POST
      url: /orders
      params: {count: "${add(1, 2)}"}
      body_type: json
      body: {x: "$v", user: "u-${uid}"}
    teardown:
      - assert: "assert 201 == pm.response.get('status_code')"
"#],
    );
    session.store.set("v", "1", Scope::Cache, None).unwrap();
    session.store.set("uid", "7", Scope::Cache, None).unwrap();

    let report = session.run_case("order_01").await.unwrap();
    assert_eq!(report.verdict, Verdict::Passed);
}

#[tokio::test]
async fn test_missing_variable_is_an_error_naming_the_field() {
    let mock_server = MockServer::start().await;
    let mut session = session(
        &mock_server,
        &[r#"
test_steps:
  - case_id: broken
    request: {method: GET, url: "/users/${missing_id}"}
"#],
    );

    let report = session.run_case("broken").await.unwrap();
    let reason = failure(&report);
    assert!(matches!(report.verdict, Verdict::Error(_)));
    assert!(reason.contains("missing_id"));
}

#[tokio::test]
async fn test_dependency_populates_relation_variable() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"token": "t-1"}})))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(header("authorization", "Bearer t-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut session = session(
        &mock_server,
        &[
            r#"
test_steps:
  - case_id: login
    request: {method: POST, url: /login}
"#,
            r#"
test_steps:
  - case_id: orders
    setup:
      - testcase: {case_id: login, key: token, jsonpath: $.data.token}
    request:
      method: GET
      url: /orders
      headers: {Authorization: "Bearer ^token"}
"#,
        ],
    );

    let reports = session.run_selected(&["orders".to_string()]).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].verdict, Verdict::Passed);
    assert!(session.store.get_relation("token").is_err());
}

#[tokio::test]
async fn test_failing_dependency_fails_the_dependent() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let mut session = session(
        &mock_server,
        &[r#"
test_steps:
  - case_id: login
    request: {method: POST, url: /login}
    teardown:
      - assert: "assert 200 == pm.response.get('status_code')"
  - case_id: profile
    setup:
      - testcase: login
    request: {method: GET, url: /me}
"#],
    );

    let report = session.run_case("profile").await.unwrap();
    assert!(matches!(report.verdict, Verdict::Error(_)));
    assert!(failure(&report).contains("dependency 'login' did not pass"));
}

#[tokio::test]
async fn test_circular_dependency_is_rejected() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let mut session = session(
        &mock_server,
        &[r#"
test_steps:
  - case_id: a
    setup: [{testcase: b}]
    request: {method: GET, url: /a}
  - case_id: b
    setup: [{testcase: c}]
    request: {method: GET, url: /b}
  - case_id: c
    setup: [{testcase: a}]
    request: {method: GET, url: /c}
  - case_id: self
    setup: [{testcase: self}]
    request: {method: GET, url: /self}
"#],
    );

    let report = session.run_case("a").await.unwrap();
    assert!(failure(&report).contains("circular reference"));

    let report = session.run_case("self").await.unwrap();
    assert!(failure(&report).contains("references itself"));
}

#[tokio::test]
async fn test_chain_of_dependencies_runs() {
    let mock_server = MockServer::start().await;
    for (route, body) in [("/a", json!({"id": "A"})), ("/b", json!({"id": "B"})), ("/c", json!({"id": "C"}))] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&mock_server)
            .await;
    }

    let mut session = session(
        &mock_server,
        &[r#"
test_steps:
  - case_id: a
    setup: [{testcase: {case_id: b, key: b_id, jsonpath: $.id}}]
    request: {method: GET, url: /a, params: {b: "^b_id"}}
  - case_id: b
    setup: [{testcase: c}]
    request: {method: GET, url: /b}
  - case_id: c
    request: {method: GET, url: /c}
"#],
    );

    let report = session.run_case("a").await.unwrap();
    assert_eq!(report.verdict, Verdict::Passed);
    let request = report.request.unwrap();
    assert_eq!(request.params, vec![("b".to_string(), "B".to_string())]);
}

#[tokio::test]
async fn test_sql_setup_and_teardown() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .and(query_param("name", "alice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total": 1})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let database = SqliteClient::in_memory().unwrap();
    database.execute("create table users (id integer primary key, name text)").unwrap();
    database.execute("insert into users (id, name) values (1, 'alice')").unwrap();

    let mut session = session(
        &mock_server,
        &[r#"
test_steps:
  - case_id: search
    setup:
      - sql: "select name from users where id = 1"
    request:
      method: GET
      url: /users
      params: {name: "^name"}
    teardown:
      - sql: "select id, name as user_name from users where id = 1"
      - assert:
          - "assert 'alice' == pm.response.get('sql_data').get('user_name')"
          - {value: "alice", type: eq, jsonpath: $.name, sql: "select name from users where id = 1"}
"#],
    )
    .with_database(Arc::new(database));

    let report = session.run_case("search").await.unwrap();
    assert_eq!(report.verdict, Verdict::Passed);
    assert_eq!(session.store.get("user_name", None).unwrap(), "alice");
}

#[tokio::test]
async fn test_write_statements_are_rejected() {
    let mock_server = MockServer::start().await;
    let mut session = session(
        &mock_server,
        &[r#"
test_steps:
  - case_id: cleanup
    setup:
      - sql: "delete from users"
    request: {method: GET, url: /}
"#],
    )
    .with_database(Arc::new(SqliteClient::in_memory().unwrap()));

    let report = session.run_case("cleanup").await.unwrap();
    assert!(failure(&report).contains("write keyword 'delete'"));
}

#[tokio::test]
async fn test_unreachable_host_is_retried_then_fails() {
    let mut cases = CaseSet::new();
    cases
        .add_document(
            "down.yaml",
            document(
                r#"
config:
  retry: 2
  timeout: 1
test_steps:
  - case_id: down
    request: {method: GET, url: "http://127.0.0.1:1/health"}
"#,
            ),
        )
        .unwrap();
    let mut session = Session::new(settings(), VariableStore::new(Box::new(MemoryCache::new())), cases);

    let report = session.run_case("down").await.unwrap();
    assert!(matches!(report.verdict, Verdict::Error(_)));
    assert!(failure(&report).contains("failed after 3 attempt(s)"));
}

#[tokio::test]
async fn test_blocking_engine() {
    let mock_server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/items/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"updated": true})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut session = session(
        &mock_server,
        &[r#"
config:
  engine: blocking
test_steps:
  - case_id: update
    request:
      method: PUT
      url: /items/9
      body_type: urlencoded
      body: {name: box}
    teardown:
      - assert: {value: true, type: eq, jsonpath: $.updated}
"#],
    );

    let report = session.run_case("update").await.unwrap();
    assert_eq!(report.verdict, Verdict::Passed);
}

#[tokio::test]
async fn test_auth_token_is_fetched_once() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tk"})))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("authorization", "Bearer tk"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&mock_server)
        .await;

    let mut cases = CaseSet::new();
    cases
        .add_document(
            "me.yaml",
            document(
                r#"
test_steps:
  - case_id: me_1
    request: {method: GET, url: /me}
  - case_id: me_2
    request: {method: GET, url: /me}
"#,
            ),
        )
        .unwrap();
    let settings = Settings {
        auth: Some(serde_json::from_value(json!({"url": "/login", "token_jsonpath": "$.token"})).unwrap()),
        ..settings()
    };
    let store = VariableStore::new(Box::new(MemoryCache::new())).with_env([("HOST", mock_server.uri())]);
    let mut session = Session::new(settings, store, cases);

    let reports = session.run_all().await.unwrap();
    assert!(reports.iter().all(|report| report.verdict == Verdict::Passed));
}
