use std::time::{Duration, Instant};

use colored::*;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::assertions::run_assertions;
use crate::database::Row;
use crate::error::{ApiTestError, Result};
use crate::extract::find_first;
use crate::models::{
    join_path, CaseReport, Config, Phase, ResponseMeta, Scope, SetupAction, Step, StepEvent, TeardownAction,
    Verdict,
};
use crate::placeholders::{evaluate_hook, replace_placeholders, replace_relations};
use crate::progress;
use crate::relations::{run_testcase_action, CaseState};
use crate::request::{normalize, skip_reason};
use crate::session::Session;
use crate::variables::stringify;

/// Execute a case and return a boxed future.
/// Dependencies execute through this, the recursive call needs a boxed return type.
pub fn boxed_execute_case<'a>(session: &'a mut Session, case_id: &'a str, quiet: bool) -> BoxFuture<'a, Result<CaseReport>> {
    Box::pin(execute_case(session, case_id, quiet))
}

/// Execute one case: resolve, setup, request, teardown.
/// Only an unknown `case_id` is returned as an error; everything else ends up in the report's verdict.
pub async fn execute_case(session: &mut Session, case_id: &str, quiet: bool) -> Result<CaseReport> {
    let entry = session.cases.get(case_id).ok_or_else(|| {
        ApiTestError::CorrelateTestCase(format!("case '{case_id}' was not found in the loaded documents"))
    })?;
    let document = entry.document.to_string();
    let raw_config = entry.config.cloned();
    let raw_step = entry.step.clone();

    let mut report = CaseReport {
        case_id: case_id.to_string(),
        name: raw_step.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        location: entry.location.to_string(),
        allure: Map::new(),
        verdict: Verdict::Passed,
        request: None,
        response: None,
        events: Vec::new(),
    };

    progress!(quiet, "Executing case '{case_id}' ({})", report.location);
    session.enter(case_id);
    let outcome = run_step(session, &mut report, &document, raw_config, raw_step, quiet).await;
    session.leave(case_id);
    session.set_state(case_id, CaseState::Done);

    report.verdict = match outcome {
        Ok(None) => Verdict::Passed,
        Ok(Some(reason)) => Verdict::Skipped(reason),
        Err(e) if e.is_assertion_failure() => Verdict::Failed(e.to_string()),
        Err(e) => Verdict::Error(e.to_string()),
    };

    match &report.verdict {
        Verdict::Passed => progress!(quiet, "✓ {} - passed", case_id.green()),
        Verdict::Skipped(reason) => progress!(quiet, "- {} - skipped: {reason}", case_id.yellow()),
        Verdict::Failed(reason) | Verdict::Error(reason) => {
            if !quiet {
                log::warn!("✗ {} - {reason}", case_id.red());
            }
        }
    }
    Ok(report)
}

/// The step sequence. `Ok(Some(reason))` means the step was skipped.
async fn run_step(
    session: &mut Session,
    report: &mut CaseReport,
    document: &str,
    raw_config: Option<Value>,
    raw_step: Value,
    quiet: bool,
) -> Result<Option<String>> {
    let started = Instant::now();
    let location = report.location.clone();

    // resolve function macros and substitution variables over config and step
    let mut config_value = raw_config.unwrap_or(Value::Null);
    replace_placeholders(
        &mut config_value,
        &session.registry,
        &session.store,
        &join_path(document, "config"),
    )?;
    let config = Config::from_value(Some(&config_value), document)?;
    if let Some(env) = config.env.as_deref().filter(|env| *env != session.settings.env) {
        log::warn!(
            "{document}: config names environment '{env}' but the session runs '{}'",
            session.settings.env
        );
    }

    let mut step_value = raw_step;
    replace_placeholders(&mut step_value, &session.registry, &session.store, &location)?;
    let step = Step::from_value(&step_value, &location)?;

    report.name = step.name.clone();
    report.allure = config.allure.clone();
    report.allure.extend(step.allure.clone());
    report.events.push(StepEvent::new(Phase::Resolve, "placeholders resolved"));

    if let Some(reason) = skip_reason(&step.is_run, &location)? {
        report.events.push(StepEvent::new(Phase::Resolve, format!("skipped: {reason}")));
        return Ok(Some(reason));
    }

    session.set_state(&step.case_id, CaseState::ResolvingDependencies);
    for (index, action) in step.setup.iter().enumerate() {
        let action_location = format!("{}[{index}]", join_path(&location, "setup"));
        run_setup_action(session, &step.case_id, action, &action_location, quiet).await?;
        report.events.push(StepEvent::new(Phase::Setup, format!("{action_location} done")));
    }

    let mut request_value = step.request.clone();
    replace_relations(&mut request_value, &mut session.store, &join_path(&location, "request"))?;

    session.set_state(&step.case_id, CaseState::Executing);
    let defaults = session.settings.request_defaults();
    let mut request = normalize(&request_value, &config, &session.store, &defaults, &location)?;
    let transport = session.transport(request.engine)?;
    if let Some(auth) = session.auth().cloned() {
        auth.apply(&mut request, &mut session.store, transport.as_ref()).await?;
    }
    report.request = Some(request.clone());

    progress!(quiet, "{} {} ({} engine)", request.method.as_str(), request.url, request.engine);
    let mut response = transport.send(&request).await?.into_meta();
    report.events.push(StepEvent::new(
        Phase::Request,
        format!("{} {} -> {}", request.method.as_str(), request.url, response.status_code),
    ));

    response.stat.execute_time = started.elapsed().as_secs_f64() * 1000.0;
    let teardown = run_teardown(session, &step, &mut response, report, &location).await;
    response.stat.execute_time = started.elapsed().as_secs_f64() * 1000.0;
    report.response = Some(response);
    teardown?;

    Ok(None)
}

async fn run_setup_action(
    session: &mut Session,
    case_id: &str,
    action: &SetupAction,
    location: &str,
    quiet: bool,
) -> Result<()> {
    match action {
        SetupAction::Testcase(references) => {
            let references = references.clone().into_vec();
            run_testcase_action(session, case_id, &references, location, quiet).await?;
        }
        SetupAction::Sql(statements) => {
            for sql in statements.clone().into_vec() {
                // each column of the first row becomes a relation variable
                if let Some(row) = query_row(session, &sql, location)? {
                    for (column, value) in row {
                        session.store.set_relation(&column, &stringify(&value));
                    }
                }
            }
        }
        SetupAction::Hook(hook) => {
            let result = evaluate_hook(hook, &session.registry, location)?;
            log::debug!("{location}: hook returned '{result}'");
        }
        SetupAction::WaitTime(seconds) => wait(*seconds, location).await?,
    }
    Ok(())
}

async fn run_teardown(
    session: &mut Session,
    step: &Step,
    response: &mut ResponseMeta,
    report: &mut CaseReport,
    location: &str,
) -> Result<()> {
    for (index, action) in step.teardown.iter().enumerate() {
        let action_location = format!("{}[{index}]", join_path(location, "teardown"));
        run_teardown_action(session, action, response, &action_location).await?;
        report.events.push(StepEvent::new(Phase::Teardown, format!("{action_location} done")));
    }
    Ok(())
}

async fn run_teardown_action(
    session: &mut Session,
    action: &TeardownAction,
    response: &mut ResponseMeta,
    location: &str,
) -> Result<()> {
    match action {
        TeardownAction::Sql(statements) => {
            for sql in statements.clone().into_vec() {
                if let Some(row) = query_row(session, &sql, location)? {
                    if !response.sql_data.is_object() {
                        response.sql_data = Value::Object(Map::new());
                    }
                    for (column, value) in row {
                        session.store.set(&column, &stringify(&value), Scope::Cache, None)?;
                        if let Value::Object(sql_data) = &mut response.sql_data {
                            sql_data.insert(column, value);
                        }
                    }
                }
            }
        }
        TeardownAction::Hook(hook) => {
            let result = evaluate_hook(hook, &session.registry, location)?;
            log::debug!("{location}: hook returned '{result}'");
        }
        TeardownAction::Extract(specs) => {
            for spec in specs.clone().into_vec() {
                let value = find_first(&response.json, &spec.jsonpath, location)?;
                log::debug!("{location}: extracted {} = {value} into the {} scope", spec.key, spec.scope);
                session.store.set(&spec.key, &stringify(&value), spec.scope, None)?;
            }
        }
        TeardownAction::Assert(items) => {
            let items = items.clone().into_vec();
            let database = session.database();
            run_assertions(&items, response, database.as_deref(), &join_path(location, "assert"))?;
        }
        TeardownAction::WaitTime(seconds) => wait(*seconds, location).await?,
    }
    Ok(())
}

fn query_row(session: &Session, sql: &str, location: &str) -> Result<Option<Row>> {
    let database = session.database().ok_or_else(|| {
        ApiTestError::Sql(format!("{location}: no database is configured; set `database` in the settings file"))
    })?;
    database.query(sql).map_err(|e| e.at(location))
}

async fn wait(seconds: f64, location: &str) -> Result<()> {
    if !(seconds >= 0.0 && seconds.is_finite()) {
        return Err(ApiTestError::RequestDataParse(format!(
            "{location}: wait_time must be a non-negative number of seconds, found {seconds}"
        )));
    }
    log::debug!("{location}: waiting {seconds}s");
    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    Ok(())
}
