use std::collections::HashMap;

use serde_json::Value;

use crate::constants::PATH_SEPARATOR;
use crate::error::{ApiTestError, Result};
use crate::executor::boxed_execute_case;
use crate::extract::find_first;
use crate::models::{TestcaseRef, Verdict};
use crate::progress;
use crate::session::Session;
use crate::variables::stringify;

/// Per-case execution state within a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaseState {
    #[default]
    Pending,
    ResolvingDependencies,
    Executing,
    Done,
}

/// One loaded document: its raw config and raw steps
#[derive(Debug, Clone)]
struct CaseDocument {
    location: String,
    config: Option<Value>,
    steps: Vec<Value>,
}

/// A step looked up by `case_id`, still unresolved
#[derive(Debug, Clone, Copy)]
pub struct CaseEntry<'a> {
    pub case_id: &'a str,
    // location of the owning document, e.g. "cases.yaml"
    pub document: &'a str,
    pub location: &'a str,
    pub config: Option<&'a Value>,
    pub step: &'a Value,
}

#[derive(Debug, Clone)]
struct IndexedStep {
    document: usize,
    step: usize,
    location: String,
}

/// Every loaded step, indexed by `case_id`. Built once per session.
#[derive(Debug, Clone, Default)]
pub struct CaseSet {
    documents: Vec<CaseDocument>,
    index: HashMap<String, IndexedStep>,
    order: Vec<String>,
}

impl CaseSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document `{config, test_steps}`. A `case_id` seen before is a `DuplicateCaseId` error naming both locations.
    pub fn add_document(&mut self, location: &str, document: Value) -> Result<()> {
        let Value::Object(mut fields) = document else {
            return Err(ApiTestError::RequestDataParse(format!(
                "{location}: expected a mapping with config and test_steps"
            )));
        };

        let steps = match fields.remove("test_steps") {
            Some(Value::Array(steps)) => steps,
            Some(step @ Value::Object(_)) => vec![step],
            _ => {
                return Err(ApiTestError::RequestDataParse(format!(
                    "{location}{PATH_SEPARATOR}test_steps: missing; expected a step mapping or a list of steps"
                )))
            }
        };

        let document_index = self.documents.len();
        let mut added: Vec<(String, IndexedStep)> = Vec::with_capacity(steps.len());
        for (step_index, step) in steps.iter().enumerate() {
            let step_location = format!("{location}{PATH_SEPARATOR}test_steps[{step_index}]");
            let case_id = step
                .get("case_id")
                .and_then(Value::as_str)
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| {
                    ApiTestError::RequestDataParse(format!("{step_location}{PATH_SEPARATOR}case_id: missing required string"))
                })?
                .to_string();

            let first = self
                .index
                .get(&case_id)
                .map(|indexed| indexed.location.clone())
                .or_else(|| {
                    added
                        .iter()
                        .find(|(id, _)| *id == case_id)
                        .map(|(_, indexed)| indexed.location.clone())
                });
            if let Some(first) = first {
                return Err(ApiTestError::DuplicateCaseId {
                    case_id,
                    first,
                    second: step_location,
                });
            }

            added.push((
                case_id,
                IndexedStep {
                    document: document_index,
                    step: step_index,
                    location: step_location,
                },
            ));
        }

        self.documents.push(CaseDocument {
            location: location.to_string(),
            config: fields.remove("config"),
            steps,
        });
        for (case_id, indexed) in added {
            self.order.push(case_id.clone());
            self.index.insert(case_id, indexed);
        }
        Ok(())
    }

    pub fn get(&self, case_id: &str) -> Option<CaseEntry<'_>> {
        let (case_id, indexed) = self.index.get_key_value(case_id)?;
        let document = self.documents.get(indexed.document)?;
        Some(CaseEntry {
            case_id,
            document: &document.location,
            location: &indexed.location,
            config: document.config.as_ref(),
            step: document.steps.get(indexed.step)?,
        })
    }

    pub fn contains(&self, case_id: &str) -> bool {
        self.index.contains_key(case_id)
    }

    /// Case ids in load order
    pub fn case_ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Case ids referenced by the `setup` testcase actions of a raw step
pub fn referenced_ids(step: &Value) -> Vec<String> {
    fn push_ref(value: &Value, ids: &mut Vec<String>) {
        match value {
            Value::String(id) => ids.push(id.clone()),
            Value::Object(fields) => {
                if let Some(Value::String(id)) = fields.get("case_id") {
                    ids.push(id.clone());
                }
            }
            Value::Array(items) => items.iter().for_each(|item| push_ref(item, ids)),
            _ => {}
        }
    }

    let mut ids = Vec::new();
    if let Some(Value::Array(actions)) = step.get("setup") {
        for action in actions {
            if let Some(testcase) = action.get("testcase") {
                push_ref(testcase, &mut ids);
            }
        }
    }
    ids
}

/// Reject a dependency from `current` on `referenced` that cannot terminate:
/// a self-reference, a missing case, a back-edge from `referenced` to `current`,
/// or a reference to a case that is already being resolved further up the stack.
pub fn check_dependency(cases: &CaseSet, active: &[String], current: &str, referenced: &str, location: &str) -> Result<()> {
    if referenced == current {
        return Err(ApiTestError::CorrelateTestCase(format!(
            "{location}: case '{current}' references itself"
        )));
    }

    let entry = cases.get(referenced).ok_or_else(|| {
        ApiTestError::CorrelateTestCase(format!(
            "{location}: case '{referenced}' referenced by '{current}' was not found in the loaded documents"
        ))
    })?;

    if referenced_ids(entry.step).iter().any(|id| id == current) {
        return Err(ApiTestError::CorrelateTestCase(format!(
            "{location}: circular reference, '{current}' depends on '{referenced}' ({}) which depends on '{current}'",
            entry.location
        )));
    }

    if let Some(position) = active.iter().position(|id| id == referenced) {
        let mut chain: Vec<&str> = active[position..].iter().map(String::as_str).collect();
        if chain.last() != Some(&current) {
            chain.push(current);
        }
        chain.push(referenced);
        return Err(ApiTestError::CorrelateTestCase(format!(
            "{location}: circular reference {}",
            chain.join(" -> ")
        )));
    }

    Ok(())
}

/// Run the cases of one `setup.testcase` action quietly and store the requested extractions as relation variables.
pub async fn run_testcase_action(
    session: &mut Session,
    current: &str,
    references: &[TestcaseRef],
    location: &str,
    quiet: bool,
) -> Result<()> {
    for reference in references {
        let referenced = reference.case_id();
        check_dependency(&session.cases, session.active(), current, referenced, location)?;

        log::debug!("{location}: '{current}' depends on '{referenced}'");
        let report = boxed_execute_case(session, referenced, true).await?;

        match &report.verdict {
            Verdict::Passed => {}
            Verdict::Failed(reason) | Verdict::Error(reason) => {
                return Err(ApiTestError::CorrelateTestCase(format!(
                    "{location}: dependency '{referenced}' did not pass: {reason}"
                )));
            }
            Verdict::Skipped(reason) => {
                return Err(ApiTestError::CorrelateTestCase(format!(
                    "{location}: dependency '{referenced}' was skipped: {reason}"
                )));
            }
        }

        if let TestcaseRef::Extract { key, jsonpath, .. } = reference {
            match (key, jsonpath) {
                (Some(key), Some(jsonpath)) => {
                    let Some(response) = &report.response else {
                        return Err(ApiTestError::CorrelateTestCase(format!(
                            "{location}: dependency '{referenced}' produced no response to extract '{key}' from"
                        )));
                    };
                    let value = find_first(&response.json, jsonpath, location)?;
                    session.store.set_relation(key, &stringify(&value));
                    progress!(quiet, "Relation variable ^{key} populated from '{referenced}'");
                }
                (None, None) => {}
                _ => {
                    return Err(ApiTestError::RequestDataParse(format!(
                        "{location}: expected both key and jsonpath next to case_id '{referenced}'"
                    )));
                }
            }
        }
    }
    Ok(())
}
