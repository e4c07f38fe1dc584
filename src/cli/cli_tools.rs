use std::fs;
use std::path::Path;

use colored::*;
use serde_json::Value;

use crate::error::{ApiTestError, Result};
use crate::models::{CaseReport, Verdict};
use crate::relations::CaseSet;

pub struct CliTools;

impl CliTools {
    /// Prints a message in green color
    pub fn print_green(message: &str) {
        println!("{}", message.green());
    }

    /// Prints a message in red color
    pub fn print_red(message: &str) {
        println!("{}", message.red());
    }

    /// Read a case document. JSON is a subset of YAML, so both go through serde_yaml.
    pub fn load_document(path: &Path) -> Result<Value> {
        let content = fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| {
            ApiTestError::RequestDataParse(format!("{}: {e}", path.display()))
        })
    }

    /// Load every file into one case set, in argument order
    pub fn load_cases(files: &[String]) -> Result<CaseSet> {
        let mut cases = CaseSet::new();
        for file in files {
            let document = Self::load_document(Path::new(file))?;
            cases.add_document(file, document)?;
            log::debug!("Loaded {file}");
        }
        Ok(cases)
    }

    /// Print the case verdicts followed by a summary line
    pub fn print_reports(reports: &[CaseReport]) {
        println!("\n{}", "=== Execution Results ===".bold());

        for report in reports {
            let elapsed = report
                .response
                .as_ref()
                .map(|response| format!(" ({:.0}ms)", response.stat.execute_time))
                .unwrap_or_default();
            match &report.verdict {
                Verdict::Passed => Self::print_green(&format!("✓ {} {}{elapsed}", report.case_id, report.name)),
                Verdict::Skipped(reason) => {
                    println!("{}", format!("- {} skipped: {reason}", report.case_id).yellow())
                }
                Verdict::Failed(reason) => Self::print_red(&format!("✗ {} failed: {reason}", report.case_id)),
                Verdict::Error(reason) => Self::print_red(&format!("✗ {} error: {reason}", report.case_id)),
            }
        }

        let count = |f: fn(&Verdict) -> bool| reports.iter().filter(|r| f(&r.verdict)).count();
        let passed = count(|v| matches!(v, Verdict::Passed));
        let skipped = count(|v| matches!(v, Verdict::Skipped(_)));
        let failed = reports.len() - passed - skipped;

        let summary = format!("Summary: {passed} passed, {failed} failed, {skipped} skipped");
        if failed == 0 {
            Self::print_green(&summary);
        } else {
            Self::print_red(&summary);
        }
    }

    /// True when no case failed or errored. Skipped cases count as successful.
    pub fn all_passed(reports: &[CaseReport]) -> bool {
        reports
            .iter()
            .all(|report| matches!(report.verdict, Verdict::Passed | Verdict::Skipped(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn report(case_id: &str, verdict: Verdict) -> CaseReport {
        CaseReport {
            case_id: case_id.to_string(),
            name: String::new(),
            location: "cases.yaml:test_steps[0]".to_string(),
            allure: Map::new(),
            verdict,
            request: None,
            response: None,
            events: Vec::new(),
        }
    }

    #[test]
    fn test_all_passed_counts_skips_as_success() {
        let reports = vec![report("a", Verdict::Passed), report("b", Verdict::Skipped("off".into()))];
        assert!(CliTools::all_passed(&reports));

        let reports = vec![report("a", Verdict::Passed), report("c", Verdict::Failed("no".into()))];
        assert!(!CliTools::all_passed(&reports));
    }

    #[test]
    fn test_load_json_and_yaml_documents() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("a.yaml");
        let json = dir.path().join("b.json");
        fs::write(&yaml, "test_steps:\n  - case_id: a\n    request: {method: GET, url: /a}\n").unwrap();
        fs::write(&json, r#"{"test_steps": [{"case_id": "b", "request": {"method": "GET", "url": "/b"}}]}"#).unwrap();

        let files = vec![yaml.display().to_string(), json.display().to_string()];
        let cases = CliTools::load_cases(&files).unwrap();
        assert_eq!(cases.case_ids(), ["a".to_string(), "b".to_string()]);
    }
}
