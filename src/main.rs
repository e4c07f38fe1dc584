/*!
# Apicase - a data-driven API test runner

Apicase loads test cases from YAML or JSON documents and executes them against an HTTP API.
A case describes one request together with its setup and teardown actions.

## Features
- Substitution variables (`$name`) layered over cache, env and global tiers
- Function macros (`${now()}`, `${random_int(1, 9)}`)
- Case dependencies with relation variables (`^token`)
- Extraction with JSONPath into any variable tier
- Code assertions (`assert 200 == pm.response.get('status_code')`) and structured assertions
- SQL setup and teardown against a SQLite database

## Usage Examples
apicase cases/login.yaml
apicase --env staging --case login_01 cases/login.yaml cases/orders.yaml

apicase -v --settings ci/apicase.yaml cases/orders.json
*/

use std::process::ExitCode;

use anyhow::Context;
use apicase::cli::{CliParameters, CliTools};
use apicase::logger::init_logger;
use apicase::settings::Settings;
use apicase::Session;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args: CliParameters = CliParameters::parse();
    if let Err(validation_error) = args.validate() {
        CliTools::print_red(&validation_error.to_string());
        return Ok(ExitCode::FAILURE);
    }

    init_logger(args.log_level())?;

    let settings_path = args.settings_path();
    let mut settings = Settings::load(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    if let Some(env) = &args.env {
        settings.env = env.clone();
    }

    let cases = CliTools::load_cases(&args.input_files).context("Failed to load case files")?;
    let mut session = Session::open(settings, cases)?;

    let reports = if args.cases.is_empty() {
        session.run_all().await?
    } else {
        session.run_selected(&args.cases).await?
    };

    CliTools::print_reports(&reports);
    if CliTools::all_passed(&reports) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
