use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::LevelFilter;
use thiserror::Error;

use crate::constants::DEFAULT_SETTINGS_FILE;

#[derive(Debug, Error)]
pub enum CliParameterError {
    #[error("No case files specified")]
    NoInputFiles,

    #[error("Case file not found: {file}")]
    FileNotFound { file: String },

    #[error("Unsupported case file '{file}': expected a .yaml, .yml or .json document")]
    UnsupportedFormat { file: String },

    #[error("Settings file not found: {file}")]
    SettingsNotFound { file: String },
}

#[derive(Parser, Debug, Default)]
#[command(name = "apicase")]
#[command(
    about = "A data-driven API test runner.",
    long_about = "A data-driven API test runner. Cases are YAML or JSON documents with requests, setup and teardown actions, extractions and assertions. Cases can depend on each other and share variables across the cache, env and global tiers."
)]
pub struct CliParameters {
    // Settings file; apicase.yaml in the working directory when omitted.
    #[arg(short = 's', long)]
    pub settings: Option<String>,

    // Environment name, overrides `env` of the settings file.
    #[arg(short = 'e', long)]
    pub env: Option<String>,

    // Debug logging.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    // Run only these case ids (repeatable). Their dependencies still run.
    #[arg(short = 'c', long = "case")]
    pub cases: Vec<String>,

    // the case documents to load
    #[arg()]
    pub input_files: Vec<String>,
}

impl CliParameters {
    pub fn validate(&self) -> Result<(), CliParameterError> {
        if self.input_files.is_empty() {
            return Err(CliParameterError::NoInputFiles);
        }

        for file in &self.input_files {
            if fs::metadata(file).is_err() {
                return Err(CliParameterError::FileNotFound { file: file.clone() });
            }
            if !is_case_document(Path::new(file)) {
                return Err(CliParameterError::UnsupportedFormat { file: file.clone() });
            }
        }

        if let Some(settings) = &self.settings {
            if fs::metadata(settings).is_err() {
                return Err(CliParameterError::SettingsNotFound { file: settings.clone() });
            }
        }

        Ok(())
    }

    pub fn settings_path(&self) -> PathBuf {
        PathBuf::from(self.settings.as_deref().unwrap_or(DEFAULT_SETTINGS_FILE))
    }

    pub fn log_level(&self) -> LevelFilter {
        if self.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        }
    }
}

/// `.yaml`, `.yml` or `.json`
pub fn is_case_document(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()).map(str::to_lowercase).as_deref(),
        Some("yaml" | "yml" | "json")
    )
}
