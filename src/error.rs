use thiserror::Error;

/// Represents all possible errors raised while resolving and executing a case
#[derive(Error, Debug)]
pub enum ApiTestError {
    #[error("Config init error: {0}")]
    ConfigInit(String),

    #[error("Variable error: {0}")]
    Variable(String),

    #[error("Function error: {0}")]
    Function(String),

    #[error("Request data parse error: {0}")]
    RequestDataParse(String),

    #[error("Correlate testcase error: {0}")]
    CorrelateTestCase(String),

    #[error("Send request error: {0}")]
    SendRequest(String),

    #[error("JSONPath find error: {0}")]
    JsonPathFind(String),

    #[error("Assert syntax error: {0}")]
    AssertSyntax(String),

    #[error("Assert error: {0}")]
    Assert(String),

    #[error("SQL syntax error: {0}")]
    SqlSyntax(String),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("Duplicate case_id '{case_id}' found in {first} and {second}")]
    DuplicateCaseId {
        case_id: String,
        first: String,
        second: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl ApiTestError {
    /// Whether the error is an assertion that evaluated to false,
    /// as opposed to a broken document or a failing collaborator.
    pub fn is_assertion_failure(&self) -> bool {
        matches!(self, ApiTestError::Assert(_))
    }

    /// Prefix the message with a document location, e.g. `cases.yaml:test_steps[0]:teardown[1]`
    pub fn at(self, location: &str) -> Self {
        match self {
            ApiTestError::ConfigInit(m) => ApiTestError::ConfigInit(format!("{location}: {m}")),
            ApiTestError::Variable(m) => ApiTestError::Variable(format!("{location}: {m}")),
            ApiTestError::Function(m) => ApiTestError::Function(format!("{location}: {m}")),
            ApiTestError::RequestDataParse(m) => ApiTestError::RequestDataParse(format!("{location}: {m}")),
            ApiTestError::CorrelateTestCase(m) => ApiTestError::CorrelateTestCase(format!("{location}: {m}")),
            ApiTestError::SendRequest(m) => ApiTestError::SendRequest(format!("{location}: {m}")),
            ApiTestError::JsonPathFind(m) => ApiTestError::JsonPathFind(format!("{location}: {m}")),
            ApiTestError::AssertSyntax(m) => ApiTestError::AssertSyntax(format!("{location}: {m}")),
            ApiTestError::Assert(m) => ApiTestError::Assert(format!("{location}: {m}")),
            ApiTestError::SqlSyntax(m) => ApiTestError::SqlSyntax(format!("{location}: {m}")),
            ApiTestError::Sql(m) => ApiTestError::Sql(format!("{location}: {m}")),
            ApiTestError::Database(e) => ApiTestError::Sql(format!("{location}: {e}")),
            ApiTestError::Io(e) => ApiTestError::RequestDataParse(format!("{location}: {e}")),
            other => other,
        }
    }
}

/// Type alias for Result with ApiTestError
pub type Result<T> = std::result::Result<T, ApiTestError>;
