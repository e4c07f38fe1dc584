use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::AuthPlugin;
use crate::database::{SqlClient, SqliteClient};
use crate::error::{ApiTestError, Result};
use crate::executor::execute_case;
use crate::functions::FunctionRegistry;
use crate::models::{CaseReport, Engine};
use crate::relations::{CaseSet, CaseState};
use crate::settings::Settings;
use crate::transport::{BlockingTransport, ReqwestTransport, Transport};
use crate::variables::{MemoryCache, VariableStore};

/// Everything a test session shares between cases: variables, functions, the case index and the collaborators.
/// Lives for one run and is borrowed mutably by the case being executed.
pub struct Session {
    pub settings: Settings,
    pub store: VariableStore,
    pub registry: FunctionRegistry,
    pub cases: CaseSet,
    transports: HashMap<Engine, Arc<dyn Transport>>,
    database: Option<Arc<dyn SqlClient>>,
    auth: Option<AuthPlugin>,
    states: HashMap<String, CaseState>,
    // cases currently resolving, outermost first
    active: Vec<String>,
}

impl Session {
    /// A session with the built-in functions and both reqwest engines
    pub fn new(settings: Settings, store: VariableStore, cases: CaseSet) -> Self {
        let mut transports: HashMap<Engine, Arc<dyn Transport>> = HashMap::new();
        transports.insert(Engine::Reqwest, Arc::new(ReqwestTransport::new()));
        transports.insert(Engine::Blocking, Arc::new(BlockingTransport::new()));

        let auth = settings.auth.clone().map(AuthPlugin::new);
        Session {
            settings,
            store,
            registry: FunctionRegistry::with_builtins(),
            cases,
            transports,
            database: None,
            auth,
            states: HashMap::new(),
            active: Vec::new(),
        }
    }

    /// A session whose env and global tiers are the files named by the settings.
    /// Opens the sqlite database when one is configured.
    pub fn open(settings: Settings, cases: CaseSet) -> Result<Self> {
        log::info!("Opening session for environment '{}' with {} case(s)", settings.env, cases.len());
        let store = VariableStore::open(Box::new(MemoryCache::new()), settings.env_file(), &settings.global_file)
            .map_err(|e| ApiTestError::ConfigInit(format!("cannot load variables: {e}")))?;

        let database = match &settings.database {
            Some(path) => Some(Arc::new(SqliteClient::open(path)?) as Arc<dyn SqlClient>),
            None => None,
        };

        let mut session = Session::new(settings, store, cases);
        session.database = database;
        Ok(session)
    }

    pub fn with_registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_database(mut self, database: Arc<dyn SqlClient>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_transport(mut self, engine: Engine, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(engine, transport);
        self
    }

    pub fn with_auth(mut self, auth: AuthPlugin) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn transport(&self, engine: Engine) -> Result<Arc<dyn Transport>> {
        self.transports
            .get(&engine)
            .cloned()
            .ok_or_else(|| ApiTestError::SendRequest(format!("no transport registered for engine '{engine}'")))
    }

    pub fn database(&self) -> Option<Arc<dyn SqlClient>> {
        self.database.clone()
    }

    pub fn auth(&self) -> Option<&AuthPlugin> {
        self.auth.as_ref()
    }

    pub fn state(&self, case_id: &str) -> CaseState {
        self.states.get(case_id).copied().unwrap_or_default()
    }

    pub(crate) fn set_state(&mut self, case_id: &str, state: CaseState) {
        log::debug!("Case '{case_id}' -> {state:?}");
        self.states.insert(case_id.to_string(), state);
    }

    /// Cases whose execution is in progress, outermost first
    pub fn active(&self) -> &[String] {
        &self.active
    }

    pub(crate) fn enter(&mut self, case_id: &str) {
        self.active.push(case_id.to_string());
    }

    pub(crate) fn leave(&mut self, case_id: &str) {
        if let Some(position) = self.active.iter().rposition(|id| id == case_id) {
            self.active.truncate(position);
        }
    }

    /// Execute one case by id, dependencies first
    pub async fn run_case(&mut self, case_id: &str) -> Result<CaseReport> {
        execute_case(self, case_id, false).await
    }

    /// Execute every loaded case in document order.
    /// A failing case never stops its siblings.
    pub async fn run_all(&mut self) -> Result<Vec<CaseReport>> {
        let case_ids = self.cases.case_ids().to_vec();
        self.run_selected(&case_ids).await
    }

    pub async fn run_selected(&mut self, case_ids: &[String]) -> Result<Vec<CaseReport>> {
        log::info!("Executing {} case(s)", case_ids.len());
        let mut reports = Vec::with_capacity(case_ids.len());
        for case_id in case_ids {
            reports.push(self.run_case(case_id).await?);
        }
        Ok(reports)
    }
}
