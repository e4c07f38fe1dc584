
// path separator used in document locations, e.g. "cases.yaml:test_steps[0]:request:headers"
pub const PATH_SEPARATOR: &str = ":";

// upper bound on repeated macro passes, a value expanding into itself would loop forever otherwise
pub const MAX_RESOLVE_ROUNDS: usize = 32;

// environment tier key holding the base URL of the target system
pub const HOST_KEY: &str = "HOST";

// cache tag for relation variables (^name), keeps them apart from plain cache entries
pub const RELATION_TAG: &str = "relation";

// cache key of the authentication token
pub const AUTH_TOKEN_KEY: &str = "auth_token";

pub const DEFAULT_TIMEOUT_SECONDS: f64 = 30.0;
pub const DEFAULT_RETRY: u32 = 3;
pub const DEFAULT_AUTH_TTL_SECONDS: u64 = 3600;
pub const RETRY_BASE_DELAY_MS: u64 = 100;

pub const DEFAULT_SETTINGS_FILE: &str = "apicase.yaml";
pub const DEFAULT_ENV_NAME: &str = "dev";
pub const DEFAULT_ENV_DIR: &str = "environments";
pub const DEFAULT_GLOBAL_FILE: &str = "globals.yaml";
pub const DEFAULT_FILES_DIR: &str = "files";
