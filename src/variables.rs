use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::constants::RELATION_TAG;
use crate::error::{ApiTestError, Result};
use crate::models::Scope;

/// The ephemeral key-value tier. Implementations must serialize concurrent updates themselves.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>);
    fn delete(&mut self, key: &str) -> bool;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process cache with per-entry TTL
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: HashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone())
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        // drop whatever expired meanwhile, keeps the map bounded by live keys
        self.entries.retain(|_, entry| !entry.is_expired());
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}

/// Three-tier variable store: cache, environment file, global file.
pub struct VariableStore {
    cache: Box<dyn CacheBackend>,
    env: BTreeMap<String, String>,
    env_file: Option<PathBuf>,
    global: BTreeMap<String, String>,
    global_file: Option<PathBuf>,
}

impl VariableStore {
    /// A store whose env and global tiers live in memory only
    pub fn new(cache: Box<dyn CacheBackend>) -> Self {
        VariableStore {
            cache,
            env: BTreeMap::new(),
            env_file: None,
            global: BTreeMap::new(),
            global_file: None,
        }
    }

    /// A store backed by a dotenv file and a YAML file. Missing files are empty tiers.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        cache: Box<dyn CacheBackend>,
        env_file: P,
        global_file: Q,
    ) -> Result<Self> {
        let env_file = env_file.as_ref().to_path_buf();
        let global_file = global_file.as_ref().to_path_buf();
        log::debug!("Opening variable store: env={env_file:?} global={global_file:?}");

        Ok(VariableStore {
            cache,
            env: read_dotenv(&env_file)?,
            env_file: Some(env_file),
            global: read_global(&global_file)?,
            global_file: Some(global_file),
        })
    }

    /// Seed the environment tier from an already-loaded mapping
    pub fn with_env<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in entries {
            self.env.insert(key.as_ref().to_uppercase(), value.into());
        }
        self
    }

    /// Seed the global tier from an already-loaded mapping
    pub fn with_global<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in entries {
            self.global.insert(key.into(), value.into());
        }
        self
    }

    /// Look a key up, either in one scope or through cache -> env -> global.
    pub fn lookup(&self, key: &str, scope: Option<Scope>) -> Option<String> {
        match scope {
            Some(Scope::Cache) => self.cache.get(key),
            Some(Scope::Env) => self.env.get(&key.to_uppercase()).cloned(),
            Some(Scope::Global) => self.global.get(key).cloned(),
            None => self
                .cache
                .get(key)
                .or_else(|| self.env.get(&key.to_uppercase()).cloned())
                .or_else(|| self.global.get(key).cloned()),
        }
    }

    /// Like `lookup`, a miss is a `VariableError` naming the key.
    pub fn get(&self, key: &str, scope: Option<Scope>) -> Result<String> {
        self.lookup(key, scope).ok_or_else(|| match scope {
            Some(scope) => ApiTestError::Variable(format!("variable '{key}' not found in the {scope} scope")),
            None => ApiTestError::Variable(format!("variable '{key}' not found in cache, env or global scope")),
        })
    }

    /// Store a value. Env and global writes are persisted to their files, the TTL only applies to the cache.
    pub fn set(&mut self, key: &str, value: &str, scope: Scope, ttl: Option<Duration>) -> Result<()> {
        log::debug!("Setting variable '{key}' in the {scope} scope");
        match scope {
            Scope::Cache => {
                self.cache.set(key, value, ttl);
            }
            Scope::Env => {
                if let Some(path) = &self.env_file {
                    // re-read first so writes of other workers are not dropped wholesale
                    self.env = read_dotenv(path)?;
                }
                self.env.insert(key.to_uppercase(), value.to_string());
                if let Some(path) = &self.env_file {
                    write_dotenv(path, &self.env)?;
                }
            }
            Scope::Global => {
                if let Some(path) = &self.global_file {
                    self.global = read_global(path)?;
                }
                self.global.insert(key.to_string(), value.to_string());
                if let Some(path) = &self.global_file {
                    write_global(path, &self.global)?;
                }
            }
        }
        Ok(())
    }

    /// Remove a value from one scope. Returns whether it existed.
    pub fn delete(&mut self, key: &str, scope: Scope) -> Result<bool> {
        match scope {
            Scope::Cache => Ok(self.cache.delete(key)),
            Scope::Env => {
                if let Some(path) = &self.env_file {
                    self.env = read_dotenv(path)?;
                }
                let existed = self.env.remove(&key.to_uppercase()).is_some();
                if existed {
                    if let Some(path) = &self.env_file {
                        write_dotenv(path, &self.env)?;
                    }
                }
                Ok(existed)
            }
            Scope::Global => {
                if let Some(path) = &self.global_file {
                    self.global = read_global(path)?;
                }
                let existed = self.global.remove(key).is_some();
                if existed {
                    if let Some(path) = &self.global_file {
                        write_global(path, &self.global)?;
                    }
                }
                Ok(existed)
            }
        }
    }

    /// Store a relation variable (`^key`), consumed by the next relation pass
    pub fn set_relation(&mut self, key: &str, value: &str) {
        self.cache.set(&relation_key(key), value, None);
    }

    pub fn get_relation(&self, key: &str) -> Result<String> {
        self.cache.get(&relation_key(key)).ok_or_else(|| {
            ApiTestError::Variable(format!(
                "relation variable '^{key}' not found in cache; it must be produced by a setup testcase or sql action of this case"
            ))
        })
    }

    pub fn delete_relation(&mut self, key: &str) -> bool {
        self.cache.delete(&relation_key(key))
    }
}

fn relation_key(key: &str) -> String {
    format!("{RELATION_TAG}:{key}")
}

/// Parse a dotenv file. Keys are upper-cased.
fn read_dotenv(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(path)?;
    Ok(parse_dotenv(&content))
}

pub fn parse_dotenv(content: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            entries.insert(key.trim().to_uppercase(), value.to_string());
        } else {
            log::warn!("Ignoring malformed dotenv line: '{line}'");
        }
    }
    entries
}

fn write_dotenv(path: &Path, entries: &BTreeMap<String, String>) -> Result<()> {
    let content: String = entries
        .iter()
        .map(|(key, value)| {
            if value.contains(char::is_whitespace) || value.contains('#') {
                format!("{key}=\"{value}\"\n")
            } else {
                format!("{key}={value}\n")
            }
        })
        .collect();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

/// Parse the global YAML mapping, stringifying scalar and nested values.
fn read_global(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let raw: BTreeMap<String, Value> = serde_yaml::from_str(&content)?;
    Ok(raw.into_iter().map(|(key, value)| (key, stringify(&value))).collect())
}

fn write_global(path: &Path, entries: &BTreeMap<String, String>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_yaml::to_string(entries)?)?;
    Ok(())
}

/// Stringify a document value the way it is stored: strings verbatim, everything else as JSON text.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotenv_upper_cases_and_unquotes() {
        let entries = parse_dotenv("# comment\nhost=http://localhost\nexport TOKEN=\"a b\"\n\nbroken line\n");
        assert_eq!(entries.get("HOST").map(String::as_str), Some("http://localhost"));
        assert_eq!(entries.get("TOKEN").map(String::as_str), Some("a b"));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_memory_cache_ttl_expiry() {
        let mut cache = MemoryCache::new();
        cache.set("short", "1", Some(Duration::from_millis(0)));
        cache.set("long", "2", None);
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("long"), Some("2".to_string()));
    }

    #[test]
    fn test_relation_entries_do_not_collide_with_cache() {
        let mut store = VariableStore::new(Box::new(MemoryCache::new()));
        store.set("uid", "plain", Scope::Cache, None).unwrap();
        store.set_relation("uid", "related");
        assert_eq!(store.get("uid", None).unwrap(), "plain");
        assert_eq!(store.get_relation("uid").unwrap(), "related");
        assert!(store.delete_relation("uid"));
        assert!(store.get_relation("uid").is_err());
        assert_eq!(store.get("uid", None).unwrap(), "plain");
    }
}
