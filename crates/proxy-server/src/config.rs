use axum::http::Uri;
use postgrest_cache::RedisSettings;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_store_addr")]
    pub addr: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

impl Config {
    /// Read `path` if it exists, otherwise start from defaults; then apply
    /// environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str(&contents)?
        } else {
            Config::default()
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the deployment variables (`SUPA_URL`, `PORT`, `REDIS_*`,
    /// `CACHE_TTL_MINUTES`, `CACHE_TABLES`). Empty values count as unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(url) = var("SUPA_URL") {
            self.upstream.url = url;
        }
        if let Some(port) = var("PORT") {
            self.server.listen_addr = format!("0.0.0.0:{port}");
        }
        if let Some(addr) = var("REDIS_ADDR") {
            self.store.addr = addr;
        }
        if let Some(password) = var("REDIS_PASSWORD") {
            self.store.password = password;
        }
        if let Some(db) = var("REDIS_DB") {
            self.store.db = db
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("REDIS_DB", format!("{db:?} is not an integer")))?;
        }
        if let Some(minutes) = var("CACHE_TTL_MINUTES") {
            self.cache.ttl_seconds = match minutes.trim().parse::<i64>() {
                Ok(m) if m > 0 => m as u64 * 60,
                _ => {
                    tracing::warn!(value = %minutes, "invalid CACHE_TTL_MINUTES, using 5 minutes");
                    default_ttl()
                }
            };
        }
        if let Some(tables) = var("CACHE_TABLES") {
            self.cache.tables = tables.split(',').map(str::to_string).collect();
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.upstream_uri()?;

        if self.cache.ttl_seconds == 0 {
            return Err(ConfigError::invalid("cache.ttl_seconds", "must be > 0"));
        }
        if !self.cache.path_prefix.starts_with('/') {
            return Err(ConfigError::invalid("cache.path_prefix", "must start with '/'"));
        }

        self.cache.tables = self
            .cache
            .tables
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        Ok(())
    }

    /// The upstream origin as an absolute `http` URI.
    pub fn upstream_uri(&self) -> Result<Uri, ConfigError> {
        let uri: Uri = self
            .upstream
            .url
            .parse()
            .map_err(|e| ConfigError::invalid("upstream.url", format!("{e}")))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => {
                return Err(ConfigError::invalid(
                    "upstream.url",
                    format!("unsupported scheme {other:?}, only http is supported"),
                ))
            }
            None => return Err(ConfigError::invalid("upstream.url", "missing scheme")),
        }
        if uri.authority().is_none() {
            return Err(ConfigError::invalid("upstream.url", "missing host"));
        }
        Ok(uri)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_seconds)
    }

    pub fn table_rules(&self) -> TableRules {
        TableRules::new(self.cache.tables.as_slice())
    }

    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings {
            addr: self.store.addr.clone(),
            password: Some(self.store.password.clone()).filter(|p| !p.is_empty()),
            db: self.store.db,
        }
    }
}

/// Which tables may be cached: `*` allows all, otherwise names match the
/// last path segment case-insensitively. No entries disables caching.
#[derive(Debug, Clone, Default)]
pub struct TableRules {
    wildcard: bool,
    names: HashSet<String>,
}

impl TableRules {
    pub fn new<S: AsRef<str>>(tables: &[S]) -> Self {
        let mut rules = TableRules::default();
        for table in tables {
            let table = table.as_ref();
            if table == "*" {
                rules.wildcard = true;
            } else {
                rules.names.insert(table.to_lowercase());
            }
        }
        rules
    }

    pub fn is_enabled(&self) -> bool {
        self.wildcard || !self.names.is_empty()
    }

    pub fn allows(&self, table: &str) -> bool {
        self.wildcard || self.names.contains(&table.to_lowercase())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            addr: default_store_addr(),
            password: String::new(),
            db: 0,
            memory_capacity: default_memory_capacity(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl(),
            tables: default_tables(),
            path_prefix: default_path_prefix(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_upstream_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}
fn default_store_addr() -> String {
    "localhost:6379".to_string()
}
fn default_memory_capacity() -> usize {
    10000
}
fn default_ttl() -> u64 {
    300
}
fn default_tables() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_path_prefix() -> String {
    "/rest/v1/".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with_env(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = Config::default();
        config.apply_env(|name| env.get(name).cloned())?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn defaults() {
        let config = with_env(&[]).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.upstream.url, "http://localhost:3000");
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.addr, "localhost:6379");
        assert_eq!(config.ttl(), Duration::from_secs(300));
        assert_eq!(config.cache.tables, vec!["*"]);
        assert_eq!(config.cache.path_prefix, "/rest/v1/");
        assert!(config.redis_settings().password.is_none());
    }

    #[test]
    fn parses_toml_sections() {
        let mut config: Config = toml::from_str(
            r#"
            [upstream]
            url = "http://rest:3000"

            [store]
            backend = "memory"
            memory_capacity = 500

            [cache]
            ttl_seconds = 30
            tables = ["Orders", " users ", ""]
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.upstream.url, "http://rest:3000");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.memory_capacity, 500);
        assert_eq!(config.ttl(), Duration::from_secs(30));
        assert_eq!(config.cache.tables, vec!["Orders", "users"]);
        assert_eq!(config.server.metrics_addr, "0.0.0.0:9090");
    }

    #[test]
    fn env_overrides() {
        let config = with_env(&[
            ("SUPA_URL", "http://postgrest:3000/"),
            ("PORT", "8181"),
            ("REDIS_ADDR", "redis:6380"),
            ("REDIS_PASSWORD", "hunter2"),
            ("REDIS_DB", "2"),
            ("CACHE_TTL_MINUTES", "10"),
            ("CACHE_TABLES", "orders, users"),
        ])
        .unwrap();

        assert_eq!(config.upstream.url, "http://postgrest:3000/");
        assert_eq!(config.server.listen_addr, "0.0.0.0:8181");
        let redis = config.redis_settings();
        assert_eq!(redis.addr, "redis:6380");
        assert_eq!(redis.password.as_deref(), Some("hunter2"));
        assert_eq!(redis.db, 2);
        assert_eq!(config.ttl(), Duration::from_secs(600));
        assert_eq!(config.cache.tables, vec!["orders", "users"]);
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let config = with_env(&[("CACHE_TABLES", ""), ("SUPA_URL", "")]).unwrap();
        assert_eq!(config.cache.tables, vec!["*"]);
        assert_eq!(config.upstream.url, "http://localhost:3000");
    }

    #[test]
    fn bad_ttl_minutes_fall_back_to_five() {
        for bad in ["0", "-3", "soon"] {
            let config = with_env(&[("CACHE_TTL_MINUTES", bad)]).unwrap();
            assert_eq!(config.ttl(), Duration::from_secs(300), "{bad}");
        }
    }

    #[test]
    fn bad_redis_db_is_rejected() {
        assert!(matches!(
            with_env(&[("REDIS_DB", "zero")]),
            Err(ConfigError::Invalid { field: "REDIS_DB", .. })
        ));
    }

    #[test]
    fn upstream_url_must_be_absolute_http() {
        for bad in ["not a url", "/relative", "https://example.supabase.co", "localhost:3000"] {
            assert!(
                with_env(&[("SUPA_URL", bad)]).is_err(),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn table_rules() {
        let rules = TableRules::new(&["Orders", "users"]);
        assert!(rules.is_enabled());
        assert!(rules.allows("orders"));
        assert!(rules.allows("ORDERS"));
        assert!(!rules.allows("invoices"));

        let all = TableRules::new(&["invoices", "*"]);
        assert!(all.allows("anything"));

        let none = TableRules::new::<&str>(&[]);
        assert!(!none.is_enabled());
        assert!(!none.allows("orders"));
    }
}
