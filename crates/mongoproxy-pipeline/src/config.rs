//! Proxy and stage configuration.
//!
//! Configuration comes from a JSON file or from the process environment.
//! Either way it resolves to a [`ProxyConfig`]: listener settings, a few
//! pipeline-wide keys, and an ordered list of stages, each with its own
//! [`StageConfig`] key/value document.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 27017;
pub const DEFAULT_LISTEN: &str = "0.0.0.0";
pub const DEFAULT_SCHEME: &str = "mongodb";
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Keys that apply to every stage unless the stage overrides them.
const SHARED_KEYS: [&str; 3] = ["scheme", "tls", "optParams"];

/// Keys whose values never leave the process in clear text.
const SECRET_KEYS: [&str; 2] = ["password", "uri"];

const REDACTED: &str = "***";

/// A semantic key/value document configuring one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageConfig(Map<String, Value>);

impl StageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Boolean value; the strings `"true"`/`"false"` are accepted too.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim() {
                "true" => Ok(Some(true)),
                "false" | "" => Ok(Some(false)),
                other => Err(ConfigError::invalid_value(
                    key,
                    format!("expected true or false, got {other:?}"),
                )),
            },
            Some(other) => Err(ConfigError::invalid_value(
                key,
                format!("expected a boolean, got {other}"),
            )),
        }
    }

    /// Unsigned integer value; numeric strings are accepted too.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
                ConfigError::invalid_value(key, format!("expected a non-negative integer, got {n}"))
            }),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| {
                ConfigError::invalid_value(key, format!("expected an integer, got {s:?}"))
            }),
            Some(other) => Err(ConfigError::invalid_value(
                key,
                format!("expected an integer, got {other}"),
            )),
        }
    }

    /// List of strings: a JSON array, or a comma-separated string.
    pub fn get_str_list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(s)) => Ok(split_list(s)),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        ConfigError::invalid_value(key, format!("expected strings, got {item}"))
                    })
                })
                .collect(),
            Some(other) => Err(ConfigError::invalid_value(
                key,
                format!("expected a list, got {other}"),
            )),
        }
    }

    /// Timeout given in whole seconds.
    pub fn get_duration_secs(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.get_u64(key)?.map(Duration::from_secs))
    }

    /// Deserialize the whole document into a typed options struct.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    /// Fill in keys from `defaults` that this config does not set itself.
    pub fn with_defaults(mut self, defaults: &Map<String, Value>) -> Self {
        for (key, value) in defaults {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }

    /// Copy with secrets replaced, for display.
    pub fn redacted(&self) -> Self {
        Self(redact_map(&self.0))
    }
}

fn redact_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Object(inner) => Value::Object(redact_map(inner)),
                Value::String(s) if SECRET_KEYS.contains(&key.as_str()) && !s.is_empty() => {
                    Value::String(REDACTED.to_string())
                }
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// One configured pipeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default, alias = "options")]
    pub config: StageConfig,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, config: StageConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_socket: Option<PathBuf>,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub opt_params: String,
    #[serde(default, alias = "modules")]
    pub stages: Vec<StageSpec>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            listen: default_listen(),
            unix_socket: None,
            scheme: default_scheme(),
            tls: false,
            opt_params: String::new(),
            stages: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Parse JSON text.
    ///
    /// Two shapes are understood: the native one (`port`, `stages`, ...) and
    /// the flat legacy one, where a single `mongod` object carries
    /// string-valued connection keys.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(root) = value else {
            return Err(ConfigError::Invalid(
                "configuration must be a JSON object".into(),
            ));
        };

        let is_legacy = !root.contains_key("stages")
            && !root.contains_key("modules")
            && root.get("mongod").is_some_and(Value::is_object);
        if is_legacy {
            if let Some(Value::Object(mongod)) = root.get("mongod") {
                return Self::from_legacy(mongod);
            }
        }

        Ok(serde_json::from_value(Value::Object(root))?)
    }

    fn from_legacy(mongod: &Map<String, Value>) -> Result<Self, ConfigError> {
        let flat = StageConfig::from_map(mongod.clone());
        let lookup = |key: &str| flat.get_str(key).map(str::to_string);

        let mut config = Self::from_lookup(|key| match key {
            "MONGO_SCHEME" => lookup("scheme"),
            "MONGO_ADDRESSES" => lookup("addresses"),
            "MONGO_USERNAME" => lookup("username"),
            "MONGO_PASSWORD" => lookup("password"),
            "MONGO_DATABASE" => lookup("database"),
            "MONGO_OPT_PARAMS" => lookup("optParams"),
            "MONGO_TLS" => lookup("tls"),
            "MONGOPROXY_TIMEOUT" => lookup("timeout"),
            "MONGOPROXY_PORT" => lookup("port"),
            "MONGOPROXY_READONLY" => lookup("readonly").or_else(|| lookup("readOnly")),
            _ => None,
        })?;
        // Legacy files may also use real JSON types for the booleans.
        if let Some(tls) = flat.get_bool("tls")? {
            config.tls = tls;
        }
        if let Some(read_only) = flat.get_bool("readonly")? {
            if let Some(stage) = config.stages.first_mut() {
                stage.config.insert("readOnly", read_only);
            }
        }
        Ok(config)
    }

    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from environment-style variables supplied by `lookup`.
    ///
    /// The result has a single `mongod` stage. An unparsable timeout or port
    /// falls back to its default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = var("MONGOPROXY_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let timeout = var("MONGOPROXY_TIMEOUT")
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let mut stage = StageConfig::new();
        if let Some(addresses) = var("MONGO_ADDRESSES") {
            stage.insert("addresses", split_list(&addresses));
        }
        stage.insert("timeout", timeout);
        stage.insert(
            "readOnly",
            var("MONGOPROXY_READONLY").as_deref() == Some("true"),
        );
        if let Some(database) = var("MONGO_DATABASE") {
            stage.insert("database", database);
        }
        if let Some(username) = var("MONGO_USERNAME") {
            let mut auth = Map::new();
            auth.insert("username".into(), username.into());
            if let Some(password) = var("MONGO_PASSWORD") {
                auth.insert("password".into(), password.into());
            }
            stage.insert("auth", auth);
        }

        Ok(Self {
            port,
            scheme: var("MONGO_SCHEME").unwrap_or_else(default_scheme),
            tls: var("MONGO_TLS").as_deref() == Some("true"),
            opt_params: var("MONGO_OPT_PARAMS").unwrap_or_default(),
            stages: vec![StageSpec::new("mongod", stage)],
            ..Self::default()
        })
    }

    /// `host:port` for the TCP listener.
    pub fn bind_address(&self) -> String {
        if self.listen.contains(':') && !self.listen.starts_with('[') {
            format!("[{}]:{}", self.listen, self.port)
        } else {
            format!("{}:{}", self.listen, self.port)
        }
    }

    /// Pipeline-wide keys every stage inherits.
    pub fn shared_defaults(&self) -> Map<String, Value> {
        let mut shared = Map::new();
        shared.insert(SHARED_KEYS[0].into(), self.scheme.clone().into());
        shared.insert(SHARED_KEYS[1].into(), self.tls.into());
        if !self.opt_params.is_empty() {
            shared.insert(SHARED_KEYS[2].into(), self.opt_params.clone().into());
        }
        shared
    }

    /// Stage entries with the shared keys merged in underneath their own.
    pub fn resolved_stages(&self) -> Vec<StageSpec> {
        let shared = self.shared_defaults();
        self.stages
            .iter()
            .map(|spec| StageSpec::new(&spec.name, spec.config.clone().with_defaults(&shared)))
            .collect()
    }

    /// Copy with every secret replaced, for display.
    pub fn redacted(&self) -> Self {
        Self {
            stages: self
                .stages
                .iter()
                .map(|spec| StageSpec::new(&spec.name, spec.config.redacted()))
                .collect(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_defaults() {
        let config = ProxyConfig::from_lookup(env(&[])).expect("config should build");
        assert_eq!(config.port, 27017);
        assert_eq!(config.scheme, "mongodb");
        assert!(!config.tls);
        assert_eq!(config.stages.len(), 1);

        let stage = &config.stages[0];
        assert_eq!(stage.name, "mongod");
        assert_eq!(stage.config.get_u64("timeout").unwrap(), Some(20));
        assert_eq!(stage.config.get_bool("readOnly").unwrap(), Some(false));
        assert!(!stage.config.contains_key("auth"));
    }

    #[test]
    fn env_values_are_applied() {
        let config = ProxyConfig::from_lookup(env(&[
            ("MONGO_ADDRESSES", "db1:27017, db2:27017"),
            ("MONGO_USERNAME", "svc"),
            ("MONGO_PASSWORD", "s3cret"),
            ("MONGO_DATABASE", "data"),
            ("MONGO_TLS", "true"),
            ("MONGO_OPT_PARAMS", "&replicaSet=rs0"),
            ("MONGOPROXY_TIMEOUT", "5"),
            ("MONGOPROXY_PORT", "28000"),
            ("MONGOPROXY_READONLY", "true"),
        ]))
        .expect("config should build");

        assert_eq!(config.port, 28000);
        assert!(config.tls);
        assert_eq!(config.opt_params, "&replicaSet=rs0");

        let stage = &config.stages[0].config;
        assert_eq!(
            stage.get_str_list("addresses").unwrap(),
            vec!["db1:27017", "db2:27017"]
        );
        assert_eq!(stage.get_u64("timeout").unwrap(), Some(5));
        assert_eq!(stage.get_bool("readOnly").unwrap(), Some(true));
        assert_eq!(stage.get_str("database"), Some("data"));
        assert_eq!(
            stage.get("auth"),
            Some(&json!({ "username": "svc", "password": "s3cret" }))
        );
    }

    #[test]
    fn env_bad_numbers_fall_back() {
        let config = ProxyConfig::from_lookup(env(&[
            ("MONGOPROXY_PORT", "not-a-port"),
            ("MONGOPROXY_TIMEOUT", "soon"),
        ]))
        .expect("config should build");
        assert_eq!(config.port, 27017);
        assert_eq!(config.stages[0].config.get_u64("timeout").unwrap(), Some(20));
    }

    #[test]
    fn native_json_shape() {
        let config = ProxyConfig::from_json_str(
            r#"{
                "port": 27018,
                "unixSocket": "/tmp/proxy.sock",
                "tls": false,
                "stages": [
                    { "name": "trace", "config": { "level": "info" } },
                    { "name": "mongod", "config": { "addresses": ["localhost:27017"] } }
                ]
            }"#,
        )
        .expect("config should parse");

        assert_eq!(config.port, 27018);
        assert_eq!(config.unix_socket, Some(PathBuf::from("/tmp/proxy.sock")));
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[0].config.get_str("level"), Some("info"));
    }

    #[test]
    fn modules_alias_is_accepted() {
        let config =
            ProxyConfig::from_json_str(r#"{ "modules": [ { "name": "mongod" } ] }"#).unwrap();
        assert_eq!(config.stages[0].name, "mongod");
        assert!(config.stages[0].config.is_empty());
    }

    #[test]
    fn legacy_json_shape() {
        let config = ProxyConfig::from_json_str(
            r#"{ "mongod": {
                "scheme": "mongodb",
                "addresses": "a:1,b:2",
                "username": "u",
                "password": "p",
                "database": "admin",
                "optParams": "",
                "tls": "false",
                "timeout": "7",
                "port": "27019",
                "readonly": "true"
            } }"#,
        )
        .expect("legacy config should parse");

        assert_eq!(config.port, 27019);
        let stage = &config.stages[0];
        assert_eq!(stage.name, "mongod");
        assert_eq!(stage.config.get_str_list("addresses").unwrap(), vec!["a:1", "b:2"]);
        assert_eq!(stage.config.get_u64("timeout").unwrap(), Some(7));
        assert_eq!(stage.config.get_bool("readOnly").unwrap(), Some(true));
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(matches!(
            ProxyConfig::from_json_str("[1, 2]"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ProxyConfig::from_json_str("{ nope"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn shared_keys_sit_under_stage_keys() {
        let mut config = ProxyConfig {
            tls: true,
            opt_params: "&w=1".into(),
            ..ProxyConfig::default()
        };
        let mut own = StageConfig::new();
        own.insert("tls", false);
        config.stages.push(StageSpec::new("mongod", own));

        let resolved = config.resolved_stages();
        let stage = &resolved[0].config;
        assert_eq!(stage.get_bool("tls").unwrap(), Some(false));
        assert_eq!(stage.get_str("optParams"), Some("&w=1"));
        assert_eq!(stage.get_str("scheme"), Some("mongodb"));
    }

    #[test]
    fn redaction_hides_nested_passwords() {
        let config = ProxyConfig::from_lookup(env(&[
            ("MONGO_USERNAME", "svc"),
            ("MONGO_PASSWORD", "s3cret"),
        ]))
        .unwrap();
        let shown = serde_json::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("s3cret"));
        assert!(shown.contains("svc"));
    }

    #[test]
    fn typed_accessors_reject_garbage() {
        let mut config = StageConfig::new();
        config.insert("flag", "maybe");
        config.insert("count", -3);
        assert!(config.get_bool("flag").is_err());
        assert!(config.get_u64("count").is_err());
        assert_eq!(config.get_bool("absent").unwrap(), None);
    }

    #[test]
    fn bind_address_brackets_ipv6() {
        let config = ProxyConfig {
            listen: "::1".into(),
            port: 27017,
            ..ProxyConfig::default()
        };
        assert_eq!(config.bind_address(), "[::1]:27017");
        assert_eq!(ProxyConfig::default().bind_address(), "0.0.0.0:27017");
    }
}
