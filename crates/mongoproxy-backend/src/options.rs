//! Backend connection options.
//!
//! Options are read from the `mongod` stage's config document. Hosts and
//! credentials come either from discrete keys or from a full `uri`; when
//! both are present the URI wins for whatever it spells out.

use std::fmt;
use std::time::Duration;

use mongoproxy_pipeline::{ConfigError, StageConfig, DEFAULT_TIMEOUT_SECS};
use serde::Deserialize;

pub const DEFAULT_MAX_POOL_SIZE: usize = 16;
pub const DEFAULT_AUTH_DATABASE: &str = "admin";
const DEFAULT_HOST: &str = "localhost:27017";
const SCHEME: &str = "mongodb";
const SRV_SCHEME: &str = "mongodb+srv";

/// Credentials for the backend.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct AuthOptions {
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Authentication database; `admin` when unset.
    #[serde(default)]
    pub database: Option<String>,
}

impl AuthOptions {
    pub fn source(&self) -> &str {
        self.database.as_deref().unwrap_or(DEFAULT_AUTH_DATABASE)
    }
}

impl fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOptions")
            .field("username", &self.username)
            .field("password", &format_args!("<redacted>"))
            .field("database", &self.database)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub addresses: Vec<String>,
    /// Talk to the first address only, skipping topology discovery.
    pub direct: bool,
    /// Bounds connecting and server selection, not individual commands.
    pub timeout: Duration,
    /// Per-command socket timeout; unbounded when unset.
    pub socket_timeout: Option<Duration>,
    pub auth: Option<AuthOptions>,
    /// Default database named in the connection string.
    pub database: Option<String>,
    pub read_only: bool,
    pub max_pool_size: usize,
    pub scheme: String,
    pub tls: bool,
    /// Extra connection-string parameters, passed through as written.
    pub opt_params: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            addresses: vec![DEFAULT_HOST.to_string()],
            direct: false,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            socket_timeout: None,
            auth: None,
            database: None,
            read_only: false,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            scheme: SCHEME.to_string(),
            tls: false,
            opt_params: String::new(),
        }
    }
}

impl ConnectOptions {
    /// Read options from a stage config document.
    pub fn from_config(config: &StageConfig) -> Result<Self, ConfigError> {
        let mut options = Self::default();

        let addresses = config.get_str_list("addresses")?;
        if !addresses.is_empty() {
            options.addresses = addresses;
        }
        if let Some(direct) = config.get_bool("direct")? {
            options.direct = direct;
        }
        if let Some(timeout) = config.get_duration_secs("timeout")? {
            options.timeout = timeout;
        }
        options.socket_timeout = config
            .get_duration_secs("socketTimeout")?
            .filter(|timeout| !timeout.is_zero());
        if let Some(auth) = config.get("auth").filter(|v| !v.is_null()) {
            let auth: AuthOptions = serde_json::from_value(auth.clone())
                .map_err(|e| ConfigError::invalid_value("auth", e.to_string()))?;
            if !auth.username.is_empty() {
                options.auth = Some(auth);
            }
        }
        options.database = config
            .get_str("database")
            .filter(|db| !db.is_empty())
            .map(str::to_string);
        if let Some(read_only) = config.get_bool("readOnly")? {
            options.read_only = read_only;
        }
        if let Some(size) = config.get_u64("maxPoolSize")? {
            if size == 0 {
                return Err(ConfigError::invalid_value("maxPoolSize", "must be at least 1"));
            }
            options.max_pool_size = size as usize;
        }
        if let Some(scheme) = config.get_str("scheme").filter(|s| !s.is_empty()) {
            options.scheme = scheme.to_string();
        }
        if let Some(tls) = config.get_bool("tls")? {
            options.tls = tls;
        }
        if let Some(params) = config.get_str("optParams") {
            options.opt_params = params.to_string();
        }
        if let Some(uri) = config.get_str("uri").filter(|u| !u.is_empty()) {
            options.apply_uri(uri)?;
        }
        options.validate()?;
        Ok(options)
    }

    pub fn is_srv(&self) -> bool {
        self.scheme == SRV_SCHEME
    }

    /// Reject combinations the driver would refuse at connect time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheme != SCHEME && !self.is_srv() {
            return Err(ConfigError::invalid_value(
                "scheme",
                format!("expected {SCHEME} or {SRV_SCHEME}, got {:?}", self.scheme),
            ));
        }
        if self.is_srv() {
            let [host] = self.addresses.as_slice() else {
                return Err(ConfigError::invalid_value(
                    "addresses",
                    "an SRV connection names exactly one host",
                ));
            };
            if host.contains(':') {
                return Err(ConfigError::invalid_value(
                    "addresses",
                    "an SRV host cannot carry a port",
                ));
            }
            if self.direct {
                return Err(ConfigError::invalid_value(
                    "direct",
                    "direct connections cannot use SRV discovery",
                ));
            }
        }
        Ok(())
    }

    /// Merge the parts of a `scheme://user:pass@h1,h2/db?k=v` string.
    pub fn apply_uri(&mut self, uri: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::invalid_value("uri", reason.to_string());

        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        if scheme != SCHEME && scheme != SRV_SCHEME {
            return Err(invalid("expected a mongodb:// or mongodb+srv:// URI"));
        }
        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let (authority, database) = match rest.split_once('/') {
            Some((authority, database)) => (authority, database),
            None => (rest, ""),
        };
        let (credentials, hosts) = match authority.rsplit_once('@') {
            Some((credentials, hosts)) => (Some(credentials), hosts),
            None => (None, authority),
        };

        let addresses: Vec<String> = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        if addresses.is_empty() {
            return Err(invalid("no hosts"));
        }
        self.scheme = scheme.to_string();
        self.addresses = addresses;
        if !database.is_empty() {
            self.database = Some(percent_decode(database));
        }
        if let Some(credentials) = credentials {
            let (username, password) = match credentials.split_once(':') {
                Some((u, p)) => (percent_decode(u), percent_decode(p)),
                None => (percent_decode(credentials), String::new()),
            };
            let database = self.auth.as_ref().and_then(|a| a.database.clone());
            self.auth = Some(AuthOptions {
                username,
                password,
                database,
            });
        }

        let mut passthrough = Vec::new();
        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "authSource" => {
                    if let Some(auth) = self.auth.as_mut() {
                        auth.database = Some(percent_decode(value));
                    }
                }
                "directConnection" => self.direct = value == "true",
                "connectTimeoutMS" | "serverSelectionTimeoutMS" => {
                    let millis: u64 = value
                        .parse()
                        .map_err(|_| invalid("timeouts must be integer milliseconds"))?;
                    self.timeout = Duration::from_millis(millis);
                }
                "socketTimeoutMS" => {
                    let millis: u64 = value
                        .parse()
                        .map_err(|_| invalid("socketTimeoutMS must be an integer"))?;
                    self.socket_timeout = Some(Duration::from_millis(millis))
                        .filter(|timeout| !timeout.is_zero());
                }
                "tls" | "ssl" => self.tls = value == "true",
                "maxPoolSize" => {
                    self.max_pool_size = value
                        .parse::<usize>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| invalid("maxPoolSize must be a positive integer"))?;
                }
                _ => passthrough.push(pair),
            }
        }
        if !passthrough.is_empty() {
            self.opt_params = format!("&{}", passthrough.join("&"));
        }
        Ok(())
    }

    /// The connection string handed to the driver. With `redact`, the
    /// password is masked.
    pub fn connection_string(&self, redact: bool) -> String {
        let mut uri = format!("{}://", self.scheme);
        if let Some(auth) = &self.auth {
            uri.push_str(&percent_encode(&auth.username));
            if !auth.password.is_empty() {
                uri.push(':');
                if redact {
                    uri.push_str("***");
                } else {
                    uri.push_str(&percent_encode(&auth.password));
                }
            }
            uri.push('@');
        }
        uri.push_str(&self.seeds().join(","));
        uri.push('/');
        uri.push_str(self.database.as_deref().unwrap_or(""));

        let timeout = self.timeout.as_millis();
        uri.push_str(&format!(
            "?connectTimeoutMS={timeout}&serverSelectionTimeoutMS={timeout}&maxPoolSize={}",
            self.max_pool_size
        ));
        if let Some(socket_timeout) = self.socket_timeout {
            uri.push_str(&format!("&socketTimeoutMS={}", socket_timeout.as_millis()));
        }
        // SRV records imply TLS; only an explicit request is written out.
        if self.tls {
            uri.push_str("&tls=true");
        }
        if let Some(auth) = self.auth.as_ref().and_then(|a| a.database.as_deref()) {
            uri.push_str("&authSource=");
            uri.push_str(&percent_encode(auth));
        }
        if self.direct {
            uri.push_str("&directConnection=true");
        }
        if !self.opt_params.is_empty() {
            if !self.opt_params.starts_with('&') {
                uri.push('&');
            }
            uri.push_str(&self.opt_params);
        }
        uri
    }

    /// Seed addresses; a direct connection uses the first one only.
    pub fn seeds(&self) -> &[String] {
        if self.direct {
            &self.addresses[..self.addresses.len().min(1)]
        } else {
            &self.addresses
        }
    }
}

fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(char::from(byte));
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config(value: serde_json::Value) -> StageConfig {
        match value {
            serde_json::Value::Object(map) => StageConfig::from_map(map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn defaults_apply_to_empty_config() {
        let options = ConnectOptions::from_config(&StageConfig::new()).unwrap();
        assert_eq!(options.addresses, vec!["localhost:27017"]);
        assert_eq!(options.timeout, Duration::from_secs(20));
        assert_eq!(options.max_pool_size, DEFAULT_MAX_POOL_SIZE);
        assert!(!options.read_only);
        assert!(options.auth.is_none());
    }

    #[test]
    fn discrete_keys_are_read() {
        let options = ConnectOptions::from_config(&config(json!({
            "addresses": "db1:27017, db2:27017",
            "direct": "true",
            "timeout": 5,
            "readOnly": true,
            "maxPoolSize": 4,
            "database": "app",
            "auth": { "username": "svc", "password": "s3cret" },
        })))
        .unwrap();
        assert_eq!(options.addresses, vec!["db1:27017", "db2:27017"]);
        assert!(options.direct);
        assert_eq!(options.seeds(), ["db1:27017".to_string()]);
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert!(options.read_only);
        assert_eq!(options.max_pool_size, 4);
        let auth = options.auth.unwrap();
        assert_eq!(auth.source(), "admin");
        assert_eq!(auth.password, "s3cret");
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let err = ConnectOptions::from_config(&config(json!({ "maxPoolSize": 0 }))).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "maxPoolSize"));
    }

    #[test]
    fn uri_overrides_discrete_keys() {
        let options = ConnectOptions::from_config(&config(json!({
            "addresses": ["ignored:1"],
            "uri": "mongodb://app%40corp:p%3Ass@h1:27017,h2:27018/inventory\
                    ?authSource=users&directConnection=true&connectTimeoutMS=1500&replicaSet=rs0",
        })))
        .unwrap();
        assert_eq!(options.addresses, vec!["h1:27017", "h2:27018"]);
        assert_eq!(options.database.as_deref(), Some("inventory"));
        assert!(options.direct);
        assert_eq!(options.timeout, Duration::from_millis(1500));
        let auth = options.auth.as_ref().unwrap();
        assert_eq!(auth.username, "app@corp");
        assert_eq!(auth.password, "p:ss");
        assert_eq!(auth.source(), "users");
        assert_eq!(options.opt_params, "&replicaSet=rs0");
    }

    #[test]
    fn srv_uris_are_accepted() {
        let mut options = ConnectOptions::default();
        options
            .apply_uri("mongodb+srv://svc:pw@cluster.example.net/app?retryWrites=true")
            .unwrap();
        assert!(options.is_srv());
        assert_eq!(options.addresses, vec!["cluster.example.net"]);
        options.validate().unwrap();
        assert!(options
            .connection_string(false)
            .starts_with("mongodb+srv://svc:pw@cluster.example.net/app?"));
        assert!(!options.connection_string(false).contains("tls="));

        assert!(options.apply_uri("cluster.example.net").is_err());
        assert!(options.apply_uri("redis://cache:6379").is_err());
    }

    #[test]
    fn srv_rejects_ports_multiple_hosts_and_direct() {
        let err = ConnectOptions::from_config(&config(json!({
            "uri": "mongodb+srv://cluster.example.net:27017",
        })))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "addresses"));

        let err = ConnectOptions::from_config(&config(json!({
            "scheme": "mongodb+srv",
            "addresses": ["a.example.net", "b.example.net"],
        })))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "addresses"));

        let err = ConnectOptions::from_config(&config(json!({
            "scheme": "mongodb+srv",
            "addresses": ["cluster.example.net"],
            "direct": true,
        })))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "direct"));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err =
            ConnectOptions::from_config(&config(json!({ "scheme": "postgres" }))).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "scheme"));
    }

    #[test]
    fn tls_is_passed_to_the_driver() {
        let options =
            ConnectOptions::from_config(&config(json!({ "tls": true }))).unwrap();
        assert!(options.connection_string(false).contains("&tls=true"));
    }

    #[test]
    fn timeout_bounds_connecting_not_commands() {
        let options = ConnectOptions::from_config(&config(json!({ "timeout": 3 }))).unwrap();
        let uri = options.connection_string(false);
        assert!(uri.contains("connectTimeoutMS=3000"));
        assert!(uri.contains("serverSelectionTimeoutMS=3000"));
        assert!(!uri.contains("socketTimeoutMS"));

        let options =
            ConnectOptions::from_config(&config(json!({ "socketTimeout": 30 }))).unwrap();
        assert_eq!(options.socket_timeout, Some(Duration::from_secs(30)));
        assert!(options
            .connection_string(false)
            .contains("&socketTimeoutMS=30000"));

        let mut options = ConnectOptions::default();
        options.apply_uri("mongodb://h1/?socketTimeoutMS=0").unwrap();
        assert_eq!(options.socket_timeout, None);
    }

    #[test]
    fn connection_string_round_trips_the_pieces() {
        let mut options = ConnectOptions {
            addresses: vec!["h1:27017".into(), "h2:27017".into()],
            database: Some("app".into()),
            timeout: Duration::from_secs(2),
            max_pool_size: 4,
            opt_params: "&replicaSet=rs0".into(),
            ..ConnectOptions::default()
        };
        options.auth = Some(AuthOptions {
            username: "svc@corp".into(),
            password: "p:w/".into(),
            database: None,
        });
        assert_eq!(
            options.connection_string(false),
            "mongodb://svc%40corp:p%3Aw%2F@h1:27017,h2:27017/app\
             ?connectTimeoutMS=2000&serverSelectionTimeoutMS=2000&maxPoolSize=4&replicaSet=rs0"
        );
        assert_eq!(
            options.connection_string(true),
            "mongodb://svc%40corp:***@h1:27017,h2:27017/app\
             ?connectTimeoutMS=2000&serverSelectionTimeoutMS=2000&maxPoolSize=4&replicaSet=rs0"
        );

        let mut reparsed = ConnectOptions::default();
        reparsed.apply_uri(&options.connection_string(false)).unwrap();
        assert_eq!(reparsed.auth, options.auth);
        assert_eq!(reparsed.addresses, options.addresses);
        assert_eq!(reparsed.timeout, options.timeout);
        assert_eq!(reparsed.opt_params, "&replicaSet=rs0");
    }

    #[test]
    fn direct_connection_names_a_single_seed() {
        let options = ConnectOptions {
            addresses: vec!["h1:27017".into(), "h2:27017".into()],
            direct: true,
            ..ConnectOptions::default()
        };
        let uri = options.connection_string(false);
        assert!(uri.starts_with("mongodb://h1:27017/?"));
        assert!(uri.ends_with("&directConnection=true"));
    }

    #[test]
    fn debug_output_hides_password() {
        let auth = AuthOptions {
            username: "svc".into(),
            password: "hunter2".into(),
            database: None,
        };
        assert!(!format!("{auth:?}").contains("hunter2"));
    }
}
