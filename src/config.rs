use crate::error::{GatewayError, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

/// Base port used when neither the config, `PORT` nor the CLI set one
pub const DEFAULT_PORT: u16 = 8000;

/// Config file read when no other path is given
pub const DEFAULT_CONFIG_FILE: &str = "gorexy.json";

/// Top-level gateway configuration, loaded once at startup
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Prefix routing rules, in priority order
    #[serde(default)]
    pub mappings: Vec<Mapping>,

    /// Local processes to launch and supervise
    #[serde(default)]
    pub services: Vec<Service>,

    /// Base port: HTTP listens here, HTTPS on +1, services from +2
    #[serde(default)]
    pub port: u16,

    /// Start all services concurrently instead of one after another
    #[serde(default)]
    pub parallel: bool,

    /// Discard the output of every service
    #[serde(default)]
    pub silent: bool,

    #[serde(default)]
    pub https: HttpsConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HttpsConfig {
    pub enabled: bool,

    /// Path to the PEM certificate chain
    pub cert: String,

    /// Path to the PEM private key
    pub key: String,

    /// Serve HTTPS only (no plain HTTP listener)
    #[serde(rename = "nohttp")]
    pub no_http: bool,
}

impl HttpsConfig {
    /// Whether the plain HTTP listener should run
    pub fn serves_http(&self) -> bool {
        !self.enabled || !self.no_http
    }

    pub fn has_files(&self) -> bool {
        !self.cert.is_empty() && !self.key.is_empty()
    }
}

/// A routing rule: requests whose path starts with `path` go to `destination`
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Mapping {
    pub path: String,

    /// `http://` or `ws://` URL, may contain `{PORT<n>}` placeholders
    pub destination: String,
}

impl Mapping {
    pub fn new(path: &str, destination: &str) -> Self {
        Self {
            path: path.to_string(),
            destination: destination.to_string(),
        }
    }
}

/// A local command the gateway launches at startup
///
/// # Security Warning
///
/// `cmd`, `args` and `env` are executed as given. Config files must be
/// protected like any other script the gateway user would run.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Service {
    /// Working directory; also enables relative command lookup
    pub dir: String,

    pub cmd: String,

    /// Space-separated `KEY=VALUE` pairs; replaces the inherited environment when set
    pub env: String,

    /// Space-separated arguments
    pub args: String,

    pub name: String,

    /// Restart the service when its executable changes on disk
    pub auto_reload: bool,

    /// Discard this service's output
    pub silent: bool,
}

impl Service {
    /// Create a service running `cmd` with defaults (builder pattern)
    pub fn command(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: &str) -> Self {
        self.args = args.to_string();
        self
    }

    pub fn with_env(mut self, env: &str) -> Self {
        self.env = env.to_string();
        self
    }

    pub fn with_dir(mut self, dir: &str) -> Self {
        self.dir = dir.to_string();
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_auto_reload(mut self) -> Self {
        self.auto_reload = true;
        self
    }

    /// Name used in logs: the configured name, else the command
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.cmd
        } else {
            &self.name
        }
    }

    /// Text scanned for port placeholders, arguments first
    pub fn placeholder_source(&self) -> String {
        format!("{}{}", self.args, self.env)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    /// Apply the `PORT` environment value and then the CLI flag on top of
    /// the configured port; the flag wins. A zero result falls back to 8000.
    pub fn apply_port_overrides(&mut self, env_port: Option<&str>, flag_port: Option<u16>) {
        if let Some(raw) = env_port.filter(|v| !v.is_empty()) {
            match raw.trim().parse::<u16>() {
                Ok(port) => self.port = port,
                Err(e) => warn!(value = raw, error = %e, "Ignoring invalid PORT environment variable"),
            }
        }

        if let Some(port) = flag_port {
            self.port = port;
        }

        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
    }

    pub fn http_port(&self) -> u16 {
        self.port
    }

    /// HTTPS listens one above the base port
    pub fn https_port(&self) -> Result<u16> {
        self.port.checked_add(1).ok_or_else(|| {
            GatewayError::config(format!("port {} leaves no room for HTTPS", self.port))
        })
    }

    /// Check fields every later phase relies on
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (i, service) in self.services.iter().enumerate() {
            if service.cmd.is_empty() {
                errors.push(format!("cmd must not be empty - service {}", i + 1));
            }
        }

        for (i, mapping) in self.mappings.iter().enumerate() {
            if mapping.path.is_empty() {
                errors.push(format!("mapping path not found at element {}", i + 1));
            }
            if mapping.destination.is_empty() {
                errors.push(format!("mapping destination not found at element {}", i + 1));
            }
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(errors.join("; ")));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"{
        "mappings": [
            {"path": "/api", "destination": "http://localhost:{PORT1}"},
            {"path": "/ws", "destination": "ws://localhost:{PORT2}"}
        ],
        "services": [
            {"name": "api", "cmd": "api-server", "args": "-port {PORT1}", "dir": "~/src/api"},
            {"cmd": "chat", "env": "PORT={PORT2} MODE=dev", "auto_reload": true, "silent": true}
        ],
        "port": 9000,
        "parallel": true,
        "silent": false,
        "https": {"enabled": true, "cert": "cert.pem", "key": "key.pem", "nohttp": true},
        "unknown_field": 42
    }"#;

    #[test]
    fn test_parse_config() {
        let config = Config::from_json(FULL_CONFIG).unwrap();

        assert_eq!(config.mappings.len(), 2);
        assert_eq!(config.mappings[0], Mapping::new("/api", "http://localhost:{PORT1}"));
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].name, "api");
        assert_eq!(config.services[0].dir, "~/src/api");
        assert!(config.services[1].auto_reload);
        assert!(config.services[1].silent);
        assert_eq!(config.port, 9000);
        assert!(config.parallel);
        assert!(config.https.enabled);
        assert!(config.https.no_http);
        assert_eq!(config.https.cert, "cert.pem");
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config = Config::from_json(r#"{"services": [{"cmd": "server"}]}"#).unwrap();

        assert!(config.mappings.is_empty());
        assert_eq!(config.port, 0);
        assert!(!config.parallel);
        assert!(!config.silent);
        assert!(!config.https.enabled);
        assert_eq!(config.services[0], Service::command("server"));
    }

    #[test]
    fn test_invalid_json_is_error() {
        let err = Config::from_json("{not json").unwrap_err();
        assert!(matches!(err, GatewayError::Json(_)));
    }

    #[test]
    fn test_port_defaults_to_8000() {
        let mut config = Config::default();
        config.apply_port_overrides(None, None);
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_port_precedence() {
        let mut config = Config {
            port: 7000,
            ..Config::default()
        };
        config.apply_port_overrides(None, None);
        assert_eq!(config.port, 7000);

        config.apply_port_overrides(Some("7100"), None);
        assert_eq!(config.port, 7100);

        config.apply_port_overrides(Some("7100"), Some(7200));
        assert_eq!(config.port, 7200);
    }

    #[test]
    fn test_invalid_env_port_is_ignored() {
        let mut config = Config {
            port: 7000,
            ..Config::default()
        };
        config.apply_port_overrides(Some("not-a-port"), None);
        assert_eq!(config.port, 7000);
    }

    #[test]
    fn test_https_port_is_base_plus_one() {
        let config = Config {
            port: 8000,
            ..Config::default()
        };
        assert_eq!(config.http_port(), 8000);
        assert_eq!(config.https_port().unwrap(), 8001);

        let config = Config {
            port: u16::MAX,
            ..Config::default()
        };
        assert!(config.https_port().is_err());
    }

    #[test]
    fn test_serves_http() {
        let mut https = HttpsConfig::default();
        assert!(https.serves_http());

        https.no_http = true;
        assert!(https.serves_http());

        https.enabled = true;
        assert!(!https.serves_http());

        https.no_http = false;
        assert!(https.serves_http());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let config = Config {
            mappings: vec![Mapping::new("", "http://x"), Mapping::new("/b", "")],
            services: vec![Service::command("ok"), Service::default()],
            ..Config::default()
        };

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("cmd must not be empty - service 2"));
        assert!(err.contains("mapping path not found at element 1"));
        assert!(err.contains("mapping destination not found at element 2"));
    }

    #[test]
    fn test_service_label() {
        assert_eq!(Service::command("server").label(), "server");
        assert_eq!(Service::command("server").with_name("api").label(), "api");
    }

    #[test]
    fn test_placeholder_source_args_then_env() {
        let service = Service::command("x")
            .with_args("--port {PORT1}")
            .with_env("OTHER={PORT2}");
        assert_eq!(service.placeholder_source(), "--port {PORT1}OTHER={PORT2}");
    }
}
