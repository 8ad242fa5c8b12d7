//! Process configuration.
//!
//! Defaults, then an optional TOML file, then environment variables. The
//! environment names match the ones existing deployments already set
//! (`LISTEN_PORT`, `ALLOW_ADDR_REGEX`, ...). The result is immutable for the
//! life of the process.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{env, ffi::OsString, fs, path::Path, time::Duration};

/// Names an explicit config file; when unset `config.toml` is used if present.
pub const CONFIG_PATH_ENV: &str = "WSPROXY_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub destination: DestinationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Address of the WebSocket endpoint. Go-style `:80` binds all interfaces.
    pub addr: String,
    /// HTTP path clients upgrade on.
    pub path: String,
    pub metrics_addr: String,
    pub tls: Option<TlsConfig>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:80".to_string(),
            path: "/v1".to_string(),
            metrics_addr: "0.0.0.0:2112".to_string(),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub allow_addr_regex: Option<String>,
    pub allow_addr_suffixes: Vec<String>,
    pub append_port: String,
    pub use_host_header: bool,
    pub unix_socket_path: Option<String>,
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log every relayed payload.
    pub traffic: bool,
    /// Log one line per incoming request.
    pub connections: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            traffic: false,
            connections: true,
        }
    }
}

pub fn load_config() -> Result<Config> {
    let mut config = match env::var(CONFIG_PATH_ENV) {
        Ok(path) => read_config_file(Path::new(&path))?,
        Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            read_config_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        Err(_) => Config::default(),
    };
    config.apply_env(utf8_vars(env::vars_os()))?;
    config.validate()?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Invalid config file {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).context("Failed to parse config as valid TOML")
}

impl Config {
    /// Applies recognized environment variables on top of the current values.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let (mut cert_file, mut key_file) = self
            .listen
            .tls
            .take()
            .map_or((None, None), |tls| (Some(tls.cert_file), Some(tls.key_file)));

        for (key, value) in vars {
            match key.as_str() {
                "LISTEN_PORT" => self.listen.addr = value,
                "LISTEN_PATH" => self.listen.path = value,
                "PROMETHEUS_BIND" => self.listen.metrics_addr = value,
                "TLS_CERT_FILE" => cert_file = non_empty(value),
                "TLS_KEY_FILE" => key_file = non_empty(value),
                "ALLOW_ADDR_REGEX" => self.destination.allow_addr_regex = non_empty(value),
                "ALLOW_ADDR_SUFFIXES" => {
                    self.destination.allow_addr_suffixes = value
                        .split(',')
                        .map(str::trim)
                        .filter(|suffix| !suffix.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "APPEND_PORT" => self.destination.append_port = value,
                "USE_HOST_HEADER" => self.destination.use_host_header = parse_bool(&key, &value)?,
                "UNIX_SOCKET_PATH" => self.destination.unix_socket_path = non_empty(value),
                "IDLE_TIMEOUT_SECS" => {
                    self.destination.idle_timeout_secs = match value.trim() {
                        "" => None,
                        secs => Some(secs.parse::<u64>().with_context(|| {
                            format!("{key} must be a whole number of seconds, got {value:?}")
                        })?),
                    };
                }
                "LOG_TRAFFIC" => self.logging.traffic = parse_bool(&key, &value)?,
                "LOG_CONN_INFO" => self.logging.connections = parse_bool(&key, &value)?,
                _ => {}
            }
        }

        self.listen.tls = match (cert_file, key_file) {
            (Some(cert_file), Some(key_file)) => Some(TlsConfig {
                cert_file,
                key_file,
            }),
            (None, None) => None,
            _ => bail!("TLS requires both a certificate file and a private key file"),
        };
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.addr.trim().is_empty() {
            bail!("Listen address must not be empty");
        }
        if !self.listen.path.starts_with('/') {
            bail!("Listen path must start with '/', got {:?}", self.listen.path);
        }
        if self.destination.idle_timeout_secs == Some(0) {
            bail!("Idle timeout must be greater than zero when set");
        }
        Ok(())
    }

    #[must_use]
    pub fn listen_addr(&self) -> String {
        normalize_bind_addr(&self.listen.addr)
    }

    #[must_use]
    pub fn metrics_addr(&self) -> String {
        normalize_bind_addr(&self.listen.metrics_addr)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.destination.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Accepts Go-style `:port` addresses by binding every interface.
fn normalize_bind_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Skips variables that are not valid UTF-8; none of the recognized ones can be.
fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("{key} must be a boolean, got {value:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    mod defaults {
        use super::*;

        #[test]
        fn match_existing_deployments() {
            let config = Config::default();
            assert_eq!(config.listen_addr(), "0.0.0.0:80");
            assert_eq!(config.metrics_addr(), "0.0.0.0:2112");
            assert_eq!(config.listen.path, "/v1");
            assert!(config.listen.tls.is_none());
            assert!(config.destination.allow_addr_regex.is_none());
            assert!(config.destination.allow_addr_suffixes.is_empty());
            assert!(!config.destination.use_host_header);
            assert!(!config.logging.traffic);
            assert!(config.logging.connections);
            assert_eq!(config.idle_timeout(), None);
            config.validate().unwrap();
        }
    }

    mod toml_file {
        use super::*;

        #[test]
        fn parses_full_document() {
            let config = parse_config(
                r#"
                [listen]
                addr = "127.0.0.1:8080"
                path = "/proxy"
                metrics_addr = "127.0.0.1:9090"

                [listen.tls]
                cert_file = "cert.pem"
                key_file = "key.pem"

                [destination]
                allow_addr_suffixes = [".neon.tech:5432"]
                append_port = ":5432"
                use_host_header = true
                idle_timeout_secs = 300

                [logging]
                traffic = true
                connections = false
                "#,
            )
            .unwrap();

            assert_eq!(config.listen_addr(), "127.0.0.1:8080");
            assert_eq!(config.listen.path, "/proxy");
            assert_eq!(config.listen.tls.unwrap().key_file, "key.pem");
            assert_eq!(config.destination.allow_addr_suffixes, vec![".neon.tech:5432"]);
            assert_eq!(config.destination.append_port, ":5432");
            assert!(config.destination.use_host_header);
            assert_eq!(config.destination.idle_timeout_secs, Some(300));
            assert!(config.logging.traffic);
            assert!(!config.logging.connections);
        }

        #[test]
        fn partial_document_keeps_defaults() {
            let config = parse_config("[destination]\nappend_port = \":6543\"\n").unwrap();
            assert_eq!(config.listen.path, "/v1");
            assert!(config.logging.connections);
            assert_eq!(config.destination.append_port, ":6543");
        }

        #[test]
        fn rejects_invalid_toml() {
            assert!(parse_config("[listen\naddr = 1").is_err());
        }

        #[test]
        fn reads_file_from_disk() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("wsproxy.toml");
            fs::write(&path, "[listen]\naddr = \":8443\"\n").unwrap();

            let config = read_config_file(&path).unwrap();
            assert_eq!(config.listen_addr(), "0.0.0.0:8443");
        }

        #[test]
        fn missing_explicit_file_is_an_error() {
            let error = read_config_file(Path::new("/nonexistent/wsproxy.toml")).unwrap_err();
            assert!(error.to_string().contains("Failed to read config file"));
        }
    }

    mod environment {
        use super::*;

        #[test]
        fn overrides_every_option() {
            let mut config = Config::default();
            config
                .apply_env(vars(&[
                    ("LISTEN_PORT", ":8080"),
                    ("PROMETHEUS_BIND", "127.0.0.1:2113"),
                    ("LISTEN_PATH", "/ws"),
                    ("ALLOW_ADDR_REGEX", r"^.*\.neon\.tech:5432$"),
                    ("APPEND_PORT", ":5432"),
                    ("USE_HOST_HEADER", "true"),
                    ("LOG_TRAFFIC", "1"),
                    ("LOG_CONN_INFO", "false"),
                    ("UNIX_SOCKET_PATH", "/tmp/.s.PGSQL.5432"),
                    ("IDLE_TIMEOUT_SECS", "60"),
                    ("TLS_CERT_FILE", "cert.pem"),
                    ("TLS_KEY_FILE", "key.pem"),
                    ("UNRELATED", "ignored"),
                ]))
                .unwrap();

            assert_eq!(config.listen_addr(), "0.0.0.0:8080");
            assert_eq!(config.metrics_addr(), "127.0.0.1:2113");
            assert_eq!(config.listen.path, "/ws");
            assert_eq!(
                config.destination.allow_addr_regex.as_deref(),
                Some(r"^.*\.neon\.tech:5432$")
            );
            assert_eq!(config.destination.append_port, ":5432");
            assert!(config.destination.use_host_header);
            assert!(config.logging.traffic);
            assert!(!config.logging.connections);
            assert_eq!(
                config.destination.unix_socket_path.as_deref(),
                Some("/tmp/.s.PGSQL.5432")
            );
            assert_eq!(config.idle_timeout(), Some(Duration::from_secs(60)));
            assert_eq!(config.listen.tls.unwrap().cert_file, "cert.pem");
        }

        #[test]
        fn splits_suffix_list() {
            let mut config = Config::default();
            config
                .apply_env(vars(&[("ALLOW_ADDR_SUFFIXES", ".neon.tech:5432, .local:5432,,")]))
                .unwrap();
            assert_eq!(
                config.destination.allow_addr_suffixes,
                vec![".neon.tech:5432", ".local:5432"]
            );
        }

        #[test]
        fn empty_values_clear_optional_settings() {
            let mut config = parse_config(
                "[destination]\nallow_addr_regex = \"neon\"\nunix_socket_path = \"/tmp/s\"\n",
            )
            .unwrap();
            config
                .apply_env(vars(&[("ALLOW_ADDR_REGEX", ""), ("UNIX_SOCKET_PATH", "")]))
                .unwrap();
            assert!(config.destination.allow_addr_regex.is_none());
            assert!(config.destination.unix_socket_path.is_none());
        }

        #[test]
        fn rejects_malformed_boolean() {
            let mut config = Config::default();
            let error = config
                .apply_env(vars(&[("USE_HOST_HEADER", "maybe")]))
                .unwrap_err();
            assert!(error.to_string().contains("USE_HOST_HEADER must be a boolean"));
        }

        #[test]
        fn rejects_malformed_idle_timeout() {
            let mut config = Config::default();
            assert!(config.apply_env(vars(&[("IDLE_TIMEOUT_SECS", "soon")])).is_err());
        }

        #[test]
        fn tls_needs_both_files() {
            let mut config = Config::default();
            let error = config
                .apply_env(vars(&[("TLS_CERT_FILE", "cert.pem")]))
                .unwrap_err();
            assert!(error.to_string().contains("TLS requires both"));
        }

        #[test]
        fn env_completes_tls_from_file() {
            let mut config =
                parse_config("[listen.tls]\ncert_file = \"a.pem\"\nkey_file = \"b.pem\"\n").unwrap();
            config.apply_env(vars(&[("TLS_KEY_FILE", "c.pem")])).unwrap();
            let tls = config.listen.tls.unwrap();
            assert_eq!(tls.cert_file, "a.pem");
            assert_eq!(tls.key_file, "c.pem");
        }
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_variables_are_skipped() {
        use std::os::unix::ffi::OsStringExt;

        let raw = vec![
            (OsString::from("UNRELATED"), OsString::from_vec(vec![0xff, 0xfe])),
            (OsString::from_vec(vec![0xc3, 0x28]), OsString::from("x")),
            (OsString::from("LISTEN_PATH"), OsString::from("/ws")),
        ];

        let mut config = Config::default();
        config.apply_env(utf8_vars(raw)).unwrap();
        assert_eq!(config.listen.path, "/ws");
    }

    mod validation {
        use super::*;

        #[test]
        fn rejects_relative_path() {
            let mut config = Config::default();
            config.listen.path = "v1".to_string();
            assert!(config.validate().is_err());
        }

        #[test]
        fn rejects_zero_idle_timeout() {
            let mut config = Config::default();
            config.destination.idle_timeout_secs = Some(0);
            assert!(config.validate().is_err());
        }
    }
}
