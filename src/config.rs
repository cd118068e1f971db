//! Server configuration, resolved from environment variables with an
//! optional TOML file overlay.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    FileParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_optional_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}

/// Everything the core server needs to start listening and to behave on
/// requests that carry no instructions of their own.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub auth_realm: String,
    pub ignore_upstream_proxy_certificate: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8000,
            auth_realm: "proxychain".to_string(),
            ignore_upstream_proxy_certificate: false,
        }
    }
}

impl ServerConfig {
    /// Resolve configuration from environment variables, following the
    /// layered `PROXYCHAIN_*`-prefixed convention; an optional TOML file
    /// (set via `--config`) is applied first, so environment variables
    /// always win.
    pub fn resolve(config_file: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = match config_file {
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
                        path: path.display().to_string(),
                        source,
                    })?;
                toml::from_str(&contents).map_err(|source| ConfigError::FileParse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => ServerConfig::default(),
        };

        if let Some(host) = optional_env("PROXYCHAIN_LISTEN_HOST") {
            config.listen_host = host;
        }
        if let Some(port) = parse_optional_env::<u16>("PROXYCHAIN_LISTEN_PORT")? {
            config.listen_port = port;
        }
        if let Some(realm) = optional_env("PROXYCHAIN_AUTH_REALM") {
            config.auth_realm = realm;
        }
        if let Some(ignore_cert) =
            parse_optional_env::<bool>("PROXYCHAIN_IGNORE_UPSTREAM_PROXY_CERTIFICATE")?
        {
            config.ignore_upstream_proxy_certificate = ignore_cert;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_when_nothing_is_set() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_host, "127.0.0.1");
        assert_eq!(config.listen_port, 8000);
        assert!(!config.ignore_upstream_proxy_certificate);
    }

    #[test]
    fn file_is_parsed_when_provided() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxychain.toml");
        std::fs::write(
            &path,
            "listen_host = \"0.0.0.0\"\nlisten_port = 9000\nauth_realm = \"custom\"\nignore_upstream_proxy_certificate = true\n",
        )
        .unwrap();

        let config = ServerConfig::resolve(Some(&path)).unwrap();
        assert_eq!(config.listen_host, "0.0.0.0");
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.auth_realm, "custom");
        assert!(config.ignore_upstream_proxy_certificate);
    }
}
