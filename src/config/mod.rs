//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use reqwest::Url;

use crate::game::mode::DEFAULT_MAX_LAG_FORGIVEN;
use crate::persist::Credentials;
use crate::util::time::parse_duration;

const DEFAULT_MAX_MATCHES: usize = 100;
const DEFAULT_PROTECTION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_REGION: &str = "us-east-1";

/// How player tokens are verified
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMode {
    /// RS256 against a Cognito user pool's JWKS
    Cognito { region: String, user_pool_id: String },
    /// HS256 with a shared secret (local/dev)
    SharedSecret(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Lambda functions receiving final records
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizerFunctions {
    pub end: String,
    pub abort: String,
}

/// PostgREST-style match store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreEndpoint {
    pub url: String,
    pub service_key: String,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Address handed out to matched players
    pub public_server_addr: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,

    pub auth: AuthMode,

    pub aws_region: String,
    /// SigV4 credentials, when present in the environment
    pub aws_credentials: Option<Credentials>,

    /// Snapshot sink (AppSync GraphQL endpoint)
    pub appsync_url: Option<Url>,
    /// Role meant for sink writes; credentials still come from the environment
    pub appsync_role_arn: Option<String>,
    pub finalizer: Option<FinalizerFunctions>,
    pub store: Option<StoreEndpoint>,
    pub ecs_agent_uri: Option<String>,
    pub matchmaking_notify_url: Option<String>,

    /// Admission ceiling reported on /status
    pub max_matches: usize,
    /// Initial protection horizon while idle
    pub protection_timeout: Duration,
    /// Per-move lag credit ceiling
    pub max_lag_forgiven: Duration,

    /// Allowed client origins for CORS, comma-separated or `*`
    pub client_origin: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        // PORT wins over SERVER_ADDR
        let server_addr = match get("PORT") {
            Some(port) => format!("0.0.0.0:{}", port),
            None => get("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        };
        let server_addr: SocketAddr = server_addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress)?;

        let log_format = match get("LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => return Err(ConfigError::invalid("LOG_FORMAT", other)),
        };

        let auth = match (get("COGNITO_USER_POOL_ID"), get("AUTH_JWT_SECRET")) {
            (Some(user_pool_id), _) => AuthMode::Cognito {
                region: require("AWS_REGION")?,
                user_pool_id,
            },
            (None, Some(secret)) => AuthMode::SharedSecret(secret),
            (None, None) => return Err(ConfigError::Missing("COGNITO_USER_POOL_ID or AUTH_JWT_SECRET")),
        };

        let aws_credentials = match (get("AWS_ACCESS_KEY_ID"), get("AWS_SECRET_ACCESS_KEY")) {
            (Some(access_key_id), Some(secret_access_key)) => Some(Credentials {
                access_key_id,
                secret_access_key,
                session_token: get("AWS_SESSION_TOKEN"),
            }),
            _ => None,
        };

        let appsync_url = get("APPSYNC_HTTP_URL")
            .map(|raw| Url::parse(&raw).map_err(|_| ConfigError::invalid("APPSYNC_HTTP_URL", &raw)))
            .transpose()?;

        let finalizer = match (get("END_GAME_FUNCTION_ARN"), get("ABORT_GAME_FUNCTION_ARN")) {
            (Some(end), Some(abort)) => Some(FinalizerFunctions { end, abort }),
            (Some(_), None) => return Err(ConfigError::Missing("ABORT_GAME_FUNCTION_ARN")),
            (None, Some(_)) => return Err(ConfigError::Missing("END_GAME_FUNCTION_ARN")),
            (None, None) => None,
        };

        let store = match get("STORE_URL") {
            Some(url) => Some(StoreEndpoint {
                url,
                service_key: require("STORE_SERVICE_KEY")?,
            }),
            None => None,
        };

        let max_matches = match get("MAX_MATCHES") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("MAX_MATCHES", &raw))?,
            None => DEFAULT_MAX_MATCHES,
        };

        Ok(Self {
            public_server_addr: get("PUBLIC_SERVER_ADDR").unwrap_or_else(|| server_addr.to_string()),
            server_addr,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format,
            auth,
            aws_region: get("AWS_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            aws_credentials,
            appsync_url,
            appsync_role_arn: get("APPSYNC_ACCESS_ROLE_ARN"),
            finalizer,
            store,
            ecs_agent_uri: get("ECS_AGENT_URI"),
            matchmaking_notify_url: get("MATCHMAKING_NOTIFY_URL"),
            max_matches,
            protection_timeout: duration(&get, "SERVER_PROTECTION_TIMEOUT", DEFAULT_PROTECTION_TIMEOUT)?,
            max_lag_forgiven: duration(&get, "MAX_LAG_FORGIVEN", DEFAULT_MAX_LAG_FORGIVEN)?,
            client_origin: get("CLIENT_ORIGIN").unwrap_or_else(|| "*".to_string()),
        })
    }
}

fn duration(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match get(key) {
        Some(raw) => parse_duration(&raw).ok_or_else(|| ConfigError::invalid(key, &raw)),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_with_shared_secret() {
        let config = load(&[("AUTH_JWT_SECRET", "dev")]).unwrap();
        assert_eq!(config.server_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.public_server_addr, "0.0.0.0:8080");
        assert_eq!(config.auth, AuthMode::SharedSecret("dev".into()));
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.max_matches, 100);
        assert_eq!(config.protection_timeout, Duration::from_secs(600));
        assert_eq!(config.max_lag_forgiven, Duration::from_millis(200));
        assert_eq!(config.client_origin, "*");
        assert!(config.store.is_none());
        assert!(config.finalizer.is_none());
        assert!(config.aws_credentials.is_none());
    }

    #[test]
    fn port_overrides_server_addr() {
        let config = load(&[
            ("AUTH_JWT_SECRET", "dev"),
            ("PORT", "9000"),
            ("SERVER_ADDR", "127.0.0.1:1"),
        ])
        .unwrap();
        assert_eq!(config.server_addr.port(), 9000);
    }

    #[test]
    fn cognito_needs_region() {
        assert!(matches!(
            load(&[("COGNITO_USER_POOL_ID", "pool")]),
            Err(ConfigError::Missing("AWS_REGION"))
        ));
        let config = load(&[
            ("COGNITO_USER_POOL_ID", "pool"),
            ("AWS_REGION", "eu-west-1"),
            ("AUTH_JWT_SECRET", "ignored"),
        ])
        .unwrap();
        assert_eq!(
            config.auth,
            AuthMode::Cognito {
                region: "eu-west-1".into(),
                user_pool_id: "pool".into()
            }
        );
    }

    #[test]
    fn some_auth_is_required() {
        assert!(matches!(load(&[]), Err(ConfigError::Missing(_))));
        assert!(matches!(load(&[("AUTH_JWT_SECRET", "  ")]), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn durations_and_counts() {
        let config = load(&[
            ("AUTH_JWT_SECRET", "dev"),
            ("SERVER_PROTECTION_TIMEOUT", "1h30m"),
            ("MAX_LAG_FORGIVEN", "350ms"),
            ("MAX_MATCHES", "12"),
        ])
        .unwrap();
        assert_eq!(config.protection_timeout, Duration::from_secs(5400));
        assert_eq!(config.max_lag_forgiven, Duration::from_millis(350));
        assert_eq!(config.max_matches, 12);

        assert!(matches!(
            load(&[("AUTH_JWT_SECRET", "dev"), ("SERVER_PROTECTION_TIMEOUT", "soon")]),
            Err(ConfigError::Invalid { key: "SERVER_PROTECTION_TIMEOUT", .. })
        ));
        assert!(matches!(
            load(&[("AUTH_JWT_SECRET", "dev"), ("MAX_MATCHES", "-1")]),
            Err(ConfigError::Invalid { key: "MAX_MATCHES", .. })
        ));
    }

    #[test]
    fn collaborators_come_in_pairs() {
        assert!(matches!(
            load(&[("AUTH_JWT_SECRET", "dev"), ("END_GAME_FUNCTION_ARN", "end")]),
            Err(ConfigError::Missing("ABORT_GAME_FUNCTION_ARN"))
        ));
        assert!(matches!(
            load(&[("AUTH_JWT_SECRET", "dev"), ("STORE_URL", "http://db")]),
            Err(ConfigError::Missing("STORE_SERVICE_KEY"))
        ));

        let config = load(&[
            ("AUTH_JWT_SECRET", "dev"),
            ("END_GAME_FUNCTION_ARN", "end"),
            ("ABORT_GAME_FUNCTION_ARN", "abort"),
            ("AWS_ACCESS_KEY_ID", "AKID"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
            ("APPSYNC_HTTP_URL", "https://api.example.com/graphql"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();
        assert_eq!(config.finalizer.unwrap().abort, "abort");
        assert_eq!(config.aws_credentials.unwrap().session_token, None);
        assert_eq!(config.appsync_url.unwrap().host_str(), Some("api.example.com"));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            load(&[("AUTH_JWT_SECRET", "dev"), ("SERVER_ADDR", "nowhere")]),
            Err(ConfigError::InvalidAddress)
        ));
        assert!(matches!(
            load(&[("AUTH_JWT_SECRET", "dev"), ("APPSYNC_HTTP_URL", "not a url")]),
            Err(ConfigError::Invalid { key: "APPSYNC_HTTP_URL", .. })
        ));
        assert!(matches!(
            load(&[("AUTH_JWT_SECRET", "dev"), ("LOG_FORMAT", "xml")]),
            Err(ConfigError::Invalid { key: "LOG_FORMAT", .. })
        ));
    }
}
