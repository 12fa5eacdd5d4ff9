//! Client configuration.
//!
//! Configuration is read once at startup, either deserialized from a file
//! or taken from `WIDE_TABLE_*` environment variables. It only affects how
//! the session is established, never the data model.

use aws_config::BehaviorVersion;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_dynamodb::config::{Credentials, Region};
use aws_types::SdkConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::backend::BackendKind;

/// Default item cache capacity
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Default region
pub const DEFAULT_REGION: &str = "us-east-1";

const ENV_PREFIX: &str = "WIDE_TABLE_";

/// Settings used to establish a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend implementation
    pub backend: BackendKind,
    /// Endpoint URL, the SDK default when unset
    pub endpoint: Option<String>,
    /// Prefix for physical table names
    pub keyspace: Option<String>,
    /// Static access key id
    pub access_key_id: Option<String>,
    /// Static secret access key
    pub secret_access_key: Option<String>,
    /// Region or datacenter
    pub region: String,
    /// Enable the read-through item cache
    pub enable_cache: bool,
    /// Item cache capacity
    pub cache_capacity: usize,
    /// Connect timeout
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Per-request read timeout
    #[serde(with = "millis")]
    pub read_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::DynamoDb,
            endpoint: None,
            keyspace: None,
            access_key_id: None,
            secret_access_key: None,
            region: DEFAULT_REGION.to_string(),
            enable_cache: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(20),
        }
    }
}

impl ClientConfig {
    /// Configuration for the in-memory emulator
    pub fn memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            ..Self::default()
        }
    }

    /// Read `WIDE_TABLE_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a variable lookup.
    ///
    /// Unset or empty variables keep their defaults; unparsable values are
    /// logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let defaults = Self::default();
        let mut config = Self {
            backend: parse_or(get("BACKEND"), "BACKEND", defaults.backend),
            endpoint: get("ENDPOINT"),
            keyspace: get("KEYSPACE"),
            access_key_id: get("ACCESS_KEY_ID"),
            secret_access_key: get("SECRET_ACCESS_KEY"),
            region: get("REGION").unwrap_or(defaults.region),
            enable_cache: parse_bool(get("ENABLE_CACHE"), "ENABLE_CACHE", defaults.enable_cache),
            cache_capacity: parse_or(
                get("CACHE_CAPACITY"),
                "CACHE_CAPACITY",
                defaults.cache_capacity,
            ),
            connect_timeout: Duration::from_millis(parse_or(
                get("CONNECT_TIMEOUT_MS"),
                "CONNECT_TIMEOUT_MS",
                millis_of(defaults.connect_timeout),
            )),
            read_timeout: Duration::from_millis(parse_or(
                get("READ_TIMEOUT_MS"),
                "READ_TIMEOUT_MS",
                millis_of(defaults.read_timeout),
            )),
        };

        if config.access_key_id.is_some() != config.secret_access_key.is_some() {
            warn!("both access key id and secret access key are required, ignoring credentials");
            config.access_key_id = None;
            config.secret_access_key = None;
        }
        if config.cache_capacity == 0 {
            warn!("cache capacity must be positive, using {DEFAULT_CACHE_CAPACITY}");
            config.cache_capacity = DEFAULT_CACHE_CAPACITY;
        }

        config
    }

    /// Set the endpoint URL
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the keyspace prefix
    pub fn with_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = Some(keyspace.into());
        self
    }

    /// Set static credentials
    pub fn with_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }

    /// Enable the item cache with the given capacity
    pub fn with_cache(mut self, capacity: usize) -> Self {
        self.enable_cache = true;
        self.cache_capacity = capacity.max(1);
        self
    }

    /// Load the AWS SDK configuration for the DynamoDB backend.
    ///
    /// SDK retries are disabled: a failed call surfaces to the caller, who
    /// owns the retry policy.
    pub async fn load_sdk_config(&self) -> SdkConfig {
        let timeout_config = TimeoutConfig::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .build();

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .retry_config(RetryConfig::disabled())
            .timeout_config(timeout_config);

        if let Some(endpoint) = &self.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        if let (Some(id), Some(secret)) = (&self.access_key_id, &self.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                id.clone(),
                secret.clone(),
                None,
                None,
                "wide-table",
            ));
        }

        loader.load().await
    }
}

fn millis_of(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_or<T: FromStr>(value: Option<String>, name: &str, default: T) -> T {
    match value {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, "invalid {ENV_PREFIX}{name}, using default");
            default
        }),
    }
}

fn parse_bool(value: Option<String>, name: &str, default: bool) -> bool {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => default,
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        Some(raw) => {
            warn!(variable = name, value = %raw, "invalid {ENV_PREFIX}{name}, using default");
            default
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(super::millis_of(*value))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[]));
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.backend, BackendKind::DynamoDb);
        assert_eq!(config.region, "us-east-1");
        assert!(!config.enable_cache);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_from_lookup() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("WIDE_TABLE_BACKEND", "memory"),
            ("WIDE_TABLE_ENDPOINT", "http://127.0.0.1:8000"),
            ("WIDE_TABLE_KEYSPACE", "payments"),
            ("WIDE_TABLE_ACCESS_KEY_ID", "local"),
            ("WIDE_TABLE_SECRET_ACCESS_KEY", "secret"),
            ("WIDE_TABLE_REGION", "eu-west-1"),
            ("WIDE_TABLE_ENABLE_CACHE", "true"),
            ("WIDE_TABLE_CACHE_CAPACITY", "64"),
            ("WIDE_TABLE_READ_TIMEOUT_MS", "1500"),
        ]));

        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.endpoint.as_deref(), Some("http://127.0.0.1:8000"));
        assert_eq!(config.keyspace.as_deref(), Some("payments"));
        assert_eq!(config.access_key_id.as_deref(), Some("local"));
        assert_eq!(config.region, "eu-west-1");
        assert!(config.enable_cache);
        assert_eq!(config.cache_capacity, 64);
        assert_eq!(config.read_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("WIDE_TABLE_BACKEND", "cassandra"),
            ("WIDE_TABLE_ENABLE_CACHE", "maybe"),
            ("WIDE_TABLE_CACHE_CAPACITY", "0"),
            ("WIDE_TABLE_CONNECT_TIMEOUT_MS", "soon"),
            ("WIDE_TABLE_ACCESS_KEY_ID", "only-half"),
        ]));

        assert_eq!(config.backend, BackendKind::DynamoDb);
        assert!(!config.enable_cache);
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.access_key_id, None);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ClientConfig =
            serde_json::from_str(r#"{ "backend": "memory", "read_timeout": 250 }"#).unwrap();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.read_timeout, Duration::from_millis(250));
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
    }
}
