use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use std::time::Duration;

/// Broker connection parameters, passed through to the transport verbatim.
#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde_inline_default("localhost".to_string())]
    pub hostname: String,
    #[serde_inline_default(5672)]
    pub port: u16,
    #[serde_inline_default("guest".to_string())]
    pub username: String,
    #[serde_inline_default("guest".to_string())]
    pub password: String,
    #[serde_inline_default(Duration::from_secs(30))]
    #[serde(with = "duration")]
    pub heartbeat: Duration,
    /// Maximum frame size; zero lets the broker decide.
    #[serde_inline_default(0)]
    pub frame_max: u32,
    #[serde_inline_default("en_US".to_string())]
    pub locale: String,
    #[serde_inline_default("/".to_string())]
    pub vhost: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default()))
            .expect("inline defaults always deserialize")
    }
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Request queue of the server to call. A random name is generated when
    /// absent, which is only useful when the server is configured the same way.
    #[serde_inline_default(None)]
    pub queue: Option<String>,
    #[serde_inline_default(1)]
    pub prefetch: u16,
    #[serde_inline_default(false)]
    pub reconnect: bool,
    #[serde_inline_default(Duration::from_secs(30))]
    #[serde(with = "duration")]
    pub reconnect_timeout: Duration,
    /// How long a call may wait for its reply. Zero disables the deadline.
    #[serde_inline_default(Duration::ZERO)]
    #[serde(with = "duration")]
    pub timeout: Duration,
    #[serde_inline_default(Duration::from_secs(1))]
    #[serde(with = "duration")]
    pub sweep_interval: Duration,
    #[serde_inline_default(DEFAULT_BUFFER_CAPACITY)]
    pub buffer_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default()))
            .expect("inline defaults always deserialize")
    }
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Request queue to serve. A random name is generated when absent.
    #[serde_inline_default(None)]
    pub queue: Option<String>,
    /// Maximum number of requests handled concurrently.
    #[serde_inline_default(3)]
    pub prefetch: u16,
    #[serde_inline_default(false)]
    pub reconnect: bool,
    #[serde_inline_default(Duration::from_secs(30))]
    #[serde(with = "duration")]
    pub reconnect_timeout: Duration,
    #[serde_inline_default(DEFAULT_BUFFER_CAPACITY)]
    pub buffer_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default()))
            .expect("inline defaults always deserialize")
    }
}

pub const DEFAULT_BUFFER_CAPACITY: usize = 1 << 16;

/// Durations are written in humantime notation (`"30s"`) or as a plain
/// number of seconds (`30`, `0.5`).
mod duration {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        humantime_serde::serialize(value, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Seconds(f64),
            Text(#[serde(with = "humantime_serde")] Duration),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Seconds(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|err| D::Error::custom(format!("invalid duration {secs}: {err}"))),
            Repr::Text(value) => Ok(value),
        }
    }
}

pub(crate) fn generated_queue_name(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let client = ClientConfig::default();
        assert_eq!(client.prefetch, 1);
        assert_eq!(client.timeout, Duration::ZERO);
        assert_eq!(client.reconnect_timeout, Duration::from_secs(30));
        assert_eq!(client.connection.hostname, "localhost");
        assert_eq!(client.connection.port, 5672);
        assert_eq!(client.connection.vhost, "/");

        let server = ServerConfig::default();
        assert_eq!(server.prefetch, 3);
        assert!(!server.reconnect);
        assert_eq!(server.buffer_capacity, DEFAULT_BUFFER_CAPACITY);
    }

    #[test]
    fn test_parse_config() {
        let config: ClientConfig = serde_json::from_value(serde_json::json!({
            "hostname": "rabbit",
            "frameMax": 4096,
            "queue": "test",
            "reconnect": true,
            "reconnectTimeout": "5s",
            "timeout": "20s",
        }))
        .unwrap();
        assert_eq!(config.connection.hostname, "rabbit");
        assert_eq!(config.connection.frame_max, 4096);
        assert_eq!(config.connection.username, "guest");
        assert_eq!(config.queue.as_deref(), Some("test"));
        assert!(config.reconnect);
        assert_eq!(config.reconnect_timeout, Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_seconds() {
        let config: ClientConfig = serde_json::from_value(serde_json::json!({
            "timeout": 5,
            "reconnectTimeout": 30,
            "sweepInterval": 0.5,
            "heartbeat": 10,
        }))
        .unwrap();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect_timeout, Duration::from_secs(30));
        assert_eq!(config.sweep_interval, Duration::from_millis(500));
        assert_eq!(config.connection.heartbeat, Duration::from_secs(10));

        let server: ServerConfig =
            serde_json::from_value(serde_json::json!({"reconnectTimeout": 2})).unwrap();
        assert_eq!(server.reconnect_timeout, Duration::from_secs(2));

        let text = serde_json::to_value(&config).unwrap();
        assert_eq!(text["timeout"], "5s");
        assert_eq!(serde_json::from_value::<ClientConfig>(text).unwrap(), config);

        assert!(serde_json::from_value::<ClientConfig>(serde_json::json!({"timeout": -1})).is_err());
        assert!(serde_json::from_value::<ClientConfig>(serde_json::json!({"timeout": "soon"})).is_err());
    }

    #[test]
    fn test_generated_queue_name() {
        let a = generated_queue_name("server-rpc");
        let b = generated_queue_name("server-rpc");
        assert!(a.starts_with("server-rpc-"));
        assert_ne!(a, b);
    }
}
