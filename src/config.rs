// Gateway configuration, read from environment variables. Everything has a
// default except the broker port, which only makes sense together with a host.
use std::path::{Path, PathBuf};

use anyhow::anyhow;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_TOPIC: &str = "afm/v1/#";
pub const DEFAULT_CLIENT_ID: &str = "device-gateway";
pub const DEFAULT_ID_FILE: &str = "/var/cache/afm/identifier.id";
pub const DEFAULT_HTTP_ADDR: &str = "localhost:8080";
pub const DEFAULT_CACHE_ROOT: &str = "/var/cache/afm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
    pub topic: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub mqtt: MqttSettings,
    /// DuckDB file; `None` keeps the database in memory.
    pub db_path: Option<String>,
    pub db_seed: Option<PathBuf>,
    pub http_addr: String,
    pub cache_root: PathBuf,
    pub log: LogSettings,
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let (host, port) = match (get("MQTT_HOST"), get("MQTT_PORT")) {
            (None, None) => ("localhost".to_string(), DEFAULT_MQTT_PORT),
            (Some(host), Some(port)) => {
                let port = port.trim().parse::<u16>().map_err(|e| {
                    anyhow!("Invalid MQTT_PORT value, expected a number, got: {}", e)
                })?;
                (host, port)
            }
            (Some(host), None) => (host, DEFAULT_MQTT_PORT),
            (None, Some(_)) => {
                return Err(anyhow!("MQTT_HOST must be set if MQTT_PORT is provided"));
            }
        };

        // Credentials are only used when both halves are present.
        let credentials = match (get("MQTT_USER"), get("MQTT_PASS")) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };

        let id_file = get("GATEWAY_ID_FILE").unwrap_or_else(|| DEFAULT_ID_FILE.to_string());
        let client_id = get("MQTT_CLIENT_ID")
            .or_else(|| read_identifier(Path::new(&id_file)))
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());

        let format = match get("LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => return Err(anyhow!("LOG_FORMAT must be 'text' or 'json', got '{}'", other)),
        };

        Ok(GatewayConfig {
            mqtt: MqttSettings {
                host,
                port,
                credentials,
                topic: get("MQTT_TOPIC").unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
                client_id,
            },
            db_path: get("DB_PATH"),
            db_seed: get("DB_SEED_FILE").map(PathBuf::from),
            http_addr: get("HTTP_ADDR").unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            cache_root: get("CACHE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_ROOT)),
            log: LogSettings {
                level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
                format,
                file: get("LOG_FILE").map(PathBuf::from),
            },
        })
    }
}

fn read_identifier(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let id = raw.trim();
    (!id.is_empty()).then(|| id.to_string())
}
