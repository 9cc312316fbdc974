use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};

use messaging_transport::{MessagingTransport, TransportCapabilities, TransportKind};
use serde::Deserialize;

use crate::{
    app_server::{AppServerClient, MuteStateService},
    error::ConfigError,
    manager::ManagerOptions,
    router::{
        RouterOptions, TransportBinding, DEFAULT_DEDUP_CAPACITY, DEFAULT_EVENT_CHANNEL_CAPACITY,
    },
    state_machine::{RetryPolicy, DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_LIMIT},
};

pub const DEFAULT_CONFIG_FILE: &str = "classroom.toml";
const ENV_PREFIX: &str = "CLASSROOM__";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransportSettings {
    pub kind: TransportKind,
    #[serde(default = "enabled")]
    pub enable: bool,
    #[serde(default)]
    pub primary: bool,
    #[serde(default = "enabled")]
    pub native_mute: bool,
}

fn enabled() -> bool {
    true
}

impl TransportSettings {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            enable: true,
            primary: false,
            native_mute: true,
        }
    }

    pub fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            native_mute: self.native_mute,
            ..TransportCapabilities::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub transports: Vec<TransportSettings>,
    pub retry_interval_ms: u64,
    pub retry_limit: u32,
    pub dedup_capacity: usize,
    pub expired_session_capacity: usize,
    pub event_channel_capacity: usize,
    pub app_server_url: Option<String>,
    pub app_server_type: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            transports: vec![
                TransportSettings {
                    primary: true,
                    ..TransportSettings::new(TransportKind::AliyunImV2)
                },
                TransportSettings::new(TransportKind::RongCloud),
            ],
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            retry_limit: DEFAULT_RETRY_LIMIT,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            expired_session_capacity: 1024,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            app_server_url: None,
            app_server_type: "aliyun".into(),
        }
    }
}

impl ClientSettings {
    pub fn enabled_transports(&self) -> impl Iterator<Item = &TransportSettings> + '_ {
        self.transports.iter().filter(|transport| transport.enable)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.retry_interval_ms),
            limit: self.retry_limit,
        }
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            dedup_capacity: self.dedup_capacity,
            event_channel_capacity: self.event_channel_capacity,
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            retry: self.retry_policy(),
            expired_session_capacity: self.expired_session_capacity,
            ..ManagerOptions::default()
        }
    }

    pub fn bindings(
        &self,
        mut connect: impl FnMut(&TransportSettings) -> Arc<dyn MessagingTransport>,
    ) -> Vec<TransportBinding> {
        self.enabled_transports()
            .map(|transport| {
                let connected = connect(transport);
                if transport.primary {
                    TransportBinding::primary(connected)
                } else {
                    TransportBinding::new(connected)
                }
            })
            .collect()
    }

    pub fn mute_service(&self) -> Result<Option<Arc<dyn MuteStateService>>, ConfigError> {
        let Some(url) = self.app_server_url.as_deref() else {
            return Ok(None);
        };
        let client = AppServerClient::new(url, self.app_server_type.clone())
            .map_err(|_| invalid("app_server_url", url))?;
        Ok(Some(Arc::new(client)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_interval_ms == 0 {
            return Err(invalid("retry_interval_ms", "0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(invalid("event_channel_capacity", "0"));
        }
        if self.enabled_transports().next().is_none() {
            return Err(invalid("transports", "no enabled backend"));
        }
        let primaries = self.enabled_transports().filter(|t| t.primary).count();
        if primaries > 1 {
            return Err(invalid("transports", format!("{primaries} primaries")));
        }
        self.mute_service()?;
        Ok(())
    }
}

fn invalid(key: &str, value: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.into(),
    }
}

/// Loads settings: defaults, then the TOML file at `path` if it exists, then
/// `CLASSROOM__*` environment overrides.
pub fn load_settings(path: impl AsRef<Path>) -> Result<ClientSettings, ConfigError> {
    let path = path.as_ref();
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => parse_settings(&raw, &path.display().to_string())?,
        Err(err) if err.kind() == ErrorKind::NotFound => ClientSettings::default(),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };
    apply_env_overrides(&mut settings, std::env::vars())?;
    settings.validate()?;
    Ok(settings)
}

pub fn parse_settings(raw: &str, origin: &str) -> Result<ClientSettings, ConfigError> {
    toml::from_str(raw).map_err(|source| ConfigError::Parse {
        path: origin.to_string(),
        source,
    })
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn parse_kind(value: &str) -> Option<TransportKind> {
    [
        TransportKind::AliyunImV1,
        TransportKind::AliyunImV2,
        TransportKind::RongCloud,
    ]
    .into_iter()
    .find(|kind| kind.as_str() == value.trim())
}

pub fn apply_env_overrides(
    settings: &mut ClientSettings,
    vars: impl IntoIterator<Item = (String, String)>,
) -> Result<(), ConfigError> {
    for (name, value) in vars {
        let Some(key) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let key = key.to_ascii_lowercase();
        match key.as_str() {
            "retry_interval_ms" => settings.retry_interval_ms = parse_number(&key, &value)?,
            "retry_limit" => settings.retry_limit = parse_number(&key, &value)?,
            "dedup_capacity" => settings.dedup_capacity = parse_number(&key, &value)?,
            "expired_session_capacity" => {
                settings.expired_session_capacity = parse_number(&key, &value)?
            }
            "event_channel_capacity" => {
                settings.event_channel_capacity = parse_number(&key, &value)?
            }
            "app_server_url" => settings.app_server_url = Some(value),
            "app_server_type" => settings.app_server_type = value,
            "transports" => {
                let mut transports = Vec::new();
                for raw in value.split(',').filter(|raw| !raw.trim().is_empty()) {
                    let kind = parse_kind(raw).ok_or_else(|| invalid(&key, raw))?;
                    transports.push(TransportSettings {
                        primary: transports.is_empty(),
                        ..TransportSettings::new(kind)
                    });
                }
                settings.transports = transports;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
