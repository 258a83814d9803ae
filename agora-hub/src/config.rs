//! Hub and server configuration.
//!
//! Both configs are plain structs with defaults. The server binary overlays
//! `AGORA_*` environment variables on top via [`ServerConfig::from_env`].

use std::str::FromStr;

use thiserror::Error;

/// Room and registry tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Frames buffered per member before sends start failing with `Full`
    pub outbound_capacity: usize,
    /// Drop a room from the registry when its last member leaves
    pub evict_empty_rooms: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            evict_empty_rooms: true,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Room used when the request path names none
    pub default_room: String,
    /// Longest room name kept after sanitizing
    pub max_room_name_len: usize,
    /// Ping interval in seconds (0 disables keepalive)
    pub heartbeat_interval_secs: u64,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            default_room: "main".to_string(),
            max_room_name_len: 64,
            heartbeat_interval_secs: 30,
            hub: HubConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

pub const ENV_BIND_ADDR: &str = "AGORA_BIND_ADDR";
pub const ENV_DEFAULT_ROOM: &str = "AGORA_DEFAULT_ROOM";
pub const ENV_MAX_ROOM_NAME_LEN: &str = "AGORA_MAX_ROOM_NAME_LEN";
pub const ENV_HEARTBEAT_SECS: &str = "AGORA_HEARTBEAT_SECS";
pub const ENV_OUTBOUND_CAPACITY: &str = "AGORA_OUTBOUND_CAPACITY";
pub const ENV_EVICT_EMPTY_ROOMS: &str = "AGORA_EVICT_EMPTY_ROOMS";

impl ServerConfig {
    /// Defaults overlaid with `AGORA_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = addr;
        }
        if let Some(room) = lookup(ENV_DEFAULT_ROOM) {
            if room.is_empty() {
                return Err(invalid(ENV_DEFAULT_ROOM, room));
            }
            config.default_room = room;
        }
        if let Some(len) = parse::<_, usize>(&lookup, ENV_MAX_ROOM_NAME_LEN)? {
            if len == 0 {
                return Err(invalid(ENV_MAX_ROOM_NAME_LEN, len.to_string()));
            }
            config.max_room_name_len = len;
        }
        if let Some(secs) = parse::<_, u64>(&lookup, ENV_HEARTBEAT_SECS)? {
            config.heartbeat_interval_secs = secs;
        }
        if let Some(capacity) = parse::<_, usize>(&lookup, ENV_OUTBOUND_CAPACITY)? {
            config.hub.outbound_capacity = capacity;
        }
        if let Some(evict) = lookup(ENV_EVICT_EMPTY_ROOMS) {
            config.hub.evict_empty_rooms = parse_bool(&evict)
                .ok_or_else(|| invalid(ENV_EVICT_EMPTY_ROOMS, evict.clone()))?;
        }

        Ok(config)
    }
}

fn invalid(key: &'static str, value: String) -> ConfigError {
    ConfigError::InvalidValue { key, value }
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| invalid(key, raw)),
        None => Ok(None),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
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
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.default_room, "main");
        assert_eq!(config.max_room_name_len, 64);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.hub.outbound_capacity, 256);
        assert!(config.hub.evict_empty_rooms);
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_environment_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            (ENV_BIND_ADDR, "0.0.0.0:8080"),
            (ENV_DEFAULT_ROOM, "lobby"),
            (ENV_MAX_ROOM_NAME_LEN, "16"),
            (ENV_HEARTBEAT_SECS, "0"),
            (ENV_OUTBOUND_CAPACITY, " 32 "),
            (ENV_EVICT_EMPTY_ROOMS, "off"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.default_room, "lobby");
        assert_eq!(config.max_room_name_len, 16);
        assert_eq!(config.heartbeat_interval_secs, 0);
        assert_eq!(config.hub.outbound_capacity, 32);
        assert!(!config.hub.evict_empty_rooms);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[(ENV_HEARTBEAT_SECS, "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: ENV_HEARTBEAT_SECS,
                value: "soon".to_string()
            }
        );

        assert!(ServerConfig::from_lookup(lookup(&[(ENV_EVICT_EMPTY_ROOMS, "maybe")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[(ENV_MAX_ROOM_NAME_LEN, "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[(ENV_DEFAULT_ROOM, "")])).is_err());
    }
}
