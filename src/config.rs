use core::fmt;

use log::info;

use crate::color::Rgb;

#[cfg(target_os = "espidf")]
pub const NS: &str = "clock_cfg";

pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASS: &str = "wifi_pass";
pub const KEY_MQTT_BROKER: &str = "mqtt_broker";
pub const KEY_MQTT_PORT: &str = "mqtt_port";
pub const KEY_MQTT_USER: &str = "mqtt_user";
pub const KEY_MQTT_PASS: &str = "mqtt_pass";
pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_TOPIC_BASE: &str = "topic_base";
pub const KEY_COLOR_WIFI: &str = "color_wifi";
pub const KEY_COLOR_NOWIFI: &str = "color_nowifi";
pub const KEY_KEEP_ALIVE: &str = "keep_alive";

/// Every key a source may provide.
pub const KEYS: &[&str] = &[
    KEY_WIFI_SSID,
    KEY_WIFI_PASS,
    KEY_MQTT_BROKER,
    KEY_MQTT_PORT,
    KEY_MQTT_USER,
    KEY_MQTT_PASS,
    KEY_DEVICE_ID,
    KEY_TOPIC_BASE,
    KEY_COLOR_WIFI,
    KEY_COLOR_NOWIFI,
    KEY_KEEP_ALIVE,
];

const SECRET_KEYS: &[&str] = &[KEY_WIFI_PASS, KEY_MQTT_PASS];

const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_TOPIC_BASE: &str = "adafruit_matrix_clock";
const DEFAULT_COLOR_WIFI: Rgb = Rgb(0x000000);
const DEFAULT_COLOR_NOWIFI: Rgb = Rgb(0x330000);
const DEFAULT_KEEP_ALIVE_SECS: u16 = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing required setting '{}'", key),
            ConfigError::Invalid { key, value } => {
                write!(f, "invalid value for '{}': {:?}", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// A place settings can be read from.
pub trait ConfigSource {
    fn name(&self) -> &str;

    /// `None` for absent or empty values.
    fn get(&self, key: &str) -> Option<String>;
}

/// Writable settings, used by the console.
pub trait SettingsStore {
    fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&mut self, key: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_user: Option<String>,
    pub mqtt_pass: Option<String>,
    pub device_id: String,
    pub topic_base: String,
    pub color_wifi: Rgb,
    pub color_nowifi: Rgb,
    pub keep_alive_secs: u16,
}

/// First non-blank value for `key` and the name of the source it came from.
pub fn lookup<'a>(sources: &[&'a dyn ConfigSource], key: &str) -> Option<(String, &'a str)> {
    sources.iter().find_map(|src| {
        src.get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|v| (v, src.name()))
    })
}

/// Value as it may appear in logs; secrets only show their length.
pub fn printable(key: &str, value: &str) -> String {
    if SECRET_KEYS.contains(&key) {
        format!("<{} chars>", value.len())
    } else {
        format!("{:?}", value)
    }
}

/// One `key = value (source)` line per known key.
pub fn describe(sources: &[&dyn ConfigSource]) -> Vec<String> {
    KEYS.iter()
        .map(|key| match lookup(sources, key) {
            Some((value, from)) => format!("{} = {} ({})", key, printable(key, &value), from),
            None => format!("{} = <unset>", key),
        })
        .collect()
}

struct Layers<'a> {
    sources: &'a [&'a dyn ConfigSource],
}

impl Layers<'_> {
    fn optional(&self, key: &'static str) -> Option<String> {
        let (value, from) = lookup(self.sources, key)?;
        info!("{} {} = {}", from, key, printable(key, &value));
        Some(value)
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed<T>(
        &self,
        key: &'static str,
        default: T,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<T, ConfigError> {
        match self.optional(key) {
            Some(raw) => parse(&raw).ok_or(ConfigError::Invalid { key, value: raw }),
            None => Ok(default),
        }
    }
}

impl Config {
    /// Build the configuration from layered sources; the first source that
    /// has a key wins.
    pub fn load(sources: &[&dyn ConfigSource]) -> Result<Config, ConfigError> {
        let layers = Layers { sources };

        let wifi_ssid = layers.required(KEY_WIFI_SSID)?;
        let wifi_pass = layers.optional(KEY_WIFI_PASS).unwrap_or_default();
        let mqtt_broker = layers.required(KEY_MQTT_BROKER)?;
        let mqtt_port = layers.parsed(KEY_MQTT_PORT, DEFAULT_MQTT_PORT, |s| {
            s.parse::<u16>().ok().filter(|p| *p != 0)
        })?;
        let mqtt_user = layers.optional(KEY_MQTT_USER);
        let mqtt_pass = layers.optional(KEY_MQTT_PASS);
        let device_id = layers.required(KEY_DEVICE_ID)?;
        if device_id.contains(['/', '#', '+']) {
            return Err(ConfigError::Invalid {
                key: KEY_DEVICE_ID,
                value: device_id,
            });
        }
        let topic_base = layers
            .optional(KEY_TOPIC_BASE)
            .map(|b| b.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_TOPIC_BASE.to_string());
        let color_wifi = layers.parsed(KEY_COLOR_WIFI, DEFAULT_COLOR_WIFI, Rgb::parse)?;
        let color_nowifi = layers.parsed(KEY_COLOR_NOWIFI, DEFAULT_COLOR_NOWIFI, Rgb::parse)?;
        let keep_alive_secs = layers.parsed(KEY_KEEP_ALIVE, DEFAULT_KEEP_ALIVE_SECS, |s| {
            s.parse::<u16>().ok().filter(|k| *k > 0)
        })?;

        Ok(Config {
            wifi_ssid,
            wifi_pass,
            mqtt_broker,
            mqtt_port,
            mqtt_user,
            mqtt_pass,
            device_id,
            topic_base,
            color_wifi,
            color_nowifi,
            keep_alive_secs,
        })
    }
}

// ── Sources ──

/// Values baked in at build time from `secrets.local.rs` (see build.rs).
pub struct CompiledSecrets;

impl ConfigSource for CompiledSecrets {
    fn name(&self) -> &str {
        "local"
    }

    fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            KEY_WIFI_SSID => option_env!("LOCAL_WIFI_SSID"),
            KEY_WIFI_PASS => option_env!("LOCAL_WIFI_PASS"),
            KEY_MQTT_BROKER => option_env!("LOCAL_MQTT_BROKER"),
            KEY_MQTT_PORT => option_env!("LOCAL_MQTT_PORT"),
            KEY_MQTT_USER => option_env!("LOCAL_MQTT_USER"),
            KEY_MQTT_PASS => option_env!("LOCAL_MQTT_PASS"),
            KEY_DEVICE_ID => option_env!("LOCAL_DEVICE_ID"),
            KEY_TOPIC_BASE => option_env!("LOCAL_TOPIC_BASE"),
            KEY_COLOR_WIFI => option_env!("LOCAL_COLOR_WIFI"),
            KEY_COLOR_NOWIFI => option_env!("LOCAL_COLOR_NOWIFI"),
            _ => None,
        };
        value.filter(|v| !v.is_empty()).map(str::to_string)
    }
}

/// `MATRIX_CLOCK_<KEY>` environment variables.
#[cfg(not(target_os = "espidf"))]
pub struct EnvSource;

#[cfg(not(target_os = "espidf"))]
impl EnvSource {
    pub fn var_name(key: &str) -> String {
        format!("MATRIX_CLOCK_{}", key.to_ascii_uppercase())
    }
}

#[cfg(not(target_os = "espidf"))]
impl ConfigSource for EnvSource {
    fn name(&self) -> &str {
        "env"
    }

    fn get(&self, key: &str) -> Option<String> {
        std::env::var(Self::var_name(key)).ok().filter(|v| !v.is_empty())
    }
}

#[cfg(target_os = "espidf")]
pub use nvs_source::NvsSource;

#[cfg(target_os = "espidf")]
mod nvs_source {
    use std::sync::{Arc, Mutex};

    use esp_idf_svc::nvs::{EspNvs, NvsDefault};
    use log::info;

    use super::{ConfigSource, SettingsStore};

    /// Settings namespace in NVS flash.
    #[derive(Clone)]
    pub struct NvsSource {
        nvs: Arc<Mutex<EspNvs<NvsDefault>>>,
    }

    impl NvsSource {
        pub fn new(nvs: Arc<Mutex<EspNvs<NvsDefault>>>) -> Self {
            Self { nvs }
        }
    }

    /// Read a string from NVS, returning None if the key is absent or on error.
    fn nvs_get_str(nvs: &EspNvs<NvsDefault>, key: &str) -> Option<String> {
        let len = match nvs.str_len(key) {
            Ok(Some(len)) => len,
            _ => return None,
        };

        let mut buf = vec![0u8; len];
        match nvs.get_str(key, &mut buf) {
            Ok(Some(val)) => {
                let s = val.trim_end_matches('\0').to_string();
                if s.is_empty() { None } else { Some(s) }
            }
            _ => None,
        }
    }

    impl ConfigSource for NvsSource {
        fn name(&self) -> &str {
            "NVS"
        }

        fn get(&self, key: &str) -> Option<String> {
            let nvs = self.nvs.lock().ok()?;
            nvs_get_str(&nvs, key)
        }
    }

    impl SettingsStore for NvsSource {
        fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
            let mut nvs = self
                .nvs
                .lock()
                .map_err(|_| anyhow::anyhow!("NVS lock poisoned"))?;
            nvs.set_str(key, value)?;
            info!("NVS saved {}=<{} chars>", key, value.len());
            Ok(())
        }

        fn remove(&mut self, key: &str) -> anyhow::Result<()> {
            let mut nvs = self
                .nvs
                .lock()
                .map_err(|_| anyhow::anyhow!("NVS lock poisoned"))?;
            nvs.remove(key)?;
            info!("NVS cleared {}", key);
            Ok(())
        }
    }
}
