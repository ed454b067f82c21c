//! Konfiguration für Softphone
//!
//! Reihenfolge beim Laden:
//! 1. Eingebaute Defaults
//! 2. Optionale JSON-Datei `softphone.json` im Konfigurationsverzeichnis
//! 3. `.env` Datei und Umgebungsvariablen (`SOFTPHONE_*`)

use crate::signaling::SipUri;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// DEFAULTS
// ============================================================================

/// Frequenz des synthetischen Testtons (Hz)
pub const TONE_FREQUENCY_HZ: f32 = 440.0;

/// Lautstärke des synthetischen Testtons (0.0 - 1.0)
pub const TONE_GAIN: f32 = 0.1;

/// Maximale Abweichung der Fallback-Tonhöhe (Hz)
pub const FALLBACK_MAX_OFFSET_HZ: i32 = 50;

/// Standard STUN Server
pub fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

// ============================================================================
// TIMINGS
// ============================================================================

/// Feste Zeitgrenzen der Call-Steuerung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    /// Timeout für den Erreichbarkeitstest
    #[serde(with = "millis")]
    pub probe_timeout: Duration,
    /// Timeout für den Start des User Agents
    #[serde(with = "millis")]
    pub start_timeout: Duration,
    /// Simulierte Aufbauzeit für Simulated/Fallback Calls
    #[serde(with = "millis")]
    pub setup_delay: Duration,
    /// Intervall, in dem der Fallback-Ton seine Frequenz ändert
    #[serde(with = "millis")]
    pub fallback_wobble_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            start_timeout: Duration::from_secs(10),
            setup_delay: Duration::from_secs(2),
            fallback_wobble_interval: Duration::from_secs(2),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

// ============================================================================
// AGENT IDENTITY
// ============================================================================

/// Signaling-Identität des Agents. Nach dem Erstellen unveränderlich.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    uri: String,
    username: String,
    password: String,
    display_name: String,
    endpoint: String,
}

impl AgentIdentity {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        domain: &str,
        display_name: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        let username = username.into();
        Self {
            uri: format!("sip:{}@{}", username, domain),
            username,
            password: password.into(),
            display_name: display_name.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Gleiche Identität, anderer Signaling-Endpunkt
    pub fn with_endpoint(&self, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..self.clone()
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

// ============================================================================
// PHONE CONFIG
// ============================================================================

/// Statische Konfiguration des Softphones
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    /// Signaling-Endpunkt (ws:// oder wss://)
    pub endpoint: String,
    /// SIP Domain
    pub domain: String,
    pub username: String,
    pub password: String,
    pub display_name: String,
    /// Ziel für ausgehende Anrufe (Nummer oder User-Teil)
    pub dial_target: String,
    /// ICE/STUN Server URIs
    pub ice_servers: Vec<String>,
    /// Alternative Signaling-Endpunkte für manuellen Retry
    pub alternative_endpoints: Vec<String>,
    pub user_agent: String,
    pub timings: Timings,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            domain: String::new(),
            username: String::new(),
            password: String::new(),
            display_name: "Softphone".to_string(),
            dial_target: String::new(),
            ice_servers: default_ice_servers(),
            alternative_endpoints: Vec::new(),
            user_agent: concat!("softphone/", env!("CARGO_PKG_VERSION")).to_string(),
            timings: Timings::default(),
        }
    }
}

impl PhoneConfig {
    /// Lädt die Konfiguration aus Datei und Umgebung
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {:?}", path);
                Self::from_file(&path)?
            }
            _ => Self::default(),
        };

        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("No .env file loaded: {}", e);
        }
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Liest eine JSON-Konfigurationsdatei
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Überschreibt Felder mit gesetzten Variablen
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let string_fields: [(&str, &mut String); 6] = [
            ("SOFTPHONE_ENDPOINT", &mut self.endpoint),
            ("SOFTPHONE_DOMAIN", &mut self.domain),
            ("SOFTPHONE_USERNAME", &mut self.username),
            ("SOFTPHONE_PASSWORD", &mut self.password),
            ("SOFTPHONE_DISPLAY_NAME", &mut self.display_name),
            ("SOFTPHONE_DIAL_TARGET", &mut self.dial_target),
        ];
        for (key, field) in string_fields {
            if let Some(value) = var(key) {
                *field = value;
            }
        }

        if let Some(list) = var("SOFTPHONE_ICE_SERVERS") {
            self.ice_servers = split_list(&list);
        }
        if let Some(list) = var("SOFTPHONE_ALT_ENDPOINTS") {
            self.alternative_endpoints = split_list(&list);
        }

        // Domain fällt auf den Host des Endpunkts zurück
        if self.domain.is_empty() {
            if let Some(host) = Url::parse(&self.endpoint)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
            {
                self.domain = host;
            }
        }
    }

    /// Prüft die Konfiguration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::Invalid("signaling endpoint is required".into()));
        }
        let url = Url::parse(&self.endpoint)
            .map_err(|e| ConfigError::Invalid(format!("endpoint: {}", e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid(format!(
                "endpoint must use ws or wss, got {}",
                url.scheme()
            )));
        }
        if self.domain.is_empty() {
            return Err(ConfigError::Invalid("domain is required".into()));
        }
        if self.username.is_empty() {
            return Err(ConfigError::Invalid("username is required".into()));
        }
        if self.dial_target.trim().is_empty() {
            return Err(ConfigError::Invalid("dial target is required".into()));
        }
        if SipUri::parse(&self.target_address()).is_none() {
            return Err(ConfigError::Invalid(format!(
                "dial target is not a SIP address: {}",
                self.dial_target
            )));
        }
        Ok(())
    }

    /// Erstellt die Agent-Identität
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity::new(
            &self.username,
            &self.password,
            &self.domain,
            &self.display_name,
            &self.endpoint,
        )
    }

    /// Zieladresse für ausgehende Anrufe
    pub fn target_address(&self) -> String {
        if self.dial_target.starts_with("sip:") {
            self.dial_target.clone()
        } else {
            format!("sip:{}@{}", self.dial_target, self.domain)
        }
    }

    fn config_path() -> Option<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("com", "softphone", "softphone")?;
        Some(proj_dirs.config_dir().join("softphone.json"))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
