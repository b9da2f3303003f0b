use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_process_name() -> String {
    "opencode".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_health_timeout_secs() -> u64 {
    2
}

fn default_directive_tag() -> String {
    "AI".to_string()
}

/// Which transport carries HTTP calls to the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One `curl` process per request.
    #[default]
    Curl,
    /// In-process reqwest client.
    Http,
}

/// Stored configuration, `~/.stitch/config.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StitchConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Fixed backend port. `None` discovers a running backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    /// Process name used for discovery.
    #[serde(default = "default_process_name")]
    pub process_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Default backend agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Agent overrides keyed by filetype.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub filetype_agents: HashMap<String, String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<PathBuf>,
    #[serde(default = "default_directive_tag")]
    pub directive_tag: String,
    #[serde(default)]
    pub transport: TransportKind,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            process_name: default_process_name(),
            provider: None,
            model: None,
            agent: None,
            filetype_agents: HashMap::new(),
            request_timeout_secs: default_request_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            prompt_template: None,
            directive_tag: default_directive_tag(),
            transport: TransportKind::default(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port {0} is out of range (1-65535)")]
    PortOutOfRange(u32),
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("prompt template {0} does not exist")]
    MissingTemplate(PathBuf),
}

impl StitchConfig {
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stitch")
            .join("config.json")
    }

    /// Load from ~/.stitch/config.json.
    pub fn load() -> Option<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Option<Self> {
        let data = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&data) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("ignoring malformed config {}: {e}", path.display());
                None
            }
        }
    }

    /// Save to ~/.stitch/config.json
    pub fn save(&self) -> Result<(), std::io::Error> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, data)
    }

    /// Every problem with the settings. An empty list means the config is usable.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if let Some(port) = self.port
            && !(1..=65535).contains(&port)
        {
            errors.push(ConfigError::PortOutOfRange(port));
        }
        if self.host.trim().is_empty() {
            errors.push(ConfigError::Empty("host"));
        }
        if self.process_name.trim().is_empty() {
            errors.push(ConfigError::Empty("process_name"));
        }
        if self.directive_tag.trim().is_empty() {
            errors.push(ConfigError::Empty("directive_tag"));
        }
        if self.request_timeout_secs == 0 {
            errors.push(ConfigError::ZeroTimeout("request_timeout_secs"));
        }
        if self.health_timeout_secs == 0 {
            errors.push(ConfigError::ZeroTimeout("health_timeout_secs"));
        }
        if let Some(path) = &self.prompt_template
            && !path.is_file()
        {
            errors.push(ConfigError::MissingTemplate(path.clone()));
        }
        errors
    }

    /// Fixed port, if one is configured and in range.
    pub fn fixed_port(&self) -> Option<u16> {
        self.port
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
    }

    /// Agent for a filetype: the per-filetype override, else the default.
    pub fn agent_for(&self, filetype: &str) -> Option<String> {
        self.filetype_agents
            .get(filetype)
            .or(self.agent.as_ref())
            .filter(|a| !a.is_empty())
            .cloned()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let config: StitchConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, None);
        assert_eq!(config.process_name, "opencode");
        assert_eq!(config.request_timeout_secs, 300);
        assert_eq!(config.health_timeout_secs, 2);
        assert_eq!(config.directive_tag, "AI");
        assert_eq!(config.transport, TransportKind::Curl);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn transport_kind_is_lowercase() {
        let config: StitchConfig = serde_json::from_str(r#"{"transport": "http"}"#).unwrap();
        assert_eq!(config.transport, TransportKind::Http);
    }

    #[test]
    fn validate_collects_every_error() {
        let config = StitchConfig {
            host: " ".into(),
            port: Some(70000),
            directive_tag: String::new(),
            request_timeout_secs: 0,
            prompt_template: Some(PathBuf::from("/definitely/not/here.txt")),
            ..Default::default()
        };
        let errors = config.validate();
        assert_eq!(
            errors,
            vec![
                ConfigError::PortOutOfRange(70000),
                ConfigError::Empty("host"),
                ConfigError::Empty("directive_tag"),
                ConfigError::ZeroTimeout("request_timeout_secs"),
                ConfigError::MissingTemplate(PathBuf::from("/definitely/not/here.txt")),
            ]
        );
    }

    #[test]
    fn port_zero_is_invalid_and_not_fixed() {
        let config = StitchConfig {
            port: Some(0),
            ..Default::default()
        };
        assert_eq!(config.validate(), vec![ConfigError::PortOutOfRange(0)]);
        assert_eq!(config.fixed_port(), None);
    }

    #[test]
    fn fixed_port_in_range() {
        let config = StitchConfig {
            port: Some(4096),
            ..Default::default()
        };
        assert_eq!(config.fixed_port(), Some(4096));
    }

    #[test]
    fn agent_for_prefers_filetype_override() {
        let mut config = StitchConfig {
            agent: Some("build".into()),
            ..Default::default()
        };
        config
            .filetype_agents
            .insert("markdown".into(), "docs".into());
        assert_eq!(config.agent_for("markdown").as_deref(), Some("docs"));
        assert_eq!(config.agent_for("rust").as_deref(), Some("build"));
    }

    #[test]
    fn empty_agent_is_absent() {
        let config = StitchConfig {
            agent: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(config.agent_for("rust"), None);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 4096, "model": "m"}"#).unwrap();
        let config = StitchConfig::load_from(&path).unwrap();
        assert_eq!(config.fixed_port(), Some(4096));
        assert_eq!(config.model.as_deref(), Some("m"));
    }

    #[test]
    fn load_from_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(StitchConfig::load_from(&path).is_none());
        assert!(StitchConfig::load_from(&dir.path().join("missing.json")).is_none());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = StitchConfig {
            agent: Some("build".into()),
            ..Default::default()
        };
        config.filetype_agents.insert("python".into(), "py".into());
        config.save_to(&path).unwrap();
        let loaded = StitchConfig::load_from(&path).unwrap();
        assert_eq!(loaded.agent_for("python").as_deref(), Some("py"));
        assert_eq!(loaded.agent_for("go").as_deref(), Some("build"));
    }

    #[test]
    fn unset_options_are_not_serialized() {
        let json = serde_json::to_value(StitchConfig::default()).unwrap();
        assert!(json.get("port").is_none());
        assert!(json.get("provider").is_none());
        assert!(json.get("filetype_agents").is_none());
    }
}
