use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "excon.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExconConfig {
    pub helper: HelperConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

/// The external helper program and what it is always given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperConfig {
    pub path: PathBuf,
    pub default_container_image: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_id")]
    pub id: String,
    #[serde(default = "default_agent_pid")]
    pub pid: String,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            pid: default_agent_pid(),
            work_dir: default_work_dir(),
        }
    }
}

fn default_agent_id() -> String {
    "local".into()
}
fn default_agent_pid() -> String {
    "excon@localhost".into()
}
fn default_work_dir() -> PathBuf {
    excon_home()
}

/// `~/.excon`, or `./.excon` when there is no home directory.
pub fn excon_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".excon")
}

impl ExconConfig {
    /// Configuration for `helper` with every other setting defaulted.
    pub fn for_helper(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: HelperConfig {
                path: helper.into(),
                default_container_image: None,
                env: BTreeMap::new(),
            },
            agent: AgentConfig::default(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Look for `excon.toml` in the working directory, then in `~/.excon`.
    pub fn discover() -> Result<Self, ConfigError> {
        let candidates = [PathBuf::from(CONFIG_FILE), excon_home().join(CONFIG_FILE)];
        for candidate in &candidates {
            if candidate.is_file() {
                tracing::debug!(path = %candidate.display(), "Using config");
                return Self::from_file(candidate);
            }
        }
        Err(ConfigError::NotFound)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.helper.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("helper.path must not be empty".into()));
        }
        if self.agent.id.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.id must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml_str = r#"
[helper]
path = "/usr/libexec/excon-helper"
"#;
        let config: ExconConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.helper.path, PathBuf::from("/usr/libexec/excon-helper"));
        assert_eq!(config.helper.default_container_image, None);
        assert!(config.helper.env.is_empty());
        assert_eq!(config.agent.id, "local");
        assert_eq!(config.agent.pid, "excon@localhost");
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
[helper]
path = "/opt/helper"
default_container_image = "busybox"

[helper.env]
HELPER_DEBUG = "1"

[agent]
id = "agent-7"
pid = "agent@10.0.0.7:5051"
work_dir = "/var/lib/excon"
"#;
        let config: ExconConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.helper.default_container_image.as_deref(), Some("busybox"));
        assert_eq!(config.helper.env.get("HELPER_DEBUG").map(String::as_str), Some("1"));
        assert_eq!(config.agent.id, "agent-7");
        assert_eq!(config.agent.work_dir, PathBuf::from("/var/lib/excon"));
    }

    #[test]
    fn from_file_rejects_empty_helper_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        std::fs::write(&path, "[helper]\npath = \"\"\n").unwrap();
        let err = ExconConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_helper_section_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        std::fs::write(&path, "[agent]\nid = \"a\"\n").unwrap();
        let err = ExconConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
