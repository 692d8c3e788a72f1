//! Configuration loading
//!
//! The bootstrap file is YAML with a `topology` list of administrative
//! command lines, applied in order at startup. Blank entries and lines
//! starting with `#` are skipped, so a topology reads like a command
//! script.

use crate::command;
use crate::{App, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Administrative commands applied at startup, in order.
    #[serde(default)]
    pub topology: Vec<String>,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path, e)))?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    fn commands(&self) -> impl Iterator<Item = &str> + '_ {
        self.topology
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
    }

    /// Grammar-check every topology line without executing it.
    pub fn validate(&self) -> Result<()> {
        for line in self.commands() {
            command::parse(line)
                .map_err(|e| Error::config(format!("bad topology line `{}`: {}", line, e)))?;
        }
        Ok(())
    }

    /// Apply the topology to a freshly constructed application. Startup is
    /// all-or-nothing: the first failing line aborts it.
    pub fn apply(&self, app: &App) -> Result<()> {
        let mut applied = 0usize;
        for line in self.commands() {
            debug!("applying `{}`", line);
            app.execute(line)
                .map_err(|e| Error::config(format!("applying `{}` failed: {}", line, e)))?;
            applied += 1;
        }
        if applied > 0 {
            info!("applied {} topology commands", applied);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_topology() {
        let yaml = r##"
topology:
  - add event-loop-group elg0
  - "# a comment"
  - add event-loop el0 to event-loop-group elg0
"##;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.topology.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_lines() {
        let config = Config {
            topology: vec!["add nonsense n0".to_string()],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_config_is_fine() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.topology.is_empty());
        assert!(config.validate().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_apply_builds_topology() {
        let app = App::new().unwrap();
        let config = Config {
            topology: vec![
                "add event-loop-group elg0".to_string(),
                "add event-loop el0 to event-loop-group elg0".to_string(),
                "add server-groups sgs0".to_string(),
            ],
        };
        config.apply(&app).unwrap();
        assert!(app.get_event_loop_group("elg0").is_ok());
        assert!(app.get_server_groups("sgs0").is_ok());
        app.shutdown();
    }
}
