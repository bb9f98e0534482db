//! Fleet connection settings. Loaded from `fleet.yml` in the config
//! directory; every field is env-overridable for packaging and tests.

use std::path::Path;

use serde::Deserialize;

use crate::errors::AgentError;

#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// Base URL of the fleet control service.
    pub host: String,
    #[serde(default)]
    pub api_key: String,
    /// Set when this host also runs the control-server process; real
    /// check-ins are deferred until it is reachable.
    #[serde(default)]
    pub local_server: bool,
}

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let mut cfg = match std::fs::read(path) {
            Ok(bytes) => serde_yaml::from_slice::<FleetConfig>(&bytes).map_err(|e| {
                AgentError::Config {
                    message: format!("fleet config is not valid YAML: {e}"),
                    path: Some(path.to_path_buf()),
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FleetConfig {
                host: String::new(),
                api_key: String::new(),
                local_server: false,
            },
            Err(e) => return Err(AgentError::io("reading fleet config", path, e)),
        };

        if let Ok(host) = std::env::var("WARDEN_FLEET_HOST") {
            if !host.is_empty() {
                cfg.host = host;
            }
        }
        if let Ok(key) = std::env::var("WARDEN_FLEET_API_KEY") {
            if !key.is_empty() {
                cfg.api_key = key;
            }
        }
        if crate::util::env_flag("WARDEN_FLEET_LOCAL_SERVER") {
            cfg.local_server = true;
        }

        if cfg.host.is_empty() {
            return Err(AgentError::Config {
                message: "fleet host is not configured (fleet.yml `host` or WARDEN_FLEET_HOST)"
                    .to_string(),
                path: Some(path.to_path_buf()),
            });
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_yaml_fields() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("fleet.yml");
        std::fs::write(
            &path,
            "host: https://fleet.example:8220\napi_key: secret\nlocal_server: true\n",
        )
        .unwrap();
        let cfg = FleetConfig::load(&path).unwrap();
        assert_eq!(cfg.host, "https://fleet.example:8220");
        assert_eq!(cfg.api_key, "secret");
        assert!(cfg.local_server);
    }

    #[test]
    fn missing_host_is_a_config_error() {
        let tmp = tempdir().unwrap();
        let err = FleetConfig::load(&tmp.path().join("fleet.yml")).unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}
