use std::{fs, io, path::PathBuf};

use serde::{Deserialize, Serialize};

use fwdash_util::{state_file_path, write_json_atomic, BRIDGE_ADDR_ENV, DEFAULT_BRIDGE_ADDR};

const CLI_CONFIG_FILE: &str = "cli-config.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct CliConfig {
    pub(crate) bridge_addr: String,
    pub(crate) default_baud: u32,
    pub(crate) last_port: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            bridge_addr: DEFAULT_BRIDGE_ADDR.into(),
            default_baud: 115200,
            last_port: String::new(),
        }
    }
}

impl CliConfig {
    pub(crate) fn load() -> Self {
        let path = cli_config_path();
        let file_cfg = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<CliConfig>(&data) {
                Ok(cfg) => Some(cfg),
                Err(err) => {
                    eprintln!("Failed to parse {}: {err}", path.display());
                    None
                }
            },
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    eprintln!("Failed to read {}: {err}", path.display());
                }
                None
            }
        };
        merge(file_cfg, std::env::var(BRIDGE_ADDR_ENV).ok())
    }

    pub(crate) fn save(&self) -> io::Result<()> {
        write_json_atomic(&cli_config_path(), self)
    }

    pub(crate) fn last_port(&self) -> Option<&str> {
        Some(self.last_port.as_str()).filter(|port| !port.is_empty())
    }
}

fn merge(file_cfg: Option<CliConfig>, env_addr: Option<String>) -> CliConfig {
    let mut cfg = CliConfig::default();
    if let Some(file_cfg) = file_cfg {
        if !file_cfg.bridge_addr.is_empty() {
            cfg.bridge_addr = file_cfg.bridge_addr;
        }
        if file_cfg.default_baud != 0 {
            cfg.default_baud = file_cfg.default_baud;
        }
        cfg.last_port = file_cfg.last_port;
    }
    if let Some(addr) = env_addr.filter(|addr| !addr.is_empty()) {
        cfg.bridge_addr = addr;
    }
    cfg
}

fn cli_config_path() -> PathBuf {
    state_file_path(CLI_CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let file_cfg: CliConfig = serde_json::from_str(r#"{ "last_port": "/dev/ttyACM0" }"#).unwrap();
        let cfg = merge(Some(file_cfg), None);
        assert_eq!(cfg.bridge_addr, DEFAULT_BRIDGE_ADDR);
        assert_eq!(cfg.default_baud, 115200);
        assert_eq!(cfg.last_port(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn env_addr_wins_over_file() {
        let file_cfg = CliConfig {
            bridge_addr: "10.0.0.2:50061".into(),
            ..CliConfig::default()
        };
        let cfg = merge(Some(file_cfg.clone()), Some("127.0.0.1:6000".into()));
        assert_eq!(cfg.bridge_addr, "127.0.0.1:6000");

        let cfg = merge(Some(file_cfg), None);
        assert_eq!(cfg.bridge_addr, "10.0.0.2:50061");
        assert_eq!(cfg.last_port(), None);
    }
}
