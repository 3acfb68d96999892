use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::identity::{Identity, ListenPath};
use crate::settings::Settings;

pub const BUFFER_SIZE_KB: u32 = 64;
pub const CONN_IDLE_SECS: u32 = 120;

/// Xray-core configuration. TLS is terminated at the edge, so the inbound
/// carries no security block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigArtifact {
    pub log: LogConfig,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub policy: Policy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    pub loglevel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub port: u16,
    pub protocol: String,
    pub settings: InboundSettings,
    pub stream_settings: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundSettings {
    pub clients: Vec<VlessClient>,
    pub decryption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlessClient {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub ws_settings: WsSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsSettings {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub levels: BTreeMap<String, PolicyLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyLevel {
    pub buffer_size: u32,
    pub conn_idle: u32,
}

impl ConfigArtifact {
    pub fn new(listen_port: u16, identity: &Identity, path: &ListenPath, log_level: &str) -> Self {
        let mut levels = BTreeMap::new();
        levels.insert(
            "0".to_string(),
            PolicyLevel {
                buffer_size: BUFFER_SIZE_KB,
                conn_idle: CONN_IDLE_SECS,
            },
        );

        Self {
            log: LogConfig {
                loglevel: log_level.to_string(),
            },
            inbounds: vec![Inbound {
                port: listen_port,
                protocol: "vless".to_string(),
                settings: InboundSettings {
                    clients: vec![VlessClient {
                        id: identity.to_string(),
                    }],
                    decryption: "none".to_string(),
                },
                stream_settings: StreamSettings {
                    network: "ws".to_string(),
                    ws_settings: WsSettings {
                        path: path.to_string(),
                    },
                },
            }],
            outbounds: vec![Outbound {
                protocol: "freedom".to_string(),
            }],
            policy: Policy { levels },
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.listen_port,
            &settings.identity,
            &settings.listen_path,
            &settings.log_level,
        )
    }

    pub fn render(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Overwrites `path` with the rendered config, creating parent dirs.
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        let json_str = self.render()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, json_str).await?;
        debug!("💾 Config saved to {}", path.display());
        Ok(())
    }
}
