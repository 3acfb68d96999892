use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::identity::{Identity, ListenPath};

pub const CONFIG_FILE: &str = "config.json";
pub const ARCHIVE_FILE: &str = "xray.zip";
pub const BIN_DIR: &str = "xray";
pub const BINARY_NAME: &str = "xray";
pub const LINK_FILE: &str = "vless_xray_links.txt";
pub const DEFAULT_RELEASE_URL: &str = "https://github.com/XTLS/Xray-core/releases/latest/download";

/// Externally reachable location advertised to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub domain: String,
    pub port: u16,
    pub path: ListenPath,
    pub tls: bool,
}

/// Go runtime hints passed to the Xray process to keep its footprint small.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryHint {
    pub gomemlimit: String,
    pub gogc: String,
}

impl Default for MemoryHint {
    fn default() -> Self {
        Self {
            gomemlimit: "15MiB".to_string(),
            gogc: "15".to_string(),
        }
    }
}

impl MemoryHint {
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            ("GOMEMLIMIT".to_string(), self.gomemlimit.clone()),
            ("GOGC".to_string(), self.gogc.clone()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub domain: String,
    pub identity: Identity,
    /// Local port the inbound binds, assigned by the hosting platform.
    pub listen_port: u16,
    pub listen_path: ListenPath,
    /// Port advertised in the link (the edge terminator's port).
    pub public_port: u16,
    pub tls: bool,
    pub node_name: String,
    pub work_dir: PathBuf,
    pub log_level: String,
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
    pub max_restarts: Option<u32>,
    pub release_url: String,
    pub memory_hint: MemoryHint,
}

impl Settings {
    pub fn new(domain: impl Into<String>, identity: Identity, listen_port: u16) -> Self {
        Self {
            domain: domain.into(),
            listen_path: ListenPath::derive(&identity),
            identity,
            listen_port,
            public_port: 443,
            tls: true,
            node_name: "Panel".to_string(),
            work_dir: PathBuf::from("."),
            log_level: "error".to_string(),
            poll_interval: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
            max_restarts: None,
            release_url: DEFAULT_RELEASE_URL.to_string(),
            memory_hint: MemoryHint::default(),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            domain: self.domain.clone(),
            port: self.public_port,
            path: self.listen_path.clone(),
            tls: self.tls,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.work_dir.join(CONFIG_FILE)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.work_dir.join(ARCHIVE_FILE)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.work_dir.join(BIN_DIR)
    }

    pub fn binary_path(&self) -> PathBuf {
        self.bin_dir().join(BINARY_NAME)
    }

    pub fn link_path(&self) -> PathBuf {
        self.work_dir.join(LINK_FILE)
    }

    pub fn display_name(&self, label: &str) -> String {
        format!("{}-{}", self.node_name, label)
    }
}

/// Picks the first non-blank candidate and parses it as a listen port.
///
/// Returns [`Error::Config`] when no candidate is set or the value is not an
/// integer in `1..=65535`.
pub fn resolve_port(primary: Option<&str>, fallback: Option<&str>) -> Result<u16> {
    let raw = [primary, fallback]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .ok_or_else(|| Error::Config("no listen port available (set PORT or SERVER_PORT)".to_string()))?;

    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(Error::Config(format!("invalid listen port '{}'", raw))),
        Ok(port) => Ok(port),
    }
}
