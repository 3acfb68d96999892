use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const UNKNOWN_LABEL: &str = "Unknown";

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// `{"country_code": "..", "organization": ".."}`
    GeoIpJson,
    /// `key=value` lines with a `loc=` entry.
    CloudflareTrace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSource {
    pub url: String,
    pub format: SourceFormat,
}

impl ProbeSource {
    pub fn new(url: impl Into<String>, format: SourceFormat) -> Self {
        Self {
            url: url.into(),
            format,
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("https://api.ip.sb/geoip", SourceFormat::GeoIpJson),
            Self::new(
                "https://www.cloudflare.com/cdn-cgi/trace",
                SourceFormat::CloudflareTrace,
            ),
        ]
    }

    pub fn parse(&self, body: &str) -> Option<String> {
        match self.format {
            SourceFormat::GeoIpJson => parse_geoip(body),
            SourceFormat::CloudflareTrace => parse_trace(body),
        }
    }
}

/// Result of asking a single source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Label(String),
    Timeout,
    Status(u16),
    Network(String),
    Parse(String),
}

#[derive(Debug, Deserialize)]
struct GeoIp {
    country_code: String,
    organization: String,
}

fn sanitize(label: &str) -> String {
    label.trim().replace(' ', "_")
}

pub fn parse_geoip(body: &str) -> Option<String> {
    let geo: GeoIp = serde_json::from_str(body).ok()?;
    if geo.country_code.trim().is_empty() {
        return None;
    }
    Some(sanitize(&format!("{}-{}", geo.country_code, geo.organization)))
}

pub fn parse_trace(body: &str) -> Option<String> {
    body.lines()
        .find_map(|line| line.trim().strip_prefix("loc="))
        .map(str::trim)
        .filter(|loc| !loc.is_empty())
        .map(|loc| sanitize(&format!("{}-CF", loc)))
}

/// Best-effort lookup of the host's location, used only to decorate the
/// link's display name.
pub struct NetworkProbe {
    client: Client,
    sources: Vec<ProbeSource>,
}

impl NetworkProbe {
    pub fn new(sources: Vec<ProbeSource>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Probe(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, sources })
    }

    pub async fn probe_source(&self, source: &ProbeSource) -> ProbeOutcome {
        let resp = match self.client.get(&source.url).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return ProbeOutcome::Timeout,
            Err(e) => return ProbeOutcome::Network(e.to_string()),
        };

        if !resp.status().is_success() {
            return ProbeOutcome::Status(resp.status().as_u16());
        }

        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return ProbeOutcome::Timeout,
            Err(e) => return ProbeOutcome::Network(e.to_string()),
        };

        match source.parse(&body) {
            Some(label) => ProbeOutcome::Label(label),
            None => ProbeOutcome::Parse(format!("unrecognized response from {}", source.url)),
        }
    }

    /// First label any source yields, or [`UNKNOWN_LABEL`].
    pub async fn lookup_label(&self) -> String {
        info!("🌍 Looking up ISP info...");
        for source in &self.sources {
            match self.probe_source(source).await {
                ProbeOutcome::Label(label) => {
                    info!("✅ ISP label: {}", label);
                    return label;
                }
                ProbeOutcome::Timeout => debug!("Probe {} timed out", source.url),
                ProbeOutcome::Status(code) => debug!("Probe {} returned {}", source.url, code),
                ProbeOutcome::Network(e) => debug!("Probe {} failed: {}", source.url, e),
                ProbeOutcome::Parse(e) => debug!("Probe {}: {}", source.url, e),
            }
        }
        warn!("⚠️ ISP lookup failed, using '{}'", UNKNOWN_LABEL);
        UNKNOWN_LABEL.to_string()
    }
}
