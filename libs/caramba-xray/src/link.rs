use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::settings::Endpoint;

/// Shareable `vless://` URI and its base64 subscription form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionLink {
    raw: String,
}

/// Percent-encodes everything but unreserved characters and `/`.
fn quote(value: &str) -> String {
    urlencoding::encode(value).replace("%2F", "/")
}

impl SubscriptionLink {
    pub fn build(identity: &Identity, endpoint: &Endpoint, display_name: &str) -> Self {
        let security = if endpoint.tls { "tls" } else { "none" };
        let host = quote(&endpoint.domain);

        let mut params = vec![
            "encryption=none".to_string(),
            format!("security={}", security),
            "type=ws".to_string(),
            format!("host={}", host),
            format!("path={}", quote(endpoint.path.as_str())),
        ];
        if endpoint.tls {
            params.push(format!("sni={}", host));
        }

        let raw = format!(
            "vless://{}@{}:{}?{}#{}",
            identity,
            endpoint.domain,
            endpoint.port,
            params.join("&"),
            quote(display_name)
        );
        Self { raw }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn encoded(&self) -> String {
        STANDARD.encode(self.raw.as_bytes())
    }

    /// Inverse of [`SubscriptionLink::encoded`].
    pub fn decode(encoded: &str) -> Result<String> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Config(format!("subscription is not valid base64: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|e| Error::Config(format!("subscription is not valid UTF-8: {}", e)))
    }

    /// Writes the encoded link as a single line. Failures are logged only.
    pub async fn write_to(&self, path: &Path) -> bool {
        match tokio::fs::write(path, format!("{}\n", self.encoded())).await {
            Ok(()) => {
                info!("📝 Subscription written to {}", path.display());
                true
            }
            Err(e) => {
                error!("❌ Failed to write subscription to {}: {}", path.display(), e);
                false
            }
        }
    }
}
