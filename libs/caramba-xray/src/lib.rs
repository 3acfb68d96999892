//! Provisioning and supervision of a local Xray-core process serving a
//! VLESS over WebSocket inbound behind an edge TLS terminator.

pub mod artifact;
pub mod error;
pub mod identity;
pub mod link;
pub mod probe;
pub mod provision;
pub mod settings;
pub mod supervisor;

pub use artifact::ConfigArtifact;
pub use error::{Error, Result};
pub use identity::{Identity, ListenPath};
pub use link::SubscriptionLink;
pub use probe::NetworkProbe;
pub use provision::{HttpFetcher, Provisioner};
pub use settings::{Endpoint, Settings};
pub use supervisor::{Supervisor, XrayLauncher};
