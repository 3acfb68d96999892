use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Unusable startup input (port, identity). Always fatal.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("process error: {0}")]
    Process(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
