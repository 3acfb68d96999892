use std::fs::File;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::settings::{BINARY_NAME, Settings};

/// Source of release archives.
pub trait ArchiveFetcher {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>>>;
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client whose connect phase and whole download are both time-boxed.
    pub fn bounded(connect_timeout: Duration, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Provision(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl ArchiveFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Provision(format!("request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::Provision(format!(
                "failed to download {}: status {}",
                url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Provision(format!("failed to read {}: {}", url, e)))?;
        Ok(bytes.to_vec())
    }
}

/// Release asset suffix for a CPU descriptor: x86/amd64 hosts get `64`,
/// everything else `arm64-v8a`.
pub fn release_arch(machine: &str) -> &'static str {
    let machine = machine.to_ascii_lowercase();
    if machine.contains("x86") || machine.contains("amd64") {
        "64"
    } else {
        "arm64-v8a"
    }
}

pub fn release_url(base: &str, arch: &str) -> String {
    format!("{}/Xray-linux-{}.zip", base.trim_end_matches('/'), arch)
}

/// Where an entry is written before it is renamed into place.
pub fn partial_path(dest_dir: &Path, entry: &str) -> PathBuf {
    dest_dir.join(format!("{}.part", entry))
}

/// Pulls the single `entry` out of a zip archive into `dest_dir` and marks it
/// executable. The entry only appears under its final name once fully
/// written; a failed extraction leaves nothing behind.
pub fn extract_entry(archive_path: &Path, entry: &str, dest_dir: &Path) -> Result<PathBuf> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| Error::Provision(format!("{} is not a zip archive: {}", archive_path.display(), e)))?;
    let mut source = archive
        .by_name(entry)
        .map_err(|e| Error::Provision(format!("'{}' not found in archive: {}", entry, e)))?;

    std::fs::create_dir_all(dest_dir)?;
    let partial = partial_path(dest_dir, entry);
    let target = dest_dir.join(entry);

    let written = (|| -> io::Result<()> {
        let mut out = File::create(&partial)?;
        io::copy(&mut source, &mut out)?;
        out.sync_all()?;

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&partial, std::fs::Permissions::from_mode(0o755))?;
        std::fs::rename(&partial, &target)
    })();

    if let Err(e) = written {
        let _ = std::fs::remove_file(&partial);
        return Err(e.into());
    }
    Ok(target)
}

/// Makes sure the Xray binary exists locally, downloading it on first run.
pub struct Provisioner<F> {
    fetcher: F,
    bin_dir: PathBuf,
    archive_path: PathBuf,
    release_url: String,
    arch: &'static str,
}

impl<F: ArchiveFetcher> Provisioner<F> {
    pub fn new(fetcher: F, settings: &Settings) -> Self {
        Self {
            fetcher,
            bin_dir: settings.bin_dir(),
            archive_path: settings.archive_path(),
            release_url: settings.release_url.clone(),
            arch: release_arch(std::env::consts::ARCH),
        }
    }

    pub fn binary_path(&self) -> PathBuf {
        self.bin_dir.join(BINARY_NAME)
    }

    #[cfg(test)]
    pub(crate) fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Returns the binary path. An existing binary is trusted as-is.
    pub async fn ensure_present(&self) -> Result<PathBuf> {
        let binary = self.binary_path();
        if binary.exists() {
            return Ok(binary);
        }

        let url = release_url(&self.release_url, self.arch);
        info!("⬇️ Downloading Xray core ({}) from {}", self.arch, url);

        let bytes = self.fetcher.fetch(&url).await?;
        tokio::fs::write(&self.archive_path, &bytes)
            .await
            .map_err(|e| Error::Provision(format!("failed to save {}: {}", self.archive_path.display(), e)))?;

        let archive_path = self.archive_path.clone();
        let bin_dir = self.bin_dir.clone();
        let extracted = tokio::task::spawn_blocking(move || extract_entry(&archive_path, BINARY_NAME, &bin_dir))
            .await
            .map_err(|e| Error::Provision(format!("extraction task failed: {}", e)))?
            .map_err(|e| match e {
                Error::Io(io) => Error::Provision(format!("failed to extract {}: {}", BINARY_NAME, io)),
                other => other,
            })?;

        if let Err(e) = tokio::fs::remove_file(&self.archive_path).await {
            warn!("⚠️ Could not remove {}: {}", self.archive_path.display(), e);
        }

        info!("✅ Xray core installed at {}", extracted.display());
        Ok(extracted)
    }
}
