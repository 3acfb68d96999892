use std::future::Future;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::ConfigArtifact;
use crate::error::{Error, Result};
use crate::provision::{ArchiveFetcher, Provisioner, partial_path};
use crate::settings::{BINARY_NAME, Settings};

/// What to run for one launch attempt.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub binary: &'a Path,
    pub config: &'a Path,
    pub env: &'a [(String, String)],
}

/// Spawns the supervised process.
pub trait Launcher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> impl Future<Output = io::Result<Child>>;
}

/// Runs `xray run -config <file>` with output discarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct XrayLauncher;

impl Launcher for XrayLauncher {
    async fn launch(&self, spec: &LaunchSpec<'_>) -> io::Result<Child> {
        Command::new(spec.binary)
            .arg("run")
            .arg("-config")
            .arg(spec.config)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Running,
    Crashed,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Alive,
    Restarted,
    /// The child was gone and relaunching failed; the next tick retries.
    RestartFailed,
}

/// Owns the Xray child process: launch, liveness polling, restart, cleanup.
pub struct Supervisor<F, L> {
    settings: Settings,
    provisioner: Provisioner<F>,
    launcher: L,
    child: Option<Child>,
    state: SupervisorState,
    launches: u32,
    restarts: u32,
}

impl<F: ArchiveFetcher, L: Launcher> Supervisor<F, L> {
    pub fn new(settings: Settings, provisioner: Provisioner<F>, launcher: L) -> Self {
        Self {
            settings,
            provisioner,
            launcher,
            child: None,
            state: SupervisorState::NotStarted,
            launches: 0,
            restarts: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Successful spawns so far, including the first.
    pub fn launches(&self) -> u32 {
        self.launches
    }

    #[cfg(test)]
    pub(crate) fn child_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Provisions the binary, rewrites the config and spawns a fresh child.
    pub async fn start(&mut self) -> Result<()> {
        let binary = self.provisioner.ensure_present().await?;

        let config_path = self.settings.config_path();
        ConfigArtifact::from_settings(&self.settings)
            .write_to(&config_path)
            .await?;

        let env = self.settings.memory_hint.env();
        let spec = LaunchSpec {
            binary: &binary,
            config: &config_path,
            env: &env,
        };
        let child = self
            .launcher
            .launch(&spec)
            .await
            .map_err(|e| Error::Process(format!("failed to launch {}: {}", binary.display(), e)))?;

        self.launches += 1;
        info!("🚀 Xray started (pid {})", child.id().map_or("?".to_string(), |p| p.to_string()));
        self.child = Some(child);
        self.state = SupervisorState::Running;
        Ok(())
    }

    /// Single liveness check; relaunches once if the child is gone.
    ///
    /// Errors only when the restart ceiling is exceeded.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let gone = match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => false,
                Ok(Some(status)) => {
                    warn!("⚠️ Xray exited ({}), restarting...", status);
                    true
                }
                Err(e) => {
                    warn!("⚠️ Could not poll Xray: {}, restarting...", e);
                    true
                }
            },
            None => {
                warn!("⚠️ Xray is not running, retrying launch...");
                true
            }
        };

        if !gone {
            debug!("Xray alive");
            return Ok(TickOutcome::Alive);
        }

        self.child = None;
        self.state = SupervisorState::Crashed;

        if let Some(max) = self.settings.max_restarts {
            if self.restarts >= max {
                return Err(Error::Process(format!("restart limit of {} reached", max)));
            }
        }
        self.restarts += 1;

        match self.start().await {
            Ok(()) => Ok(TickOutcome::Restarted),
            Err(e) => {
                error!("❌ Restart failed: {}", e);
                Ok(TickOutcome::RestartFailed)
            }
        }
    }

    /// Polls until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("🛑 Shutdown requested");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }
            // A restart may sit in a download; shutdown must not wait for it.
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("🛑 Shutdown requested during restart");
                    return Ok(());
                }
                outcome = self.tick() => {
                    outcome?;
                }
            }
        }
    }

    /// Terminates the child and removes transient files. Safe to repeat.
    pub async fn stop(&mut self) -> Result<()> {
        self.state = SupervisorState::Stopping;

        if let Some(mut child) = self.child.take() {
            terminate(&mut child, self.settings.stop_timeout).await;
        }

        let leftovers = [
            self.settings.config_path(),
            self.settings.archive_path(),
            partial_path(&self.settings.bin_dir(), BINARY_NAME),
        ];
        for path in leftovers {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("🧹 Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    self.state = SupervisorState::Stopped;
                    return Err(e.into());
                }
            }
        }

        self.state = SupervisorState::Stopped;
        Ok(())
    }
}

/// SIGTERM, then SIGKILL once `grace` has elapsed.
async fn terminate(child: &mut Child, grace: Duration) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    if let Some(pid) = child.id() {
        info!("🛑 Stopping Xray (pid {})", pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("⚠️ SIGTERM to {} failed: {}", pid, e);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("Xray exited with {}", status),
        Ok(Err(e)) => warn!("⚠️ Waiting for Xray failed: {}", e),
        Err(_) => {
            warn!("⚠️ Xray ignored SIGTERM for {:?}, killing", grace);
            if let Err(e) = child.kill().await {
                error!("❌ Failed to kill Xray: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct NoFetch;

    impl ArchiveFetcher for NoFetch {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            Err(Error::Provision(format!("unexpected fetch of {}", url)))
        }
    }

    /// Download that never completes.
    struct StalledFetch;

    impl ArchiveFetcher for StalledFetch {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
            std::future::pending().await
        }
    }

    /// Spawns a stand-in command and records every launch spec it sees.
    struct FakeLauncher {
        program: &'static str,
        args: &'static [&'static str],
        /// Wait for the child to exit before handing it over.
        reap: bool,
        calls: Mutex<Vec<(PathBuf, PathBuf, Vec<(String, String)>)>>,
    }

    impl FakeLauncher {
        fn exiting() -> Self {
            Self {
                program: "true",
                args: &[],
                reap: true,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn ignoring_term() -> Self {
            Self {
                program: "sh",
                args: &["-c", "trap '' TERM; exec sleep 30"],
                reap: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn sleeping() -> Self {
            Self {
                program: "sleep",
                args: &["30"],
                reap: false,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Launcher for FakeLauncher {
        async fn launch(&self, spec: &LaunchSpec<'_>) -> io::Result<Child> {
            self.calls.lock().unwrap().push((
                spec.binary.to_path_buf(),
                spec.config.to_path_buf(),
                spec.env.to_vec(),
            ));
            let mut child = Command::new(self.program)
                .args(self.args)
                .kill_on_drop(true)
                .spawn()?;
            if self.reap {
                child.wait().await?;
            }
            Ok(child)
        }
    }

    fn supervisor(dir: &Path, launcher: FakeLauncher, installed: bool) -> Supervisor<NoFetch, FakeLauncher> {
        supervisor_with(dir, NoFetch, launcher, installed)
    }

    fn supervisor_with<F: ArchiveFetcher>(
        dir: &Path,
        fetcher: F,
        launcher: FakeLauncher,
        installed: bool,
    ) -> Supervisor<F, FakeLauncher> {
        let identity = Identity::resolve(Some("11111111-1111-1111-1111-111111111111")).unwrap();
        let mut settings = Settings::new("example.com", identity, 8080);
        settings.work_dir = dir.to_path_buf();
        settings.poll_interval = Duration::from_millis(10);
        settings.stop_timeout = Duration::from_secs(2);
        if installed {
            std::fs::create_dir_all(settings.bin_dir()).unwrap();
            std::fs::write(settings.binary_path(), b"").unwrap();
        }
        let provisioner = Provisioner::new(fetcher, &settings);
        Supervisor::new(settings, provisioner, launcher)
    }

    #[tokio::test]
    async fn start_writes_config_and_launches() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), FakeLauncher::exiting(), true);
        assert_eq!(sup.state(), SupervisorState::NotStarted);

        sup.start().await.unwrap();

        assert_eq!(sup.state(), SupervisorState::Running);
        assert_eq!(sup.launches(), 1);
        let config = std::fs::read_to_string(sup.settings().config_path()).unwrap();
        assert_eq!(config, ConfigArtifact::from_settings(sup.settings()).render().unwrap());

        let calls = sup.launcher.calls.lock().unwrap();
        let (binary, config_path, env) = &calls[0];
        assert_eq!(binary, &sup.settings().binary_path());
        assert_eq!(config_path, &sup.settings().config_path());
        assert!(env.contains(&("GOMEMLIMIT".to_string(), "15MiB".to_string())));
        assert!(env.contains(&("GOGC".to_string(), "15".to_string())));
    }

    #[tokio::test]
    async fn start_fails_without_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), FakeLauncher::exiting(), false);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, Error::Provision(_)));
        assert_eq!(sup.launches(), 0);
        assert!(sup.launcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn each_crash_costs_one_launch_per_tick() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), FakeLauncher::exiting(), true);
        sup.start().await.unwrap();

        const CRASHES: u32 = 4;
        for _ in 0..CRASHES {
            assert_eq!(sup.tick().await.unwrap(), TickOutcome::Restarted);
        }
        assert_eq!(sup.launches(), CRASHES + 1);
        assert_eq!(sup.launcher.calls.lock().unwrap().len() as u32, CRASHES + 1);
    }

    #[tokio::test]
    async fn live_child_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), FakeLauncher::sleeping(), true);
        sup.start().await.unwrap();
        let pid = sup.child_id();

        assert_eq!(sup.tick().await.unwrap(), TickOutcome::Alive);
        assert_eq!(sup.tick().await.unwrap(), TickOutcome::Alive);
        assert_eq!(sup.launches(), 1);
        assert_eq!(sup.child_id(), pid);

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_restart_is_retried_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), FakeLauncher::exiting(), true);
        sup.start().await.unwrap();

        std::fs::remove_file(sup.settings().binary_path()).unwrap();
        assert_eq!(sup.tick().await.unwrap(), TickOutcome::RestartFailed);
        assert_eq!(sup.state(), SupervisorState::Crashed);

        std::fs::write(sup.settings().binary_path(), b"").unwrap();
        assert_eq!(sup.tick().await.unwrap(), TickOutcome::Restarted);
        assert_eq!(sup.launches(), 2);
    }

    #[tokio::test]
    async fn restart_ceiling_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), FakeLauncher::exiting(), true);
        sup.settings.max_restarts = Some(2);
        sup.start().await.unwrap();

        let err = sup.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Process(_)));
        assert_eq!(sup.launches(), 3);
    }

    #[tokio::test]
    async fn cancellation_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), FakeLauncher::sleeping(), true);
        sup.start().await.unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), sup.run(token))
            .await
            .expect("run did not observe cancellation")
            .unwrap();
        assert_eq!(sup.launches(), 1);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_stalled_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor_with(dir.path(), StalledFetch, FakeLauncher::exiting(), true);
        sup.start().await.unwrap();
        // The child has exited; the restart has to download again and hangs.
        std::fs::remove_file(sup.settings().binary_path()).unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_secs(3), sup.run(token))
            .await
            .expect("run did not observe cancellation during restart")
            .unwrap();
        assert_eq!(sup.launches(), 1);

        sup.stop().await.unwrap();
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn stop_kills_a_child_that_ignores_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), FakeLauncher::ignoring_term(), true);
        sup.settings.stop_timeout = Duration::from_millis(200);
        sup.start().await.unwrap();
        let pid = sup.child_id().expect("child has a pid");
        // Let the shell install its trap before it is signalled.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let began = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(3), sup.stop())
            .await
            .expect("stop exceeded its bound")
            .unwrap();

        assert!(began.elapsed() >= Duration::from_millis(200));
        assert!(sup.child_id().is_none());
        assert_eq!(
            kill(Pid::from_raw(pid as i32), None),
            Err(nix::errno::Errno::ESRCH)
        );
    }

    #[tokio::test]
    async fn stop_removes_partial_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), FakeLauncher::exiting(), true);
        let partial = partial_path(&sup.settings().bin_dir(), BINARY_NAME);
        std::fs::write(&partial, b"half").unwrap();

        sup.stop().await.unwrap();
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn stop_terminates_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), FakeLauncher::sleeping(), true);
        sup.start().await.unwrap();
        std::fs::write(sup.settings().archive_path(), b"partial").unwrap();

        sup.stop().await.unwrap();

        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert!(sup.child_id().is_none());
        assert!(!sup.settings().config_path().exists());
        assert!(!sup.settings().archive_path().exists());
        assert!(sup.settings().binary_path().exists());

        sup.stop().await.unwrap();
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), FakeLauncher::exiting(), true);
        sup.stop().await.unwrap();
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(sup.launches(), 0);
    }
}
