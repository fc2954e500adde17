// Update Pipeline - State Machine for the self-update run
// CleaningUp -> Downloading -> Extracting -> Applying -> HandoffRequested,
// publishing one `updater` event per stage (plus download progress)

use futures_util::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;

use crate::auto_update::archive::{extract_archive_async, PackagedResources};
use crate::auto_update::event_bus::Broadcaster;
use crate::auto_update::handoff::{HandoffScript, ScriptFlavor};
use crate::auto_update::installer::UpdateInstaller;
use crate::auto_update::logger::UpdateLogger;
use crate::auto_update::transfer::{
    DownloadProgress, FileDestination, ProgressCallback, TransferOptions,
};
use crate::auto_update::{
    AppInfo, PipelineStage, PipelineState, Transfer, UpdateError, UpdateTarget, UpdaterConfig,
    UpdaterEvent, UPDATER_EVENT_ID,
};

/// Working paths owned by a pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub archive_path: PathBuf,
    pub extract_dir: PathBuf,
    pub script_path: PathBuf,
    pub flavor: ScriptFlavor,
}

impl PipelineConfig {
    /// `update.zip`, `update/` and the handoff script inside `temp_dir`
    pub fn from_temp_dir(temp_dir: &Path, flavor: ScriptFlavor) -> Self {
        Self {
            archive_path: temp_dir.join("update.zip"),
            extract_dir: temp_dir.join("update"),
            script_path: temp_dir.join(flavor.file_name()),
            flavor,
        }
    }

    /// Directories holding the run's files, each listed once
    fn work_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for path in [&self.archive_path, &self.extract_dir, &self.script_path] {
            let dir = path.parent().unwrap_or(path.as_path()).to_path_buf();
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }
}

/// Working directories with a run in flight, shared by every pipeline in the process
static IN_FLIGHT: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

fn in_flight() -> &'static Mutex<HashSet<PathBuf>> {
    IN_FLIGHT.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive claim on a run's working directories, released on drop
struct RunClaim {
    dirs: Vec<PathBuf>,
}

impl RunClaim {
    fn acquire(paths: &PipelineConfig) -> Result<Self, UpdateError> {
        let dirs = paths.work_dirs();
        let mut claimed = in_flight().lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(busy) = dirs.iter().find(|dir| claimed.contains(*dir)) {
            log::warn!("[Updater] Run already in flight in {}", busy.display());
            return Err(UpdateError::Busy);
        }
        claimed.extend(dirs.iter().cloned());
        Ok(Self { dirs })
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        let mut claimed = in_flight().lock().unwrap_or_else(PoisonError::into_inner);
        for dir in &self.dirs {
            claimed.remove(dir);
        }
    }
}

pub struct UpdatePipeline {
    broadcaster: Broadcaster,
    transfer: Transfer,
    app_info: Arc<dyn AppInfo>,
    installer: Arc<dyn UpdateInstaller>,
    paths: PipelineConfig,
    handoff: HandoffScript,
    package_dir_prefix: String,
    logger: Option<Arc<UpdateLogger>>,
    state: Mutex<PipelineState>,
}

impl UpdatePipeline {
    pub fn new(
        config: &UpdaterConfig,
        broadcaster: Broadcaster,
        transfer: Transfer,
        app_info: Arc<dyn AppInfo>,
        installer: Arc<dyn UpdateInstaller>,
    ) -> Self {
        let flavor = ScriptFlavor::native();
        let paths = PipelineConfig::from_temp_dir(&app_info.temp_dir(), flavor);

        Self {
            broadcaster,
            transfer,
            app_info,
            installer,
            paths,
            handoff: HandoffScript::new(flavor, config.handoff_delay_secs),
            package_dir_prefix: config.package_dir_prefix.clone(),
            logger: None,
            state: Mutex::new(PipelineState::Idle),
        }
    }

    /// Override the working paths (and the script flavor with them)
    pub fn with_paths(mut self, paths: PipelineConfig) -> Self {
        self.handoff.flavor = paths.flavor;
        self.paths = paths;
        self
    }

    /// Also write every stage to a dedicated update log
    pub fn with_logger(mut self, logger: Arc<UpdateLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn paths(&self) -> &PipelineConfig {
        &self.paths
    }

    pub fn state(&self) -> PipelineState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Run every stage for `target`, ending with the installer handoff
    ///
    /// The first failing stage stops the run; its error is returned as is and
    /// the state becomes `Failed`. Files left behind are removed by the next
    /// run's `CleaningUp`. Fails with `Busy` while any pipeline in the process
    /// runs in the same working directory.
    pub async fn install_update(&self, target: &UpdateTarget) -> Result<(), UpdateError> {
        let _claim = RunClaim::acquire(&self.paths)?;
        let started = Instant::now();

        log::info!(
            "[Updater] Installing {} from {}",
            target.version,
            target.url
        );
        self.note_info("Idle", &format!("Starting update to {}", target.version));

        self.run_stage(PipelineStage::CleaningUp, self.clean_up())
            .await?;
        self.run_stage(PipelineStage::Downloading, self.download(target))
            .await?;
        self.run_stage(PipelineStage::Extracting, self.extract())
            .await?;
        let script_path = self
            .run_stage(PipelineStage::Applying, self.apply(target))
            .await?;

        log::info!("[Updater] Handoff requested with {}", script_path.display());
        if let Some(logger) = &self.logger {
            let current = self.app_info.current_version();
            if let Err(e) = logger.log_handoff(&current, &target.version, started.elapsed()) {
                log::warn!("[Updater] Failed to write update log: {}", e);
            }
        }
        self.set_state(PipelineState::HandoffRequested {
            script_path: script_path.to_string_lossy().to_string(),
        });
        Ok(())
    }

    /// Run only the `CleaningUp` stage, e.g. on startup after an update
    pub async fn cleanup(&self) -> Result<(), UpdateError> {
        let _claim = RunClaim::acquire(&self.paths)?;
        self.run_stage(PipelineStage::CleaningUp, self.clean_up())
            .await?;
        self.set_state(PipelineState::Idle);
        Ok(())
    }

    async fn run_stage<T, F>(&self, stage: PipelineStage, work: F) -> Result<T, UpdateError>
    where
        F: Future<Output = Result<T, UpdateError>>,
    {
        let state = match stage {
            PipelineStage::CleaningUp => PipelineState::CleaningUp,
            PipelineStage::Downloading => PipelineState::Downloading,
            PipelineStage::Extracting => PipelineState::Extracting,
            PipelineStage::Applying => PipelineState::Applying,
        };
        self.set_state(state);
        self.note_info(&stage.to_string(), "Stage started");

        match work.await {
            Ok(value) => Ok(value),
            Err(e) => {
                log::error!("[Updater] {} failed: {}", stage, e);
                if let Some(logger) = &self.logger {
                    if let Err(log_err) = logger.failure(&stage.to_string(), &e) {
                        log::warn!("[Updater] Failed to write update log: {}", log_err);
                    }
                }
                self.set_state(PipelineState::Failed {
                    stage,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn clean_up(&self) -> Result<(), UpdateError> {
        self.publish(&UpdaterEvent::Cleanup).await?;

        remove_file_if_exists(&self.paths.archive_path).await?;
        remove_file_if_exists(&self.paths.script_path).await?;
        remove_dir_if_exists(&self.paths.extract_dir).await?;
        Ok(())
    }

    async fn download(&self, target: &UpdateTarget) -> Result<(), UpdateError> {
        self.publish(&UpdaterEvent::Download).await?;

        if let Some(parent) = self.paths.archive_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| fs_error("create", parent, e))?;
        }
        if let Some(logger) = &self.logger {
            logger.reset_progress_tracking();
        }

        let broadcaster = self.broadcaster.clone();
        let logger = self.logger.clone();
        let on_progress: ProgressCallback = Box::new(move |progress: DownloadProgress| {
            let broadcaster = broadcaster.clone();
            let logger = logger.clone();
            async move {
                if let Some(logger) = logger {
                    if let Err(e) = logger.log_progress("Downloading", &progress) {
                        log::warn!("[Updater] Failed to write update log: {}", e);
                    }
                }
                let event = UpdaterEvent::DownloadProgress {
                    bytes_downloaded: progress.bytes_downloaded,
                    bytes_total: progress.total_bytes,
                };
                broadcaster.send(UPDATER_EVENT_ID, &event).await
            }
            .boxed()
        });

        let destination = self
            .transfer
            .transfer(
                &target.url,
                FileDestination::new(&self.paths.archive_path),
                TransferOptions::with_progress(on_progress),
            )
            .await?;

        log::info!(
            "[Updater] Downloaded {} bytes to {}",
            destination.bytes_written(),
            destination.path().display()
        );
        Ok(())
    }

    async fn extract(&self) -> Result<(), UpdateError> {
        self.publish(&UpdaterEvent::Extract).await?;

        // The package ships the application's own resources
        let report = extract_archive_async(
            self.paths.archive_path.clone(),
            self.paths.extract_dir.clone(),
            PackagedResources::Allow,
        )
        .await?;

        self.note_info(
            "Extracting",
            &format!("Extracted {} file(s)", report.files),
        );
        Ok(())
    }

    async fn apply(&self, target: &UpdateTarget) -> Result<PathBuf, UpdateError> {
        self.publish(&UpdaterEvent::Apply).await?;

        let executable = self.app_info.executable_path()?;
        let install_dir = executable.parent().ok_or_else(|| {
            UpdateError::FileSystem(format!(
                "Executable {} has no parent directory",
                executable.display()
            ))
        })?;
        let source_dir = self
            .paths
            .extract_dir
            .join(format!("{} {}", self.package_dir_prefix, target.version));

        let present = tokio::fs::try_exists(&source_dir)
            .await
            .map_err(|e| fs_error("stat", &source_dir, e))?;
        if !present {
            return Err(UpdateError::PackageFormat(format!(
                "Package does not contain '{} {}'",
                self.package_dir_prefix, target.version
            )));
        }

        let script = self.handoff.generate(install_dir, &executable, &source_dir);
        let script_path = self.paths.script_path.clone();
        tokio::fs::write(&script_path, script)
            .await
            .map_err(|e| fs_error("write", &script_path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(|e| fs_error("set permissions on", &script_path, e))?;
        }

        self.installer.quit_and_run(&script_path).await?;
        Ok(script_path)
    }

    async fn publish(&self, event: &UpdaterEvent) -> Result<(), UpdateError> {
        self.broadcaster.send(UPDATER_EVENT_ID, event).await
    }

    fn set_state(&self, new_state: PipelineState) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, new_state.clone())
        };
        log::debug!("[Updater] State transition: {:?} -> {:?}", previous, new_state);
    }

    fn note_info(&self, stage: &str, message: &str) {
        if let Some(logger) = &self.logger {
            if let Err(e) = logger.info(stage, message) {
                log::warn!("[Updater] Failed to write update log: {}", e);
            }
        }
    }
}

fn fs_error(action: &str, path: &Path, e: std::io::Error) -> UpdateError {
    UpdateError::FileSystem(format!("Failed to {} {}: {}", action, path.display(), e))
}

async fn remove_file_if_exists(path: &Path) -> Result<(), UpdateError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            log::info!("[Updater] Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(fs_error("remove", path, e)),
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), UpdateError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            log::info!("[Updater] Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(fs_error("remove", path, e)),
    }
}
