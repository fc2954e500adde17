// Installer Handoff
// Starts the handoff script in a separate process and terminates the current
// one, either directly or through the host process across the transport

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::auto_update::handoff::ScriptFlavor;
use crate::auto_update::ipc::{self, unknown_method, IpcTransport, RemoteProxy, RemoteService};
use crate::auto_update::UpdateError;

/// Service name the host provides the installer under
pub const INSTALLER_SERVICE: &str = "UpdateInstallerAPI";

/// Capability of the host process to hand execution over to a script
#[async_trait]
pub trait UpdateInstaller: Send + Sync {
    /// Make sure `script_path` runs once this process is gone, then terminate it
    ///
    /// Implementations that really exit never return `Ok`.
    async fn quit_and_run(&self, script_path: &Path) -> Result<(), UpdateError>;
}

/// Hook that terminates the process after the script has been started
pub type ExitHook = Box<dyn Fn() + Send + Sync>;

/// Host-side installer: spawns the script interpreter detached, then exits
pub struct ProcessInstaller {
    flavor: ScriptFlavor,
    exit_hook: ExitHook,
}

impl Default for ProcessInstaller {
    fn default() -> Self {
        Self::new(ScriptFlavor::native())
    }
}

impl ProcessInstaller {
    pub fn new(flavor: ScriptFlavor) -> Self {
        Self {
            flavor,
            exit_hook: Box::new(|| std::process::exit(0)),
        }
    }

    /// Replace the default `process::exit(0)`, e.g. to let a UI shut down cleanly
    pub fn with_exit_hook(mut self, hook: ExitHook) -> Self {
        self.exit_hook = hook;
        self
    }

    /// Command that runs `script_path` with the flavor's interpreter
    pub fn handoff_command(&self, script_path: &Path) -> Command {
        let mut command = match self.flavor {
            ScriptFlavor::PowerShell => {
                let mut command = Command::new("powershell");
                command
                    .args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-File"])
                    .arg(script_path);
                command
            }
            ScriptFlavor::Posix => {
                let mut command = Command::new("sh");
                command.arg(script_path);
                command
            }
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Detach so the script outlives us
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            const DETACHED_PROCESS: u32 = 0x00000008;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command
    }

    /// Start the script without waiting for it
    pub fn spawn_handoff(&self, script_path: &Path) -> Result<(), UpdateError> {
        if !script_path.exists() {
            return Err(UpdateError::FileSystem(format!(
                "Handoff script not found: {}",
                script_path.display()
            )));
        }

        let child = self.handoff_command(script_path).spawn().map_err(|e| {
            UpdateError::FileSystem(format!("Failed to start handoff script: {}", e))
        })?;
        log::info!(
            "[Installer] Handoff script {} started (pid {})",
            script_path.display(),
            child.id()
        );
        Ok(())
    }
}

#[async_trait]
impl UpdateInstaller for ProcessInstaller {
    async fn quit_and_run(&self, script_path: &Path) -> Result<(), UpdateError> {
        self.spawn_handoff(script_path)?;
        log::info!("[Installer] Exiting so the update can be applied");
        (self.exit_hook)();
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuitAndRunArgs {
    script_path: PathBuf,
}

/// Installer living in the host process, reached through the transport
#[derive(Clone)]
pub struct RemoteInstaller {
    proxy: RemoteProxy,
}

impl RemoteInstaller {
    pub fn connect(transport: Arc<dyn IpcTransport>) -> Self {
        Self {
            proxy: ipc::consume(transport, INSTALLER_SERVICE),
        }
    }
}

#[async_trait]
impl UpdateInstaller for RemoteInstaller {
    async fn quit_and_run(&self, script_path: &Path) -> Result<(), UpdateError> {
        let args = QuitAndRunArgs {
            script_path: script_path.to_path_buf(),
        };
        let _: Value = self.proxy.call("quitAndRun", &args).await?;
        Ok(())
    }
}

struct InstallerService {
    installer: Arc<dyn UpdateInstaller>,
}

#[async_trait]
impl RemoteService for InstallerService {
    async fn call(&self, method: &str, args: Value) -> Result<Value, UpdateError> {
        match method {
            "quitAndRun" => {
                let args: QuitAndRunArgs = serde_json::from_value(args).map_err(|e| {
                    UpdateError::Decode(format!("Malformed quitAndRun arguments: {}", e))
                })?;
                self.installer.quit_and_run(&args.script_path).await?;
                Ok(Value::Null)
            }
            _ => Err(unknown_method(INSTALLER_SERVICE, method)),
        }
    }
}

/// Make `installer` reachable as `UpdateInstallerAPI` through `transport`
pub fn provide_installer_api(transport: &dyn IpcTransport, installer: Arc<dyn UpdateInstaller>) {
    transport.provide(INSTALLER_SERVICE, Arc::new(InstallerService { installer }));
}
