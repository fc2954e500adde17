// Updater Service
// Release check and install as one object, exposed as `UpdaterAPI` so the
// UI side can drive the update from across the transport

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::auto_update::event_bus::Broadcaster;
use crate::auto_update::installer::UpdateInstaller;
use crate::auto_update::ipc::{self, unknown_method, IpcTransport, RemoteProxy, RemoteService};
use crate::auto_update::pipeline::UpdatePipeline;
use crate::auto_update::release::ReleaseResolver;
use crate::auto_update::{AppInfo, PipelineState, Transfer, UpdateError, UpdateTarget, UpdaterConfig};

/// Service name the updater is provided under
pub const UPDATER_SERVICE: &str = "UpdaterAPI";

pub struct Updater {
    resolver: ReleaseResolver,
    pipeline: UpdatePipeline,
    app_info: Arc<dyn AppInfo>,
}

impl Updater {
    /// Wire resolver and pipeline from one config, sharing one HTTP client
    pub fn new(
        config: &UpdaterConfig,
        broadcaster: Broadcaster,
        app_info: Arc<dyn AppInfo>,
        installer: Arc<dyn UpdateInstaller>,
    ) -> Self {
        let transfer = Transfer::from_config(config);
        let resolver = ReleaseResolver::new(config, transfer.clone(), app_info.clone());
        let pipeline = UpdatePipeline::new(config, broadcaster, transfer, app_info.clone(), installer);
        Self::from_parts(resolver, pipeline, app_info)
    }

    pub fn from_parts(
        resolver: ReleaseResolver,
        pipeline: UpdatePipeline,
        app_info: Arc<dyn AppInfo>,
    ) -> Self {
        Self {
            resolver,
            pipeline,
            app_info,
        }
    }

    pub fn pipeline(&self) -> &UpdatePipeline {
        &self.pipeline
    }

    pub fn state(&self) -> PipelineState {
        self.pipeline.state()
    }

    /// `Ok(None)` when checked and nothing newer can be installed
    pub async fn get_latest_update(&self) -> Result<Option<UpdateTarget>, UpdateError> {
        self.resolver.check_for_update().await
    }

    /// Run the update pipeline for `target`
    pub async fn install_update(&self, target: &UpdateTarget) -> Result<(), UpdateError> {
        if !self.app_info.is_packaged() {
            log::warn!("[Updater] Refusing to install {} into a development build", target.version);
            return Err(UpdateError::NotPackaged);
        }
        self.pipeline.install_update(target).await
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct InstallUpdateArgs {
    update: UpdateTarget,
}

struct UpdaterService {
    updater: Arc<Updater>,
}

#[async_trait]
impl RemoteService for UpdaterService {
    async fn call(&self, method: &str, args: Value) -> Result<Value, UpdateError> {
        match method {
            "getLatestUpdate" => {
                let latest = self.updater.get_latest_update().await?;
                serde_json::to_value(latest)
                    .map_err(|e| UpdateError::Transport(format!("Failed to encode update: {}", e)))
            }
            "installUpdate" => {
                let args: InstallUpdateArgs = serde_json::from_value(args).map_err(|e| {
                    UpdateError::Decode(format!("Malformed installUpdate arguments: {}", e))
                })?;
                self.updater.install_update(&args.update).await?;
                Ok(Value::Null)
            }
            _ => Err(unknown_method(UPDATER_SERVICE, method)),
        }
    }
}

/// Make `updater` reachable as `UpdaterAPI` through `transport`
pub fn provide_updater_api(transport: &dyn IpcTransport, updater: Arc<Updater>) {
    transport.provide(UPDATER_SERVICE, Arc::new(UpdaterService { updater }));
}

/// `UpdaterAPI` as seen from the other side of the transport
#[derive(Clone)]
pub struct RemoteUpdater {
    proxy: RemoteProxy,
}

impl RemoteUpdater {
    pub fn connect(transport: Arc<dyn IpcTransport>) -> Self {
        Self {
            proxy: ipc::consume(transport, UPDATER_SERVICE),
        }
    }

    pub async fn get_latest_update(&self) -> Result<Option<UpdateTarget>, UpdateError> {
        self.proxy.call("getLatestUpdate", &Value::Null).await
    }

    pub async fn install_update(&self, update: &UpdateTarget) -> Result<(), UpdateError> {
        let args = InstallUpdateArgs {
            update: update.clone(),
        };
        let _: Value = self.proxy.call("installUpdate", &args).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto_update::event_bus::BroadcastHub;
    use crate::auto_update::handoff::ScriptFlavor;
    use crate::auto_update::installer::{provide_installer_api, RemoteInstaller};
    use crate::auto_update::ipc::InProcessTransport;
    use crate::auto_update::pipeline::PipelineConfig;
    use crate::auto_update::test_support::{build_zip, serve};
    use crate::auto_update::StaticAppInfo;
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingInstaller {
        calls: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl UpdateInstaller for RecordingInstaller {
        async fn quit_and_run(&self, script_path: &Path) -> Result<(), UpdateError> {
            self.calls.lock().unwrap().push(script_path.to_path_buf());
            Ok(())
        }
    }

    fn release_server_router(base: &'static str) -> Router {
        let package = build_zip(&[("D2RMM 2.0.0/D2RMM.exe", b"new build")]);
        Router::new()
            .route(
                "/releases/latest",
                get(move || async move {
                    axum::Json(json!({
                        "tag_name": "v2.0.0",
                        "assets": [
                            { "name": "readme.txt", "browser_download_url": format!("{}/readme.txt", base) },
                            { "name": "D2RMM-2.0.0.zip", "browser_download_url": format!("{}/D2RMM-2.0.0.zip", base) }
                        ]
                    }))
                }),
            )
            .route(
                "/D2RMM-2.0.0.zip",
                get(move || {
                    let package = package.clone();
                    async move { package }
                }),
            )
    }

    struct Setup {
        _dir: tempfile::TempDir,
        transport: Arc<InProcessTransport>,
        installer: Arc<RecordingInstaller>,
        updater: Arc<Updater>,
    }

    fn setup(feed_url: String, packaged: bool) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(InProcessTransport::new());
        BroadcastHub::new().provide(transport.as_ref());

        // Host process side: owns the installer
        let installer = Arc::new(RecordingInstaller::default());
        provide_installer_api(transport.as_ref(), installer.clone());

        let config = UpdaterConfig {
            feed_url,
            ..UpdaterConfig::default()
        };
        let work = dir.path().join("work");
        let app_info: Arc<dyn AppInfo> = Arc::new(
            StaticAppInfo::new("1.0.0", dir.path().join("app").join("D2RMM.exe"), work.clone())
                .packaged(packaged),
        );
        let transfer = Transfer::from_config(&config);
        let pipeline = UpdatePipeline::new(
            &config,
            Broadcaster::connect(transport.clone()),
            transfer.clone(),
            app_info.clone(),
            Arc::new(RemoteInstaller::connect(transport.clone())),
        )
        .with_paths(PipelineConfig::from_temp_dir(&work, ScriptFlavor::Posix));
        let resolver = ReleaseResolver::new(&config, transfer, app_info.clone());
        let updater = Arc::new(Updater::from_parts(resolver, pipeline, app_info));

        Setup {
            _dir: dir,
            transport,
            installer,
            updater,
        }
    }

    #[tokio::test]
    async fn test_remote_check_and_install() {
        // Asset URLs need the server address, which is only known after binding
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base: &'static str = Box::leak(format!("http://{}", listener.local_addr().unwrap()).into_boxed_str());
        let router = release_server_router(base);
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let s = setup(format!("{}/releases/latest", base), true);
        provide_updater_api(s.transport.as_ref(), s.updater.clone());
        let remote = RemoteUpdater::connect(s.transport.clone());

        let latest = remote.get_latest_update().await.unwrap().unwrap();
        assert_eq!(latest.version, "2.0.0");
        assert_eq!(latest.url, format!("{}/D2RMM-2.0.0.zip", base));

        remote.install_update(&latest).await.unwrap();
        assert_eq!(s.installer.calls.lock().unwrap().len(), 1);
        assert!(matches!(s.updater.state(), PipelineState::HandoffRequested { .. }));

        server.abort();
    }

    #[tokio::test]
    async fn test_development_build_has_no_update() {
        let server = serve(release_server_router("http://unused")).await;
        let s = setup(server.url("/releases/latest"), false);

        assert_eq!(s.updater.get_latest_update().await.unwrap(), None);

        let target = UpdateTarget {
            version: "2.0.0".to_string(),
            url: server.url("/D2RMM-2.0.0.zip"),
        };
        let result = s.updater.install_update(&target).await;
        assert!(matches!(result, Err(UpdateError::NotPackaged)));
        assert!(s.installer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(InProcessTransport::new());
        let app_info = Arc::new(
            StaticAppInfo::new("1.0.0", dir.path().join("D2RMM.exe"), dir.path().join("work"))
                .packaged(false),
        );
        let updater = Updater::new(
            &UpdaterConfig::default(),
            Broadcaster::connect(transport.clone()),
            app_info,
            Arc::new(RecordingInstaller::default()),
        );

        assert_eq!(updater.state(), PipelineState::Idle);
        assert_eq!(updater.get_latest_update().await.unwrap(), None);
        assert_eq!(
            updater.pipeline().paths().archive_path,
            dir.path().join("work").join("update.zip")
        );
    }

    #[tokio::test]
    async fn test_errors_cross_the_transport() {
        let s = setup(crate::auto_update::test_support::closed_port_url("/releases/latest"), true);
        provide_updater_api(s.transport.as_ref(), s.updater.clone());
        let remote = RemoteUpdater::connect(s.transport.clone());

        let result = remote.get_latest_update().await;
        assert!(matches!(result, Err(UpdateError::Network(_))));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let s = setup("http://unused".to_string(), true);
        provide_updater_api(s.transport.as_ref(), s.updater.clone());

        let result = s
            .transport
            .request(UPDATER_SERVICE, "uninstall", Value::Null)
            .await;
        assert!(matches!(result, Err(UpdateError::Transport(_))));
    }
}
