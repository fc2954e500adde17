//! D2RMM updater host
//!
//! Runs the self-update subsystem from the command line, with both sides of
//! the transport in this process:
//! - `--check` (default): query the release feed and print the result
//! - `--install`: check, then download, unpack and hand off to the update script
//! - `--cleanup`: remove leftovers of a previous update
//! - `--save-config`: write the effective configuration to the config file

use std::sync::Arc;

use d2rmm_updater::auto_update::{
    self, listener, provide_installer_api, provide_updater_api, AppInfo, BroadcastHub,
    Broadcaster, InProcessTransport, ProcessInstaller, ReleaseResolver, RemoteInstaller,
    RemoteUpdater, SystemAppInfo, Transfer, UpdateError, UpdateLogger, UpdatePipeline, Updater,
    UpdaterEvent, UPDATER_EVENT_ID,
};

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "--check".to_string());

    if let Err(e) = run(&mode).await {
        log::error!("[Updater] {}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run(mode: &str) -> Result<(), UpdateError> {
    let config = auto_update::load_config();
    if mode == "--save-config" {
        auto_update::save_config(&config)?;
        println!("Saved {}", auto_update::get_config_path().display());
        return Ok(());
    }

    let app_info: Arc<dyn AppInfo> = Arc::new(SystemAppInfo::new());
    let transport = Arc::new(InProcessTransport::new());

    // UI side: progress listener on the event bus
    let hub = BroadcastHub::new();
    hub.provide(transport.as_ref());
    hub.subscribe(
        UPDATER_EVENT_ID,
        listener(|payload: serde_json::Value| async move {
            match serde_json::from_value::<UpdaterEvent>(payload) {
                Ok(UpdaterEvent::DownloadProgress {
                    bytes_downloaded,
                    bytes_total: Some(total),
                }) => println!("  {} / {} bytes", bytes_downloaded, total),
                Ok(UpdaterEvent::DownloadProgress {
                    bytes_downloaded, ..
                }) => println!("  {} bytes", bytes_downloaded),
                Ok(event) => println!("{:?}", event),
                Err(e) => log::warn!("[Updater] Unrecognized event: {}", e),
            }
            Ok(())
        }),
    );

    // Host side: the installer that can end this process
    provide_installer_api(transport.as_ref(), Arc::new(ProcessInstaller::default()));

    let transfer = Transfer::from_config(&config);
    let mut pipeline = UpdatePipeline::new(
        &config,
        Broadcaster::connect(transport.clone()),
        transfer.clone(),
        app_info.clone(),
        Arc::new(RemoteInstaller::connect(transport.clone())),
    );
    match UpdateLogger::new(&app_info.temp_dir().join("logs")) {
        Ok(logger) => pipeline = pipeline.with_logger(Arc::new(logger)),
        Err(e) => log::warn!("[Updater] Update log disabled: {}", e),
    }
    let resolver = ReleaseResolver::new(&config, transfer, app_info.clone());
    let feed_url = resolver.feed_url().to_string();
    let updater = Arc::new(Updater::from_parts(resolver, pipeline, app_info.clone()));
    provide_updater_api(transport.as_ref(), updater.clone());

    let remote = RemoteUpdater::connect(transport.clone());

    match mode {
        "--cleanup" => updater.pipeline().cleanup().await,
        "--check" | "--install" => {
            log::info!(
                "[Updater] Running {}, checking {}",
                app_info.current_version(),
                feed_url
            );
            let Some(update) = remote.get_latest_update().await? else {
                println!("No update available");
                return Ok(());
            };
            println!("Update available: {}", update.version);

            if mode == "--install" {
                remote.install_update(&update).await?;
            }
            Ok(())
        }
        other => {
            eprintln!("Unknown option: {}", other);
            eprintln!("Usage: d2rmm-updater [--check | --install | --cleanup | --save-config]");
            std::process::exit(2);
        }
    }
}
