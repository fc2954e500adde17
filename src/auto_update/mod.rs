// Auto-Update System Module
// Self-update of the mod manager:
// - Release check against the public release feed
// - Download, unpack and handoff to a script that swaps the install and relaunches
// - Progress reported to the UI process through the event bus

mod types;
mod config;
mod ipc;
mod event_bus;
mod transfer;
mod release;
mod app_info;
mod archive;
mod handoff;
mod installer;
mod logger;
mod pipeline;
mod service;

#[cfg(test)]
mod test_support;

// Re-export core types for external use
pub use types::{
    PipelineStage,
    PipelineState,
    ReleaseInfo,
    UpdateError,
    UpdateTarget,
    UpdaterEvent,
    UPDATER_EVENT_ID,
};

// Re-export config
pub use config::{
    get_config_path, load_config, load_config_from, save_config, save_config_to, UpdaterConfig,
    DEFAULT_FEED_URL,
};

// Re-export transport
pub use ipc::{consume, unknown_method, InProcessTransport, IpcTransport, RemoteProxy, RemoteService};

// Re-export event bus
pub use event_bus::{
    listener, BroadcastEvent, BroadcastHub, Broadcaster, Listener, ListenerFuture, ListenerId,
    BROADCAST_SERVICE,
};

// Re-export network transfer
pub use transfer::{
    BufferedDestination, DownloadProgress, FileDestination, ProgressCallback, Transfer,
    TransferDestination, TransferOptions,
};

// Re-export release resolver
pub use release::{
    compare_versions, is_newer, normalize_tag, parse_version, select_update, FeedAsset,
    FeedRelease, ReleaseResolver,
};

pub use app_info::{AppInfo, StaticAppInfo, SystemAppInfo};

// Re-export package decoder
pub use archive::{
    extract_archive, extract_archive_async, ExtractReport, PackagedResources,
    PACKAGED_RESOURCE_EXTENSIONS,
};

pub use handoff::{HandoffScript, ScriptFlavor};

// Re-export installer
pub use installer::{
    provide_installer_api, ExitHook, ProcessInstaller, RemoteInstaller, UpdateInstaller,
    INSTALLER_SERVICE,
};

pub use logger::{LogLevel, UpdateLogEntry, UpdateLogger};

// Re-export pipeline
pub use pipeline::{PipelineConfig, UpdatePipeline};

// Re-export updater service
pub use service::{provide_updater_api, RemoteUpdater, Updater, UPDATER_SERVICE};
