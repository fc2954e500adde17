// Core types and enums for the self-update subsystem
// Error taxonomy, release/target records, pipeline states and bus payloads

use serde::{Deserialize, Serialize};

/// Event id every pipeline event is published under
pub const UPDATER_EVENT_ID: &str = "updater";

/// Pipeline stages in the order they run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PipelineStage {
    CleaningUp,
    Downloading,
    Extracting,
    Applying,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::CleaningUp => write!(f, "CleaningUp"),
            PipelineStage::Downloading => write!(f, "Downloading"),
            PipelineStage::Extracting => write!(f, "Extracting"),
            PipelineStage::Applying => write!(f, "Applying"),
        }
    }
}

/// Update states for the pipeline state machine
///
/// A run walks `Idle -> CleaningUp -> Downloading -> Extracting -> Applying ->
/// HandoffRequested` with no branches. A failing stage records `Failed` and
/// the run stops where it is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum PipelineState {
    /// No run in progress
    Idle,

    /// Removing leftovers of a previous run
    CleaningUp,

    /// Streaming the package to the archive path
    Downloading,

    /// Unpacking the archive into the extraction directory
    Extracting,

    /// Writing the handoff script and asking the installer to take over
    Applying,

    /// The installer accepted the handoff script
    HandoffRequested { script_path: String },

    /// A stage failed; the next run starts over from `CleaningUp`
    Failed { stage: PipelineStage, error: String },
}

impl Default for PipelineState {
    fn default() -> Self {
        PipelineState::Idle
    }
}

impl PipelineState {
    /// Stage this state belongs to, if it is one of the working states
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            PipelineState::CleaningUp => Some(PipelineStage::CleaningUp),
            PipelineState::Downloading => Some(PipelineStage::Downloading),
            PipelineState::Extracting => Some(PipelineStage::Extracting),
            PipelineState::Applying => Some(PipelineStage::Applying),
            _ => None,
        }
    }

    /// Whether a run is currently in one of its working stages
    pub fn is_running(&self) -> bool {
        self.stage().is_some()
    }
}

/// Latest release as read from the release feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseInfo {
    /// Normalized version (no leading `v`)
    pub version: String,

    /// Download URL of the selected package asset
    pub download_url: String,
}

/// What the pipeline installs; the subset of `ReleaseInfo` it consumes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateTarget {
    pub version: String,
    pub url: String,
}

impl From<ReleaseInfo> for UpdateTarget {
    fn from(info: ReleaseInfo) -> Self {
        Self {
            version: info.version,
            url: info.download_url,
        }
    }
}

/// Payload of events published under [`UPDATER_EVENT_ID`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum UpdaterEvent {
    Cleanup,
    Download,
    #[serde(rename_all = "camelCase")]
    DownloadProgress {
        bytes_downloaded: u64,
        /// `None` when the server sent no length
        bytes_total: Option<u64>,
    },
    Extract,
    Apply,
}

/// Error types for update operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "message")]
pub enum UpdateError {
    /// Request/transport failure (connection, DNS, broken stream)
    Network(String),

    /// Server answered with a non-success status
    HttpStatus { status_code: u16, message: String },

    /// Malformed structured payload
    Decode(String),

    /// Permissions, disk full, path collisions
    FileSystem(String),

    /// A newer release exists but carries no installable package
    NoAssetFound { version: String },

    /// Corrupt or unsupported update package
    PackageFormat(String),

    /// The request/response transport could not complete a call
    Transport(String),

    /// A bus listener failed while an event was being delivered
    Listener(String),

    /// Configuration file could not be read or written
    Config(String),

    /// Another pipeline run is already in flight
    Busy,

    /// Installing requires a packaged build
    NotPackaged,
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::Network(msg) => write!(f, "Network error: {}", msg),
            UpdateError::HttpStatus { status_code, message } => {
                write!(f, "HTTP error ({}): {}", status_code, message)
            }
            UpdateError::Decode(msg) => write!(f, "Decode error: {}", msg),
            UpdateError::FileSystem(msg) => write!(f, "File system error: {}", msg),
            UpdateError::NoAssetFound { version } => {
                write!(f, "Release {} has no installable package", version)
            }
            UpdateError::PackageFormat(msg) => write!(f, "Package format error: {}", msg),
            UpdateError::Transport(msg) => write!(f, "Transport error: {}", msg),
            UpdateError::Listener(msg) => write!(f, "Listener failed: {}", msg),
            UpdateError::Config(msg) => write!(f, "Configuration error: {}", msg),
            UpdateError::Busy => write!(f, "An update is already in progress"),
            UpdateError::NotPackaged => {
                write!(f, "Updates can only be installed from a packaged build")
            }
        }
    }
}

impl std::error::Error for UpdateError {}
