// Network Transfer Module
// Performs an HTTP(S) GET and streams the body into a pluggable destination,
// reporting progress as chunks arrive

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::auto_update::{UpdateError, UpdaterConfig};

/// Download progress information
#[derive(Debug, Clone, serde::Serialize)]
pub struct DownloadProgress {
    /// Bytes received so far
    pub bytes_downloaded: u64,
    /// Total bytes to receive, if the server sent a length
    pub total_bytes: Option<u64>,
    /// Progress as percentage (0.0 - 100.0); 0.0 while the total is unknown
    pub percentage: f32,
}

impl DownloadProgress {
    fn new(bytes_downloaded: u64, total_bytes: Option<u64>) -> Self {
        let percentage = match total_bytes {
            Some(total) if total > 0 => (bytes_downloaded as f32 / total as f32) * 100.0,
            _ => 0.0,
        };
        Self {
            bytes_downloaded,
            total_bytes,
            percentage,
        }
    }
}

/// Progress callback, awaited before the next chunk is read
pub type ProgressCallback =
    Box<dyn Fn(DownloadProgress) -> BoxFuture<'static, Result<(), UpdateError>> + Send + Sync>;

/// Optional knobs for a single transfer
#[derive(Default)]
pub struct TransferOptions {
    pub on_progress: Option<ProgressCallback>,
}

impl TransferOptions {
    pub fn with_progress(callback: ProgressCallback) -> Self {
        Self {
            on_progress: Some(callback),
        }
    }
}

/// Sink a transfer streams into
///
/// A destination serves exactly one transfer.
#[async_trait]
pub trait TransferDestination: Send {
    /// Append one received chunk
    async fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError>;

    /// Called once after the last chunk
    async fn finish(&mut self) -> Result<(), UpdateError>;
}

/// Accumulates the whole body in memory
#[derive(Debug, Default)]
pub struct BufferedDestination {
    buffer: Vec<u8>,
}

impl BufferedDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Body decoded as UTF-8
    pub fn text(&self) -> Result<&str, UpdateError> {
        std::str::from_utf8(&self.buffer)
            .map_err(|e| UpdateError::Decode(format!("Response is not valid UTF-8: {}", e)))
    }

    /// Body decoded as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, UpdateError> {
        serde_json::from_slice(&self.buffer)
            .map_err(|e| UpdateError::Decode(format!("Malformed JSON response: {}", e)))
    }
}

#[async_trait]
impl TransferDestination for BufferedDestination {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), UpdateError> {
        Ok(())
    }
}

/// Streams the body to a file
///
/// The file (and its parent directories) is created on the first write,
/// truncating anything already at the path. An empty body still leaves an
/// empty file behind.
#[derive(Debug)]
pub struct FileDestination {
    path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
}

impl FileDestination {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            bytes_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    async fn open(&mut self) -> Result<&mut File, UpdateError> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    UpdateError::FileSystem(format!("Failed to create directory: {}", e))
                })?;
            }
            let file = File::create(&self.path)
                .await
                .map_err(|e| UpdateError::FileSystem(format!("Failed to create file: {}", e)))?;
            self.file = Some(file);
        }

        self.file
            .as_mut()
            .ok_or_else(|| UpdateError::FileSystem("Destination file is not open".to_string()))
    }
}

#[async_trait]
impl TransferDestination for FileDestination {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError> {
        let file = self.open().await?;
        file.write_all(chunk)
            .await
            .map_err(|e| UpdateError::FileSystem(format!("Failed to write chunk: {}", e)))?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), UpdateError> {
        let file = self.open().await?;
        file.flush()
            .await
            .map_err(|e| UpdateError::FileSystem(format!("Failed to flush file: {}", e)))?;
        // Close the handle so the file can be read/removed right away
        self.file = None;
        Ok(())
    }
}

/// HTTP transfer client
///
/// Single attempt per call; retrying is up to the caller.
#[derive(Clone)]
pub struct Transfer {
    http_client: Client,
}

impl Default for Transfer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transfer {
    /// Create a Transfer with a default client
    pub fn new() -> Self {
        Self::from_config(&UpdaterConfig::default())
    }

    /// Create a Transfer honoring the user agent and timeouts in `config`
    pub fn from_config(config: &UpdaterConfig) -> Self {
        let mut builder = Client::builder().user_agent(config.user_agent.clone());
        if let Some(secs) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        Self {
            http_client: builder.build().unwrap_or_else(|e| {
                log::warn!("[Transfer] Failed to build HTTP client ({}), using defaults", e);
                Client::new()
            }),
        }
    }

    /// GET `url` and stream the body into `destination`
    ///
    /// # Returns
    /// * `Ok(D)` - The filled destination
    /// * `Err(UpdateError::Network)` - Connection/DNS failure or broken body stream
    /// * `Err(UpdateError::HttpStatus)` - Non-2xx response
    /// * `Err(UpdateError::FileSystem)` - Destination could not be written
    pub async fn transfer<D>(
        &self,
        url: &str,
        mut destination: D,
        options: TransferOptions,
    ) -> Result<D, UpdateError>
    where
        D: TransferDestination,
    {
        log::debug!("[Transfer] GET {}", url);

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::HttpStatus {
                status_code: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string(),
            });
        }

        let total_bytes = response.content_length();
        let mut bytes_downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result
                .map_err(|e| UpdateError::Network(format!("Failed to read chunk: {}", e)))?;

            destination.write(&chunk).await?;
            bytes_downloaded += chunk.len() as u64;

            if let Some(ref callback) = options.on_progress {
                callback(DownloadProgress::new(bytes_downloaded, total_bytes)).await?;
            }
        }

        destination.finish().await?;

        log::debug!(
            "[Transfer] Completed {} ({} bytes)",
            url,
            bytes_downloaded
        );

        Ok(destination)
    }

    /// GET `url` and decode the body as JSON
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, UpdateError> {
        let buffer = self
            .transfer(url, BufferedDestination::new(), TransferOptions::default())
            .await?;
        buffer.json()
    }
}

fn request_error(e: reqwest::Error) -> UpdateError {
    if e.is_connect() {
        UpdateError::Network(format!("Connection failed: {}", e))
    } else if e.is_timeout() {
        UpdateError::Network(format!("Request timed out: {}", e))
    } else {
        UpdateError::Network(format!("Request failed: {}", e))
    }
}
