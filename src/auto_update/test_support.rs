// Shared fixtures for the auto_update tests: a local HTTP server and
// in-memory zip packages

use axum::body::Body;
use axum::Router;
use std::io::Write;
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Local HTTP server, stopped on drop
pub struct FixtureServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl FixtureServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serve `router` on an ephemeral localhost port
pub async fn serve(router: Router) -> FixtureServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    FixtureServer { addr, handle }
}

/// URL on a localhost port nothing listens on
pub fn closed_port_url(path: &str) -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}{}", addr, path)
}

/// Body streamed without a Content-Length header
pub fn chunked_body(chunks: Vec<Vec<u8>>) -> Body {
    Body::from_stream(futures_util::stream::iter(
        chunks.into_iter().map(Ok::<_, std::io::Error>),
    ))
}

/// Build a zip in memory; names ending in `/` become directories
pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, contents) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
    }

    writer.finish().unwrap().into_inner()
}
