use anyhow::Result;
use charmstore::blobstore::hash_bytes;
use charmstore::runtime::ServerRuntime;
use charmstore::server::{build_state, serve, ServerConfig, ServerState};
use std::io::{Cursor, Write};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

#[allow(dead_code)]
pub struct TestServer {
    pub dir: TempDir,
    pub base_url: String,
    pub state: ServerState,
    pub client: reqwest::Client,
    runtime: ServerRuntime,
    handle: tokio::task::JoinHandle<Result<()>>,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn start() -> Result<Self> {
        Self::start_with(|_| {}).await
    }

    /// Start on an ephemeral port with a fresh data directory
    pub async fn start_with<F: FnOnce(&mut ServerConfig)>(configure: F) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let mut config = ServerConfig::new(dir.path());
        config.version = "test".to_string();
        configure(&mut config);

        let state = build_state(&config)?;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);

        let runtime = ServerRuntime::new();
        let serve_runtime = runtime.clone();
        let serve_state = state.clone();
        let handle = tokio::spawn(async move { serve(listener, serve_state, &serve_runtime, false).await });

        Ok(Self {
            dir,
            base_url,
            state,
            client: reqwest::Client::new(),
            runtime,
            handle,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POST (revision allocated by the store) or PUT (revision in `path`) an archive
    pub async fn upload(&self, method: reqwest::Method, path: &str, archive: &[u8]) -> Result<reqwest::Response> {
        let url = format!("{}?hash={}", self.url(path), hash_bytes(archive));
        Ok(self
            .client
            .request(method, url)
            .body(archive.to_vec())
            .send()
            .await?)
    }

    pub async fn get_json(&self, path: &str) -> Result<(reqwest::StatusCode, serde_json::Value)> {
        let res = self.client.get(self.url(path)).send().await?;
        let status = res.status();
        let body = res.json().await?;
        Ok((status, body))
    }

    pub async fn stop(self) -> Result<()> {
        self.runtime.trigger_shutdown();
        self.handle.await??;
        Ok(())
    }
}

/// Build an in-memory zip; every file is deflated
#[allow(dead_code)]
pub fn make_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, contents) in files {
        if name.ends_with('/') {
            writer.add_directory(name.trim_end_matches('/'), options).unwrap();
            continue;
        }
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[allow(dead_code)]
pub fn charm_archive(name: &str) -> Vec<u8> {
    let metadata = format!(
        "name: {}\nsummary: test charm\nprovides:\n  website:\n    interface: http\nrequires:\n  db:\n    interface: mysql\n",
        name
    );
    make_archive(&[
        ("metadata.yaml", metadata.as_str()),
        ("config.yaml", "options:\n  port:\n    type: int\n    default: 80\n"),
        ("README.md", "# Test charm\n"),
        ("icon.svg", "<svg xmlns=\"http://www.w3.org/2000/svg\"></svg>"),
        ("hooks/", ""),
        ("hooks/install", "#!/bin/sh\necho installed\n"),
    ])
}

#[allow(dead_code)]
pub fn bundle_archive() -> Vec<u8> {
    make_archive(&[
        (
            "bundle.yaml",
            "services:\n  wordpress:\n    charm: cs:precise/wordpress-3\n    num_units: 2\n  mysql:\n    charm: cs:~bob/precise/mysql\n    num_units: 1\n",
        ),
        ("README.md", "# Wiki bundle\n"),
    ])
}
