// Server configuration

use crate::constants;
use crate::meta::MetaFailurePolicy;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Data directory holding `blobs/` and `entities.json`
    pub dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Recompute the SHA-256 of uploads and reject mismatching hashes
    pub verify_hashes: bool,
    pub meta_policy: MetaFailurePolicy,
    pub request_timeout: Duration,
    pub max_upload_size: usize,
    pub version: String,
}

impl ServerConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            host: constants::DEFAULT_HOST.to_string(),
            port: constants::DEFAULT_PORT,
            verify_hashes: false,
            meta_policy: MetaFailurePolicy::default(),
            request_timeout: Duration::from_secs(constants::DEFAULT_REQUEST_TIMEOUT_SECS),
            max_upload_size: constants::DEFAULT_MAX_UPLOAD_SIZE,
            version: constants::VERSION.to_string(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
