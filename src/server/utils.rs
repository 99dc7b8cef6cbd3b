// Utility functions shared by the handlers

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use percent_encoding::percent_decode_str;
use std::io::{self, Read};
use std::path::Path;

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Run blocking store or blob work off the async runtime
pub async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Blocking task failed")?
}

/// Stream a blocking reader as a response body, read on the blocking pool.
/// Reading stops early once the client goes away.
pub fn reader_body<R: Read + Send + 'static>(mut reader: R) -> Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<io::Result<Bytes>>(4);
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let chunk = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e),
            };
            let failed = chunk.is_err();
            if tx.blocking_send(chunk).is_err() || failed {
                break;
            }
        }
    });
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Body::from_stream(stream)
}

/// Percent-decode a request path; `None` if it does not decode to UTF-8
pub fn decode_path(path: &str) -> Option<String> {
    percent_decode_str(path)
        .decode_utf8()
        .ok()
        .map(|p| p.into_owned())
}

/// Content type for a file served out of an archive, by extension
pub fn content_type_for(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("xml") => "text/xml; charset=utf-8",
        Some("yaml") | Some("yml") => "application/x-yaml",
        Some("md") | Some("txt") | Some("rst") => "text/plain; charset=utf-8",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Parse duration string (e.g., "60s", "5m", "1h") into Duration
pub fn parse_duration(s: &str) -> anyhow::Result<tokio::time::Duration> {
    use tokio::time::Duration;

    let s = s.trim();
    if let Some(stripped) = s.strip_suffix('s') {
        let secs: u64 = stripped.parse().context("Invalid duration format")?;
        Ok(Duration::from_secs(secs))
    } else if let Some(stripped) = s.strip_suffix('m') {
        let mins: u64 = stripped.parse().context("Invalid duration format")?;
        Ok(Duration::from_secs(mins * 60))
    } else if let Some(stripped) = s.strip_suffix('h') {
        let hours: u64 = stripped.parse().context("Invalid duration format")?;
        Ok(Duration::from_secs(hours * 3600))
    } else {
        // Plain number of seconds
        let secs: u64 = s.parse().context("Invalid duration format")?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 45 ").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_decode_path() {
        assert_eq!(
            decode_path("/precise/wordpress-0/archive/my%20file.txt").as_deref(),
            Some("/precise/wordpress-0/archive/my file.txt")
        );
        assert_eq!(
            decode_path("/wordpress/meta/extra-info/caf%C3%A9").as_deref(),
            Some("/wordpress/meta/extra-info/café")
        );
        assert_eq!(decode_path("/plain/path").as_deref(), Some("/plain/path"));
        assert_eq!(decode_path("/bad/%FF%FE"), None);
    }

    #[tokio::test]
    async fn test_reader_body_streams_everything() {
        let data: Vec<u8> = (0..STREAM_CHUNK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        let body = reader_body(io::Cursor::new(data.clone()));
        let collected = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(collected.as_ref(), &data[..]);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("icon.svg"), "image/svg+xml");
        assert_eq!(content_type_for("docs/README.MD"), "text/plain; charset=utf-8");
        assert_eq!(content_type_for("hooks/install"), "application/octet-stream");
    }
}
