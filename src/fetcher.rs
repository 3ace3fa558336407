//! Fetch, decrypt and stage a single segment (spec §4.4). Performs exactly
//! one attempt; `DownloadTask` owns the retry loop (spec §4.3).

use crate::cipher;
use crate::error::{ErrorKind, FetchError};
use crate::http::HttpContext;
use crate::model::{EncryptionMethod, EncryptionSpec};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// A resettable pause flag (unlike `CancellationToken`, which is one-shot).
/// Shared between a `Task`'s dispatch loop and every in-flight fetch.
#[derive(Clone, Default)]
pub struct PauseToken(Arc<AtomicBool>);

impl PauseToken {
    pub fn new() -> Self {
        PauseToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self, paused: bool) {
        self.0.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// HTTP statuses the retry policy treats as retryable (spec §4.3).
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(
            status.as_u16(),
            408 /* Request Timeout */ | 425 /* Too Early */ | 429 /* Too Many Requests */
        )
}

#[derive(Debug)]
pub enum FetchOutcome {
    Ok { bytes_written: u64 },
    Paused,
}

/// Shared per-segment fetch parameters. `key` is resolved once by the
/// owning task's key cache and handed down here; the fetcher never fetches
/// keys itself.
pub struct FetchRequest<'a> {
    pub index: usize,
    pub uri: &'a str,
    pub encryption: &'a EncryptionSpec,
    pub key: Option<[u8; 16]>,
    pub sequence_base: u64,
    pub staging_dir: &'a Path,
    pub cancel: &'a CancellationToken,
    pub pause: &'a PauseToken,
}

fn terminal(kind: ErrorKind, reason: &str) -> FetchError {
    FetchError::Terminal {
        kind,
        reason: reason.to_string(),
    }
}

fn staging_paths(staging_dir: &Path, index: usize) -> (PathBuf, PathBuf) {
    let part = staging_dir.join(format!("seg_{index:06}.part"));
    let done = staging_dir.join(format!("seg_{index:06}.ts"));
    (part, done)
}

pub fn final_staging_path(staging_dir: &Path, index: usize) -> PathBuf {
    staging_paths(staging_dir, index).1
}

/// Perform one fetch attempt. Honors `pause` (returns `Paused` without
/// writing anything) and `cancel` (returns `Terminal` after removing any
/// partial `.part` file) at each suspension point.
pub async fn fetch(
    http: &HttpContext,
    req: FetchRequest<'_>,
) -> Result<FetchOutcome, FetchError> {
    if req.pause.is_paused() {
        return Ok(FetchOutcome::Paused);
    }
    if req.cancel.is_cancelled() {
        return Err(terminal(ErrorKind::Disk, "canceled before dispatch"));
    }

    let (part_path, final_path) = staging_paths(req.staging_dir, req.index);

    let send = http.client.get(req.uri);
    let response = tokio::select! {
        biased;
        _ = req.cancel.cancelled() => {
            return Err(terminal(ErrorKind::Disk, "canceled"));
        }
        result = send.send() => result,
    };

    let response = match response {
        Ok(r) => r,
        Err(e) if e.is_timeout() || e.is_connect() => {
            return Err(FetchError::Retryable(format!("connection error: {e}")));
        }
        Err(e) => return Err(FetchError::Retryable(format!("request error: {e}"))),
    };

    let status = response.status();
    if !status.is_success() {
        return if is_retryable_status(status) {
            Err(FetchError::Retryable(format!("http {status}")))
        } else {
            Err(terminal(ErrorKind::PermanentNetwork, &format!("http {status}")))
        };
    }

    let body = tokio::select! {
        biased;
        _ = req.cancel.cancelled() => {
            return Err(terminal(ErrorKind::Disk, "canceled mid-read"));
        }
        result = response.bytes() => result,
    };
    let body = match body {
        Ok(b) => b,
        Err(e) => return Err(FetchError::Retryable(format!("partial read: {e}"))),
    };

    let plaintext: Arc<[u8]> = if req.encryption.method == EncryptionMethod::Aes128Cbc {
        let key = match req.key {
            Some(k) => k,
            None => return Err(terminal(ErrorKind::Crypto, "missing decryption key")),
        };
        let iv = req.encryption.iv_for(req.index, req.sequence_base);
        Arc::from(cipher::decrypt(&body, &key, &iv, true))
    } else {
        Arc::from(body.as_ref())
    };

    if req.cancel.is_cancelled() {
        return Err(terminal(ErrorKind::Disk, "canceled before write"));
    }

    let mut file = tokio::fs::File::create(&part_path)
        .await
        .map_err(|e| terminal(ErrorKind::Disk, &format!("creating staging file: {e}")))?;
    file.write_all(&plaintext)
        .await
        .map_err(|e| terminal(ErrorKind::Disk, &format!("writing staging file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| terminal(ErrorKind::Disk, &format!("fsyncing staging file: {e}")))?;
    drop(file);
    tokio::fs::rename(&part_path, &final_path)
        .await
        .map_err(|e| terminal(ErrorKind::Disk, &format!("renaming staging file: {e}")))?;

    Ok(FetchOutcome::Ok {
        bytes_written: plaintext.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::model::EncryptionSpec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_and_stages_unencrypted_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"AAA".to_vec()))
            .mount(&server)
            .await;

        let http = HttpContext::new(&Configuration::default());
        let dir = tempfile::tempdir().unwrap();
        let encryption = EncryptionSpec::none();
        let cancel = CancellationToken::new();
        let pause = PauseToken::new();

        let uri = format!("{}/a.ts", server.uri());
        let outcome = fetch(
            &http,
            FetchRequest {
                index: 0,
                uri: &uri,
                encryption: &encryption,
                key: None,
                sequence_base: 0,
                staging_dir: dir.path(),
                cancel: &cancel,
                pause: &pause,
            },
        )
        .await
        .unwrap();

        match outcome {
            FetchOutcome::Ok { bytes_written } => assert_eq!(bytes_written, 3),
            FetchOutcome::Paused => panic!("expected Ok"),
        }
        let contents = tokio::fs::read(final_staging_path(dir.path(), 0))
            .await
            .unwrap();
        assert_eq!(contents, b"AAA");
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.ts"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let http = HttpContext::new(&Configuration::default());
        let dir = tempfile::tempdir().unwrap();
        let encryption = EncryptionSpec::none();
        let cancel = CancellationToken::new();
        let pause = PauseToken::new();
        let uri = format!("{}/a.ts", server.uri());

        let err = fetch(
            &http,
            FetchRequest {
                index: 0,
                uri: &uri,
                encryption: &encryption,
                key: None,
                sequence_base: 0,
                staging_dir: dir.path(),
                cancel: &cancel,
                pause: &pause,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::Retryable(_)));
    }

    #[tokio::test]
    async fn not_found_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.ts"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let http = HttpContext::new(&Configuration::default());
        let dir = tempfile::tempdir().unwrap();
        let encryption = EncryptionSpec::none();
        let cancel = CancellationToken::new();
        let pause = PauseToken::new();
        let uri = format!("{}/a.ts", server.uri());

        let err = fetch(
            &http,
            FetchRequest {
                index: 0,
                uri: &uri,
                encryption: &encryption,
                key: None,
                sequence_base: 0,
                staging_dir: dir.path(),
                cancel: &cancel,
                pause: &pause,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::Terminal { .. }));
    }

    #[tokio::test]
    async fn paused_before_dispatch_writes_nothing() {
        let http = HttpContext::new(&Configuration::default());
        let dir = tempfile::tempdir().unwrap();
        let encryption = EncryptionSpec::none();
        let cancel = CancellationToken::new();
        let pause = PauseToken::new();
        pause.set(true);

        let outcome = fetch(
            &http,
            FetchRequest {
                index: 0,
                uri: "https://example.invalid/a.ts",
                encryption: &encryption,
                key: None,
                sequence_base: 0,
                staging_dir: dir.path(),
                cancel: &cancel,
                pause: &pause,
            },
        )
        .await
        .unwrap();
        assert!(matches!(outcome, FetchOutcome::Paused));
        assert!(!final_staging_path(dir.path(), 0).exists());
    }
}
