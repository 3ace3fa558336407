//! `DownloadTask`: owns one [`Plan`] end to end (spec §4.3). State machine,
//! bounded worker pool, per-task key cache, resume-across-restart, and the
//! merge handoff all live here.

use crate::config::Configuration;
use crate::error::ErrorKind;
use crate::events::{EventBus, TaskEventKind};
use crate::fetcher::{self, FetchOutcome, FetchRequest, PauseToken};
use crate::http::HttpContext;
use crate::merger;
use crate::model::{EncryptionMethod, Plan, Progress, Sample, Segment, SegmentState, TaskStatus};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

const SPEED_EWMA_FACTOR: f64 = 0.3;
const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// §3 invariant: a key is fetched exactly once per distinct key URI, owned
/// by the task (not global) to avoid cross-task trust leaks.
#[derive(Default)]
struct KeyCache {
    entries: Mutex<std::collections::HashMap<String, [u8; 16]>>,
}

impl KeyCache {
    /// The only key currently cached, if any. Playlists carry at most one
    /// active `#EXT-X-KEY` per segment run (spec §3), so a task never has
    /// more than one entry in practice; this avoids re-deriving the key URI
    /// at each segment dispatch.
    async fn any_cached(&self) -> Option<[u8; 16]> {
        self.entries.lock().await.values().next().copied()
    }

    async fn get_or_fetch(
        &self,
        http: &HttpContext,
        key_uri: &str,
        max_retries: u32,
        backoff_base: Duration,
        max_backoff: Duration,
    ) -> Result<[u8; 16], String> {
        {
            let entries = self.entries.lock().await;
            if let Some(key) = entries.get(key_uri) {
                return Ok(*key);
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match http.client.get(key_uri).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
                    if bytes.len() != crate::cipher::KEY_LEN {
                        return Err(format!(
                            "key file length error: expected {} bytes, got {}",
                            crate::cipher::KEY_LEN,
                            bytes.len()
                        ));
                    }
                    let mut key = [0u8; 16];
                    key.copy_from_slice(&bytes);
                    self.entries
                        .lock()
                        .await
                        .insert(key_uri.to_string(), key);
                    return Ok(key);
                }
                Ok(resp) if attempt < max_retries => {
                    let delay = backoff_delay(attempt, backoff_base, max_backoff);
                    tracing::warn!(status = %resp.status(), attempt, "key fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Ok(resp) => return Err(format!("key download failed: status {}", resp.status())),
                Err(e) if attempt < max_retries => {
                    let delay = backoff_delay(attempt, backoff_base, max_backoff);
                    tracing::warn!(error = %e, attempt, "key fetch connection error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(format!("key download connection error: {e}")),
            }
        }
    }
}

/// Exponential backoff with ±25% jitter, capped at `max_backoff` (spec
/// §4.3).
fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
    let jitter = 1.0 + rand::random::<f64>() * 0.5 - 0.25; // [0.75, 1.25)
    let secs = (exp * jitter).max(0.0);
    Duration::from_secs_f64(secs).min(max)
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedSegment {
    state: String,
    size: Option<u64>,
    attempt: u32,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedSnapshot {
    segment_state: BTreeMap<String, PersistedSegment>,
    version: u32,
}

pub struct Task {
    pub id: String,
    plan: Plan,
    config: Configuration,
    http: HttpContext,
    events: EventBus,
    status: Mutex<TaskStatus>,
    segments: Mutex<Vec<Segment>>,
    key_cache: KeyCache,
    cancel: CancellationToken,
    pause: PauseToken,
    resume_notify: Notify,
    staging_dir: PathBuf,
    downloaded_bytes: AtomicU64,
    speed_ewma: Mutex<f64>,
}

impl Task {
    pub fn new(id: String, plan: Plan, config: Configuration, http: HttpContext, events: EventBus) -> Arc<Self> {
        let output_dir = plan
            .output_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let staging_dir = output_dir.join(".vidtanium").join(&id);
        let segments = plan.segments.clone();
        Arc::new(Task {
            id,
            plan,
            config,
            http,
            events,
            status: Mutex::new(TaskStatus::Created),
            segments: Mutex::new(segments),
            key_cache: KeyCache::default(),
            cancel: CancellationToken::new(),
            pause: PauseToken::new(),
            resume_notify: Notify::new(),
            staging_dir,
            downloaded_bytes: AtomicU64::new(0),
            speed_ewma: Mutex::new(0.0),
        })
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    async fn transition(&self, to: TaskStatus) {
        let from = {
            let mut status = self.status.lock().await;
            let from = *status;
            *status = to;
            from
        };
        if from != to {
            tracing::info!(task_id = %self.id, ?from, ?to, "task status changed");
            self.events
                .publish(self.id.clone(), TaskEventKind::StatusChanged { from, to });
        }
    }

    pub async fn status(&self) -> TaskStatus {
        *self.status.lock().await
    }

    /// Called by `TaskManager` once admitted from Queued. Drives the task
    /// to a terminal state; never panics out of the caller's task.
    pub async fn run(self: Arc<Self>) {
        if self.status().await.is_terminal() {
            return;
        }
        self.transition(TaskStatus::Running).await;

        if let Err(reason) = tokio::fs::create_dir_all(&self.staging_dir).await {
            self.finish_failed(0, ErrorKind::Disk, reason.to_string())
                .await;
            return;
        }

        if self.plan.encryption.method == EncryptionMethod::Aes128Cbc {
            if let Some(key_uri) = self.plan.encryption.key_uri.clone() {
                if let Err(reason) = self
                    .key_cache
                    .get_or_fetch(
                        &self.http,
                        &key_uri,
                        self.config.max_retries,
                        self.config.backoff_base,
                        self.config.max_backoff,
                    )
                    .await
                {
                    self.finish_failed(0, ErrorKind::Crypto, reason).await;
                    return;
                }
            }
        }

        self.scan_and_resume().await;

        let sampler = tokio::spawn(Self::progress_sampler(self.clone()));
        let outcome = self.dispatch_loop().await;
        sampler.abort();

        match outcome {
            DispatchOutcome::Canceled => {
                self.cleanup_staging(false).await;
                self.transition(TaskStatus::Canceled).await;
            }
            DispatchOutcome::Failed(index, kind, reason) => {
                self.finish_failed(index, kind, reason).await;
            }
            DispatchOutcome::AllDone => {
                self.finish_merge().await;
            }
        }
    }

    async fn finish_failed(&self, index: usize, kind: ErrorKind, reason: String) {
        tracing::error!(task_id = %self.id, index, %kind, %reason, "task failed");
        self.events.publish(
            self.id.clone(),
            TaskEventKind::Failed {
                index,
                kind,
                reason,
            },
        );
        if !self.config.retain_staging_on_failure {
            self.cleanup_staging(true).await;
        }
        self.transition(TaskStatus::Failed).await;
    }

    async fn finish_merge(&self) {
        let segments = self.segments.lock().await.clone();
        let mut ordered: Vec<PathBuf> = Vec::with_capacity(segments.len());
        for seg in &segments {
            if let Some(path) = &seg.staging_path {
                ordered.push(path.clone());
            }
        }
        let total_bytes: u64 = segments.iter().filter_map(|s| s.size).sum();
        let timeout = self.config.merge_timeout_for(total_bytes);

        match merger::merge(
            &ordered,
            &self.plan.output_path,
            self.config.prefer_transcoder,
            self.config.ffmpeg_path.as_deref(),
            timeout,
        )
        .await
        {
            Ok(()) => {
                self.cleanup_staging(false).await;
                self.events.publish(self.id.clone(), TaskEventKind::Completed);
                self.transition(TaskStatus::Completed).await;
            }
            Err(e) => {
                self.finish_failed(segments.len(), ErrorKind::Merge, e.to_string())
                    .await;
            }
        }
    }

    pub fn pause(&self) {
        self.pause.set(true);
    }

    pub fn resume(&self) {
        self.pause.set(false);
        self.resume_notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        self.resume_notify.notify_waiters();
    }

    pub async fn snapshot(&self) -> crate::model::TaskSnapshot {
        let status = self.status().await;
        let segments = self.segments.lock().await;
        let completed_segments = segments.iter().filter(|s| s.is_done()).count();
        let downloaded_bytes = self.downloaded_bytes.load(Ordering::Relaxed);
        let speed = *self.speed_ewma.lock().await;
        let total_segments = segments.len();
        let remaining = total_segments.saturating_sub(completed_segments);
        let eta_seconds = if speed > 1.0 && total_segments > 0 {
            let avg_bytes_per_segment = if completed_segments > 0 {
                downloaded_bytes as f64 / completed_segments as f64
            } else {
                0.0
            };
            Some((remaining as f64 * avg_bytes_per_segment) / speed.max(1.0))
        } else {
            None
        };
        let failure_reason = segments.iter().find_map(|s| match &s.state {
            SegmentState::Failed(reason) => {
                Some((s.index, ErrorKind::TransientNetwork, reason.clone()))
            }
            _ => None,
        });
        crate::model::TaskSnapshot {
            task_id: self.id.clone(),
            display_name: self.plan.display_name.clone(),
            status,
            progress: Progress {
                completed_segments,
                total_segments,
                downloaded_bytes,
                total_bytes_estimate: None,
                speed_bps_ewma: speed,
                eta_seconds,
            },
            failure_reason,
        }
    }

    /// Indices with state `Pending`, in ascending order, skipping any
    /// already dispatched. Segments can fall back to `Pending` after a
    /// pause interrupts an in-flight fetch, so dispatch always rescans
    /// rather than tracking a monotonic cursor (spec §4.3: "segments
    /// interrupted by pause are retried, not skipped").
    async fn next_pending(&self, dispatched: &std::collections::HashSet<usize>) -> Option<usize> {
        let segments = self.segments.lock().await;
        segments
            .iter()
            .find(|s| matches!(s.state, SegmentState::Pending) && !dispatched.contains(&s.index))
            .map(|s| s.index)
    }

    async fn all_done(&self) -> bool {
        self.segments.lock().await.iter().all(|s| s.is_done())
    }

    async fn dispatch_loop(self: &Arc<Self>) -> DispatchOutcome {
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers_per_task.max(1)));
        let mut inflight = FuturesUnordered::new();
        let mut dispatched: std::collections::HashSet<usize> = std::collections::HashSet::new();

        loop {
            if self.cancel.is_cancelled() && inflight.is_empty() {
                return DispatchOutcome::Canceled;
            }

            if self.pause.is_paused() && inflight.is_empty() && !self.cancel.is_cancelled() {
                self.transition(TaskStatus::Paused).await;
                self.resume_notify.notified().await;
                if self.cancel.is_cancelled() {
                    return DispatchOutcome::Canceled;
                }
                self.transition(TaskStatus::Running).await;
            }

            while inflight.len() < self.config.max_workers_per_task.max(1)
                && !self.pause.is_paused()
                && !self.cancel.is_cancelled()
            {
                let Some(idx) = self.next_pending(&dispatched).await else {
                    break;
                };
                dispatched.insert(idx);
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                let task = self.clone();
                inflight.push(tokio::spawn(async move {
                    let _permit = permit;
                    (idx, task.run_segment(idx).await)
                }));
            }

            if inflight.is_empty() {
                if self.cancel.is_cancelled() {
                    return DispatchOutcome::Canceled;
                }
                if self.all_done().await {
                    return DispatchOutcome::AllDone;
                }
                if self.pause.is_paused() {
                    continue;
                }
                // No inflight work, not paused, not all done, and nothing
                // pending to dispatch: every remaining segment is a
                // just-reverted-to-Pending one still racing its state
                // write. Yield and rescan.
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                Some(joined) = inflight.next() => {
                    match joined {
                        Ok((idx, Ok(()))) => {
                            dispatched.remove(&idx);
                        }
                        Ok((_, Err((index, kind, reason)))) => {
                            return DispatchOutcome::Failed(index, kind, reason);
                        }
                        Err(join_err) => {
                            return DispatchOutcome::Failed(0, ErrorKind::Disk, format!("worker panicked: {join_err}"));
                        }
                    }
                }
                _ = self.resume_notify.notified() => {}
            }
        }
    }

    async fn run_segment(self: Arc<Self>, index: usize) -> Result<(), (usize, ErrorKind, String)> {
        loop {
            if self.pause.is_paused() || self.cancel.is_cancelled() {
                return Ok(());
            }

            let attempt = {
                let mut segments = self.segments.lock().await;
                segments[index].state = SegmentState::InFlight;
                segments[index].attempt += 1;
                segments[index].attempt
            };
            self.persist_snapshot().await;

            let (uri, key) = {
                let segments = self.segments.lock().await;
                let uri = segments[index].uri.clone();
                drop(segments);
                let key = if self.plan.encryption.method == EncryptionMethod::Aes128Cbc {
                    self.key_cache.any_cached().await
                } else {
                    None
                };
                (uri, key)
            };

            let outcome = fetcher::fetch(
                &self.http,
                FetchRequest {
                    index,
                    uri: &uri,
                    encryption: &self.plan.encryption,
                    key,
                    sequence_base: self.plan.sequence_base,
                    staging_dir: &self.staging_dir,
                    cancel: &self.cancel,
                    pause: &self.pause,
                },
            )
            .await;

            match outcome {
                Ok(FetchOutcome::Paused) => {
                    let mut segments = self.segments.lock().await;
                    segments[index].state = SegmentState::Pending;
                    return Ok(());
                }
                Ok(FetchOutcome::Ok { bytes_written }) => {
                    let mut segments = self.segments.lock().await;
                    segments[index].state = SegmentState::Done;
                    segments[index].size = Some(bytes_written);
                    segments[index].staging_path =
                        Some(fetcher::final_staging_path(&self.staging_dir, index));
                    drop(segments);
                    self.downloaded_bytes
                        .fetch_add(bytes_written, Ordering::Relaxed);
                    self.persist_snapshot().await;
                    self.events.publish(
                        self.id.clone(),
                        TaskEventKind::Progress(self.current_progress().await),
                    );
                    return Ok(());
                }
                Err(crate::error::FetchError::Terminal { kind, reason }) => {
                    let mut segments = self.segments.lock().await;
                    segments[index].state = SegmentState::Failed(reason.clone());
                    drop(segments);
                    self.persist_snapshot().await;
                    return Err((index, kind, reason));
                }
                Err(crate::error::FetchError::Retryable(reason)) => {
                    if attempt >= self.config.max_retries {
                        let mut segments = self.segments.lock().await;
                        segments[index].state = SegmentState::Failed(reason.clone());
                        drop(segments);
                        self.persist_snapshot().await;
                        return Err((index, ErrorKind::TransientNetwork, reason));
                    }
                    let delay = backoff_delay(attempt, self.config.backoff_base, self.config.max_backoff);
                    tracing::warn!(task_id = %self.id, index, attempt, ?delay, %reason, "segment fetch retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn current_progress(&self) -> Progress {
        let segments = self.segments.lock().await;
        let completed_segments = segments.iter().filter(|s| s.is_done()).count();
        let total_segments = segments.len();
        drop(segments);
        Progress {
            completed_segments,
            total_segments,
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            total_bytes_estimate: None,
            speed_bps_ewma: *self.speed_ewma.lock().await,
            eta_seconds: None,
        }
    }

    /// Samples `downloaded_bytes` once a second and folds it into an EWMA
    /// with factor 0.3 (spec §4.3), publishing a progress event each tick.
    async fn progress_sampler(self: Arc<Self>) {
        let mut last = Sample {
            at: Instant::now(),
            bytes: self.downloaded_bytes.load(Ordering::Relaxed),
        };
        loop {
            tokio::time::sleep(SPEED_SAMPLE_INTERVAL).await;
            let now = Sample {
                at: Instant::now(),
                bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            };
            let elapsed = now.at.duration_since(last.at).as_secs_f64().max(0.001);
            let delta = now.bytes.saturating_sub(last.bytes) as f64;
            let instantaneous = delta / elapsed;
            {
                let mut ewma = self.speed_ewma.lock().await;
                *ewma = SPEED_EWMA_FACTOR * instantaneous + (1.0 - SPEED_EWMA_FACTOR) * *ewma;
            }
            last = now;
            self.events.publish(
                self.id.clone(),
                TaskEventKind::Progress(self.current_progress().await),
            );
        }
    }

    /// Scan the staging directory at Running entry (spec §4.3
    /// resume-across-restart): any staging file whose size matches the
    /// persisted snapshot's recorded Done size is reused without refetch.
    async fn scan_and_resume(&self) {
        let snapshot_path = self.staging_dir.join("snapshot.json");
        let Ok(text) = tokio::fs::read_to_string(&snapshot_path).await else {
            return;
        };
        let Ok(persisted) = serde_json::from_str::<PersistedSnapshot>(&text) else {
            return;
        };

        let mut segments = self.segments.lock().await;
        for segment in segments.iter_mut() {
            let Some(record) = persisted.segment_state.get(&segment.index.to_string()) else {
                continue;
            };
            if record.state != "Done" {
                continue;
            }
            let path = fetcher::final_staging_path(&self.staging_dir, segment.index);
            let Ok(meta) = tokio::fs::metadata(&path).await else {
                continue;
            };
            let on_disk_size = meta.len();
            if record.size.map(|s| s <= on_disk_size).unwrap_or(true) {
                segment.state = SegmentState::Done;
                segment.size = Some(on_disk_size);
                segment.staging_path = Some(path);
                self.downloaded_bytes.fetch_add(on_disk_size, Ordering::Relaxed);
            }
        }
    }

    async fn persist_snapshot(&self) {
        let segments = self.segments.lock().await;
        let mut segment_state = BTreeMap::new();
        for segment in segments.iter() {
            let state = match &segment.state {
                SegmentState::Pending => "Pending".to_string(),
                SegmentState::InFlight => "InFlight".to_string(),
                SegmentState::Done => "Done".to_string(),
                SegmentState::Failed(_) => "Failed".to_string(),
            };
            segment_state.insert(
                segment.index.to_string(),
                PersistedSegment {
                    state,
                    size: segment.size,
                    attempt: segment.attempt,
                },
            );
        }
        drop(segments);
        let persisted = PersistedSnapshot {
            segment_state,
            version: 1,
        };
        let Ok(json) = serde_json::to_string_pretty(&persisted) else {
            return;
        };
        let final_path = self.staging_dir.join("snapshot.json");
        let tmp_path = self.staging_dir.join("snapshot.json.tmp");
        if tokio::fs::write(&tmp_path, json).await.is_ok() {
            let _ = tokio::fs::rename(&tmp_path, &final_path).await;
        }
    }

    async fn cleanup_staging(&self, is_failure: bool) {
        if is_failure && self.config.retain_staging_on_failure {
            return;
        }
        let _ = tokio::fs::remove_dir_all(&self.staging_dir).await;
    }
}

enum DispatchOutcome {
    AllDone,
    Canceled,
    Failed(usize, ErrorKind, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::events::EventBus;
    use crate::model::EncryptionSpec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn plan_for(server_uri: &str, names: &[&str], output: PathBuf) -> Plan {
        let segments = names
            .iter()
            .enumerate()
            .map(|(i, n)| Segment::new(i, format!("{server_uri}/{n}")))
            .collect();
        Plan {
            display_name: "test".into(),
            segments,
            encryption: EncryptionSpec::none(),
            total_duration_secs: Some(30.0),
            is_live: false,
            output_path: output,
            sequence_base: 0,
        }
    }

    #[tokio::test]
    async fn completes_and_merges_unencrypted_segments() {
        let server = MockServer::start().await;
        for (name, body) in [("a.ts", "AAA"), ("b.ts", "BBB"), ("c.ts", "CCC")] {
            Mock::given(method("GET"))
                .and(path(format!("/{name}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(body.as_bytes().to_vec()))
                .mount(&server)
                .await;
        }

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.ts");
        let plan = plan_for(&server.uri(), &["a.ts", "b.ts", "c.ts"], output.clone());

        let config = Configuration::builder().prefer_transcoder(false).build();
        let http = HttpContext::new(&config);
        let events = EventBus::new();
        let sub = events.subscribe();

        let task = Task::new("task-1".into(), plan, config, http, events);
        task.clone().run().await;

        assert_eq!(task.status().await, TaskStatus::Completed);
        let contents = tokio::fs::read_to_string(&output).await.unwrap();
        assert_eq!(contents, "AAABBBCCC");

        let mut saw_completed = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), sub.recv()).await
        {
            if matches!(event.kind, TaskEventKind::Completed) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_retry_budget_and_fail_task() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"AAA".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b.ts"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/c.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"CCC".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.ts");
        let plan = plan_for(&server.uri(), &["a.ts", "b.ts", "c.ts"], output);

        let config = Configuration::builder()
            .max_retries(2)
            .build();
        let http = HttpContext::new(&config);
        let events = EventBus::new();

        let task = Task::new("task-2".into(), plan, config, http, events);
        task.clone().run().await;

        assert_eq!(task.status().await, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_before_run_short_circuits_to_canceled() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.ts");
        let plan = plan_for("https://example.invalid", &["a.ts"], output);
        let config = Configuration::default();
        let http = HttpContext::new(&config);
        let events = EventBus::new();

        let task = Task::new("task-3".into(), plan, config, http, events);
        task.cancel();
        task.clone().run().await;

        assert_eq!(task.status().await, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn zero_segment_plan_completes_immediately_with_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.ts");
        let plan = plan_for("https://example.invalid", &[], output.clone());
        let config = Configuration::builder().prefer_transcoder(false).build();
        let http = HttpContext::new(&config);
        let events = EventBus::new();

        let task = Task::new("task-4".into(), plan, config, http, events);
        task.clone().run().await;

        assert_eq!(task.status().await, TaskStatus::Completed);
        let contents = tokio::fs::read(&output).await.unwrap();
        assert!(contents.is_empty());
    }
}
