//! Acquisition orchestrator
//!
//! The [`Acquirer`] owns the worker pool and drives each submitted item through
//! its lifecycle:
//! - [`task`] - the per-item state machine (resolve, fetch, decrypt, transcode, finalize)
//! - [`registry`] - status snapshots, results and the event sink
//! - [`finalize`] - temporary files and atomic placement
//! - [`collaborators`] - path planning and tagging seams

mod collaborators;
mod finalize;
mod registry;
mod task;


pub use collaborators::{FlatPathPlanner, NoOpTagger, PathPlanner, Tagger};

use crate::config::{Config, TranscodeConfig};
use crate::error::{Error, Result};
use crate::fetch::{ChunkFetcher, HttpSegmentSource, SegmentSource};
use crate::limiter::NetworkLimiter;
use crate::manifest::{HttpManifestResolver, ManifestResolver};
use crate::retry::with_retry;
use crate::transcode::{FfmpegTranscoder, NoOpTranscoder, Transcoder};
use crate::types::{
    BatchSummary, Event, ItemDescriptor, LifecycleState, QualitySelection, TaskId, TaskResult,
    TaskStatus,
};
use chrono::Utc;
use registry::Registry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use task::TaskContext;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// External implementations the pipeline talks to
///
/// [`Collaborators::http`] wires up the real service; tests swap in fakes with
/// the `with_*` methods.
#[derive(Clone)]
pub struct Collaborators {
    /// Turns items into manifests
    pub resolver: Arc<dyn ManifestResolver>,
    /// Fetches segment bytes
    pub source: Arc<dyn SegmentSource>,
    /// Normalises lossless containers
    pub transcoder: Arc<dyn Transcoder>,
    /// Chooses destination paths
    pub planner: Arc<dyn PathPlanner>,
    /// Tags completed files
    pub tagger: Arc<dyn Tagger>,
}

impl Collaborators {
    /// Use `resolver` and `source` with the default transcoder, planner and tagger
    pub fn new(
        config: &Config,
        resolver: Arc<dyn ManifestResolver>,
        source: Arc<dyn SegmentSource>,
    ) -> Self {
        Self {
            resolver,
            source,
            transcoder: default_transcoder(&config.transcode),
            planner: Arc::new(FlatPathPlanner::new(config.download.download_dir.clone())),
            tagger: Arc::new(NoOpTagger),
        }
    }

    /// HTTP resolver and segment source sharing one [`NetworkLimiter`]
    pub fn http(config: &Config) -> Result<Self> {
        let limiter = NetworkLimiter::new(
            config.fetch.max_in_flight_requests,
            config.fetch.speed_limit_bps,
        );
        let resolver = HttpManifestResolver::new(config, limiter.clone())?;
        let source = HttpSegmentSource::new(config, limiter)?;
        Ok(Self::new(config, Arc::new(resolver), Arc::new(source)))
    }

    /// Replace the transcoder
    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    /// Replace the path planner
    pub fn with_planner(mut self, planner: Arc<dyn PathPlanner>) -> Self {
        self.planner = planner;
        self
    }

    /// Replace the tagger
    pub fn with_tagger(mut self, tagger: Arc<dyn Tagger>) -> Self {
        self.tagger = tagger;
        self
    }
}

/// Drop handles of tasks that already ended so a long-lived acquirer stays bounded
fn reap_finished(handles: &mut Vec<JoinHandle<()>>) {
    handles.retain(|handle| !handle.is_finished());
}

fn default_transcoder(config: &TranscodeConfig) -> Arc<dyn Transcoder> {
    let transcoder: Arc<dyn Transcoder> = match FfmpegTranscoder::from_config(config) {
        Some(ffmpeg) => Arc::new(ffmpeg),
        None => Arc::new(NoOpTranscoder),
    };
    tracing::info!(
        transcoder = transcoder.name(),
        enabled = config.enabled,
        "transcoder initialized"
    );
    transcoder
}

/// Worker pool state shared by every clone of an [`Acquirer`]
#[derive(Clone)]
pub(crate) struct PoolState {
    /// Item-level workers (`download.max_concurrent_items`)
    pub(crate) items: Arc<Semaphore>,
    /// Transcoder slots, separate so CPU work never holds fetch capacity
    pub(crate) transcodes: Arc<Semaphore>,
    /// Parent of every task's cancellation token
    pub(crate) root_cancel: CancellationToken,
    /// Cleared by shutdown and by fatal errors
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Handles of tasks still running; finished ones are reaped on submit
    pub(crate) handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
}

/// Acquisition pipeline (cloneable - all fields are Arc-wrapped)
///
/// # Example
///
/// ```no_run
/// use tidal_dl::{Acquirer, Collaborators, Config, ItemDescriptor};
///
/// # async fn example() -> tidal_dl::Result<()> {
/// let config = Config::default();
/// let acquirer = Acquirer::new(config.clone(), Collaborators::http(&config)?).await?;
///
/// let id = acquirer.submit_default(ItemDescriptor::track("77646168")).await?;
/// let result = acquirer.wait(id).await;
/// println!("{result:?}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Acquirer {
    pub(crate) config: Arc<Config>,
    pub(crate) resolver: Arc<dyn ManifestResolver>,
    pub(crate) fetcher: ChunkFetcher,
    pub(crate) transcoder: Arc<dyn Transcoder>,
    pub(crate) planner: Arc<dyn PathPlanner>,
    pub(crate) tagger: Arc<dyn Tagger>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) pool: PoolState,
}

impl Acquirer {
    /// Create an acquirer
    ///
    /// Validates `config` and creates the download directory. A directory that
    /// cannot be created is reported as [`Error::DestinationUnwritable`].
    pub async fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let download_dir = &config.download.download_dir;
        tokio::fs::create_dir_all(download_dir)
            .await
            .map_err(|e| Error::from_destination_io(download_dir, e))?;

        let fetcher = ChunkFetcher::new(
            collaborators.source,
            config.retry.segment.clone(),
            config.fetch.segment_concurrency,
            config.fetch.request_timeout,
        );

        let pool = PoolState {
            items: Arc::new(Semaphore::new(config.download.max_concurrent_items)),
            transcodes: Arc::new(Semaphore::new(config.transcode.max_concurrent)),
            root_cancel: CancellationToken::new(),
            accepting_new: Arc::new(AtomicBool::new(true)),
            handles: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        };

        tracing::info!(
            download_dir = %download_dir.display(),
            max_concurrent_items = config.download.max_concurrent_items,
            segment_concurrency = config.fetch.segment_concurrency,
            "acquirer initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            resolver: collaborators.resolver,
            fetcher,
            transcoder: collaborators.transcoder,
            planner: collaborators.planner,
            tagger: collaborators.tagger,
            registry: Arc::new(Registry::new()),
            pool,
        })
    }

    /// Get the configuration in use
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Subscribe to lifecycle events
    ///
    /// Each subscriber sees every event emitted after it subscribed. A
    /// subscriber that falls more than 1000 events behind receives
    /// `RecvError::Lagged` and skips ahead.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.registry.subscribe()
    }

    /// Queue a Track or Video at `quality`
    ///
    /// The returned [`TaskId`] is the handle for [`status`](Self::status),
    /// [`cancel`](Self::cancel) and [`wait`](Self::wait). Fails with
    /// [`Error::ShuttingDown`] once [`shutdown`](Self::shutdown) has been called.
    pub async fn submit(
        &self,
        descriptor: ItemDescriptor,
        quality: QualitySelection,
    ) -> Result<TaskId> {
        if !self.pool.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if !descriptor.kind.is_media() {
            return Err(Error::InvalidIdentifier(format!(
                "{descriptor} is a collection; use submit_collection"
            )));
        }
        if !quality.applies_to(descriptor.kind) {
            return Err(Error::InvalidIdentifier(format!(
                "quality {quality} does not apply to {descriptor}"
            )));
        }

        let id = TaskId(self.pool.next_id.fetch_add(1, Ordering::SeqCst));
        let cancel = self.pool.root_cancel.child_token();
        let status = TaskStatus {
            id,
            descriptor: descriptor.clone(),
            requested_quality: quality,
            quality,
            state: LifecycleState::Pending,
            manifests_resolved: 0,
            bytes_fetched: 0,
            total_bytes: None,
            segments_done: 0,
            segments_total: 0,
            segment_retries: BTreeMap::new(),
            destination: None,
            submitted_at: Utc::now(),
            finished_at: None,
        };
        self.registry.insert(status, cancel.clone()).await;
        self.registry.emit(Event::Submitted {
            id,
            descriptor: descriptor.clone(),
        });
        tracing::info!(task_id = id.get(), item = %descriptor, %quality, "item submitted");

        let ctx = TaskContext::new(id, descriptor, quality, cancel, self.clone());
        let handle = tokio::spawn(task::run_task(ctx));
        let mut handles = self.pool.handles.lock().await;
        reap_finished(&mut handles);
        handles.push(handle);
        Ok(id)
    }

    /// Queue an item at the configured default quality for its kind
    pub async fn submit_default(&self, descriptor: ItemDescriptor) -> Result<TaskId> {
        let quality = self.config.default_quality(descriptor.kind).ok_or_else(|| {
            Error::InvalidIdentifier(format!(
                "{descriptor} is a collection; use submit_collection"
            ))
        })?;
        self.submit(descriptor, quality).await
    }

    /// Expand an album, playlist or artist and queue every item in it
    ///
    /// Items use the configured default quality for their kind. Media
    /// descriptors are queued as-is.
    pub async fn submit_collection(&self, descriptor: ItemDescriptor) -> Result<Vec<TaskId>> {
        if !self.pool.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let expand = with_retry(
            &self.config.retry.resolve,
            || self.resolver.expand(&descriptor),
            |retry, e| {
                tracing::debug!(item = %descriptor, retry, error = %e, "retrying expansion")
            },
        );
        let items = tokio::select! {
            biased;
            _ = self.pool.root_cancel.cancelled() => return Err(Error::Cancelled),
            items = expand => items.map_err(|exhausted| exhausted.error)?,
        };
        tracing::info!(item = %descriptor, items = items.len(), "collection expanded");

        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let Some(quality) = self.config.default_quality(item.kind) else {
                tracing::warn!(item = %item, "expansion returned a collection, skipping");
                continue;
            };
            ids.push(self.submit(item, quality).await?);
        }
        Ok(ids)
    }

    /// Snapshot of one task
    pub async fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.registry.status(id).await
    }

    /// Snapshots of every task in submission order
    pub async fn statuses(&self) -> Vec<TaskStatus> {
        self.registry.statuses().await
    }

    /// Cancel a task
    ///
    /// In-flight requests are abandoned and temporary files removed; the task
    /// ends as `Failed` with error kind `cancelled`. Cancelling a finished task
    /// does nothing.
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        let token = self
            .registry
            .cancel_token(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("task {id} not found")))?;
        token.cancel();
        tracing::info!(task_id = id.get(), "task cancelled");
        Ok(())
    }

    /// Stop accepting items, cancel everything in flight and wait for tasks to unwind
    pub async fn shutdown(&self) {
        tracing::info!("initiating shutdown");
        self.pool.accepting_new.store(false, Ordering::SeqCst);
        self.registry.emit(Event::Shutdown);
        self.pool.root_cancel.cancel();
        self.join_all().await;
        tracing::info!("shutdown complete");
    }

    /// Wait for a task's terminal result; `None` if the id is unknown
    pub async fn wait(&self, id: TaskId) -> Option<TaskResult> {
        self.registry.wait(id).await
    }

    /// Wait for every submitted task, including tagging, and summarise
    pub async fn wait_all(&self) -> BatchSummary {
        self.join_all().await;
        BatchSummary::from_results(self.registry.results().await)
    }

    /// Results of finished tasks in submission order
    pub async fn results(&self) -> Vec<TaskResult> {
        self.registry.results().await
    }

    /// Whether shutdown or a fatal error has stopped the pipeline
    pub fn is_shutting_down(&self) -> bool {
        !self.pool.accepting_new.load(Ordering::SeqCst)
    }

    async fn join_all(&self) {
        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.pool.handles.lock().await);
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "acquisition task panicked");
                }
            }
        }
    }

    /// Stop the whole run after a process-fatal error
    pub(crate) fn abort_run(&self, error: &Error) {
        tracing::error!(error = %error, "fatal error, aborting run");
        self.pool.accepting_new.store(false, Ordering::SeqCst);
        self.pool.root_cancel.cancel();
    }
}
