//! Per-item state machine
//!
//! `Pending -> Resolving -> Fetching -> Decrypting -> (Transcoding) -> Finalizing -> Completed`
//!
//! `Resolving` loops at most once on `NotAvailable` with a lower quality, and
//! is re-entered with a fresh manifest when fetching or decryption fails in a
//! way the old manifest cannot recover from.

use super::{Acquirer, finalize};
use crate::config::DowngradePolicy;
use crate::decrypt::{ContainerFormat, DecryptionContext, SNIFF_LEN, StreamDecryptor};
use crate::error::{Error, Result};
use crate::manifest::StreamManifest;
use crate::retry::with_retry;
use crate::transcode::plan_transcode;
use crate::types::{
    Event, ItemDescriptor, LifecycleState, QualitySelection, TaskId, TaskOutcome, TaskResult,
};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

/// Everything one task needs, cloned out of the [`Acquirer`]
pub(crate) struct TaskContext {
    id: TaskId,
    descriptor: ItemDescriptor,
    requested: QualitySelection,
    cancel: CancellationToken,
    acquirer: Acquirer,
}

enum Finished {
    Completed { path: PathBuf, bytes: u64 },
    Skipped { path: PathBuf },
}

impl TaskContext {
    pub(crate) fn new(
        id: TaskId,
        descriptor: ItemDescriptor,
        requested: QualitySelection,
        cancel: CancellationToken,
        acquirer: Acquirer,
    ) -> Self {
        Self {
            id,
            descriptor,
            requested,
            cancel,
            acquirer,
        }
    }
}

/// Drive one item to a terminal state
///
/// The worker permit is held until the terminal state is recorded, so the
/// number of items in an active state never exceeds the pool size. The
/// destination claim is held just as long.
pub(crate) async fn run_task(ctx: TaskContext) {
    let mut quality = ctx.requested;
    let mut permit = None;
    let outcome = ctx.execute(&mut quality, &mut permit).await;
    ctx.finish(quality, outcome).await;
    ctx.acquirer.registry.release_claims(ctx.id).await;
    drop(permit);
}

impl TaskContext {
    async fn execute(
        &self,
        quality: &mut QualitySelection,
        permit: &mut Option<OwnedSemaphorePermit>,
    ) -> Result<Finished> {
        let config = &self.acquirer.config;

        let mut destination = self.plan(*quality).await?;
        self.claim(&destination).await?;
        if self.is_skippable(&destination).await {
            return Ok(Finished::Skipped { path: destination });
        }

        let items = Arc::clone(&self.acquirer.pool.items);
        *permit = Some(tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            acquired = items.acquire_owned() => acquired.map_err(|_| Error::ShuttingDown)?,
        });

        let mut downgrades_left: u32 = match config.quality.downgrade {
            DowngradePolicy::Automatic => 1,
            DowngradePolicy::Disabled => 0,
        };
        let mut manifests_left = config.fetch.max_manifest_attempts;

        loop {
            self.transition(LifecycleState::Resolving).await;

            let manifest = match self.resolve(*quality).await {
                Ok(manifest) => manifest,
                Err(e @ Error::NotAvailable { .. }) if downgrades_left > 0 => {
                    let Some(lower) = quality.downgrade() else {
                        return Err(e);
                    };
                    downgrades_left -= 1;
                    tracing::warn!(
                        task_id = self.id.get(),
                        from = %quality,
                        to = %lower,
                        "quality not available, downgrading"
                    );
                    self.acquirer.registry.emit(Event::QualityDowngraded {
                        id: self.id,
                        from: *quality,
                        to: lower,
                    });
                    *quality = lower;
                    let lowered = self.plan(lower).await?;
                    if lowered != destination {
                        let registry = &self.acquirer.registry;
                        registry.release_claims(self.id).await;
                        // No waiting here: this task already holds a worker permit
                        if !registry.try_claim(self.id, &lowered).await {
                            tracing::info!(
                                task_id = self.id.get(),
                                path = %lowered.display(),
                                "lower quality destination is being written by another task"
                            );
                            return Ok(Finished::Skipped { path: lowered });
                        }
                        if self.is_skippable(&lowered).await {
                            return Ok(Finished::Skipped { path: lowered });
                        }
                        destination = lowered;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            manifests_left = manifests_left.saturating_sub(1);

            match self.acquire(&manifest, *quality, &destination).await {
                Ok(bytes) => {
                    return Ok(Finished::Completed {
                        path: destination,
                        bytes,
                    });
                }
                Err(e) if e.needs_fresh_manifest() && manifests_left > 0 => {
                    tracing::warn!(
                        task_id = self.id.get(),
                        error = %e,
                        manifests_left,
                        "manifest unusable, resolving a fresh one"
                    );
                    self.acquirer.registry.emit(Event::ManifestRefreshed {
                        id: self.id,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn plan(&self, quality: QualitySelection) -> Result<PathBuf> {
        let destination = self.acquirer.planner.plan(&self.descriptor, quality)?;
        let recorded = destination.clone();
        self.acquirer
            .registry
            .update(self.id, move |status| {
                status.quality = quality;
                status.destination = Some(recorded);
            })
            .await;
        Ok(destination)
    }

    /// Take ownership of `destination`, queueing behind any task that holds it
    async fn claim(&self, destination: &Path) -> Result<()> {
        let registry = &self.acquirer.registry;
        if registry.try_claim(self.id, destination).await {
            return Ok(());
        }
        tracing::info!(
            task_id = self.id.get(),
            path = %destination.display(),
            "destination in use by another task, waiting"
        );
        registry.claim(self.id, destination, &self.cancel).await
    }

    async fn is_skippable(&self, destination: &Path) -> bool {
        self.acquirer.config.download.skip_existing
            && finalize::is_existing_output(destination).await
    }

    async fn resolve(&self, quality: QualitySelection) -> Result<StreamManifest> {
        self.check_cancelled()?;

        let config = &self.acquirer.config;
        let timeout = config.fetch.request_timeout;
        let resolver = &self.acquirer.resolver;
        let attempt = with_retry(
            &config.retry.resolve,
            || async {
                match tokio::time::timeout(timeout, resolver.resolve(&self.descriptor, quality))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::TransientService(format!(
                        "resolving {} timed out after {timeout:?}",
                        self.descriptor
                    ))),
                }
            },
            |retry, e| {
                tracing::warn!(
                    task_id = self.id.get(),
                    retry,
                    error = %e,
                    "retrying manifest resolution"
                )
            },
        );

        let manifest = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            outcome = attempt => outcome.map_err(|exhausted| exhausted.error)?,
        };

        tracing::info!(
            task_id = self.id.get(),
            item = %self.descriptor,
            %quality,
            segments = manifest.segments.len(),
            container = %manifest.container,
            encrypted = manifest.cipher.is_some(),
            "manifest resolved"
        );
        Ok(manifest)
    }

    /// Run one manifest through fetch, decrypt, transcode and placement
    ///
    /// Staging files are removed on any failure.
    async fn acquire(
        &self,
        manifest: &StreamManifest,
        quality: QualitySelection,
        destination: &Path,
    ) -> Result<u64> {
        let segments_total = manifest.segments.len();
        let total_bytes = manifest.total_size;
        self.acquirer
            .registry
            .update(self.id, move |status| {
                status.manifests_resolved += 1;
                status.bytes_fetched = 0;
                status.total_bytes = total_bytes;
                status.segments_done = 0;
                status.segments_total = segments_total;
                status.segment_retries.clear();
            })
            .await;

        finalize::prepare_parent(destination).await?;
        let staged = finalize::temp_path(destination);
        let transcoded = finalize::transcode_path(destination);

        let result = self
            .produce(manifest, quality, destination, &staged, &transcoded)
            .await;
        if result.is_err() {
            finalize::discard(&staged).await;
            finalize::discard(&transcoded).await;
        }
        result
    }

    async fn produce(
        &self,
        manifest: &StreamManifest,
        quality: QualitySelection,
        destination: &Path,
        staged: &Path,
        transcoded: &Path,
    ) -> Result<u64> {
        let detected = self.fetch_and_decrypt(manifest, staged).await?;

        let output = match plan_transcode(
            &self.acquirer.config.transcode,
            quality,
            detected,
            &manifest.codec,
        )? {
            Some(target) => {
                self.transcode(staged, detected, target, transcoded).await?;
                finalize::discard(staged).await;
                transcoded
            }
            None => staged,
        };

        self.check_cancelled()?;
        self.transition(LifecycleState::Finalizing).await;
        finalize::place(output, destination).await
    }

    /// Stream segments through the decryptor into `staged`
    ///
    /// Returns the container of the plaintext.
    async fn fetch_and_decrypt(
        &self,
        manifest: &StreamManifest,
        staged: &Path,
    ) -> Result<ContainerFormat> {
        let context = DecryptionContext::derive(
            manifest.cipher.as_ref(),
            self.acquirer.config.api.master_key.as_deref(),
        )?;
        let mut decryptor = StreamDecryptor::new(&context, manifest.container)?;

        self.check_cancelled()?;
        self.transition(LifecycleState::Fetching).await;

        let file = tokio::fs::File::create(staged)
            .await
            .map_err(|e| Error::from_destination_io(staged, e))?;
        let mut writer = BufWriter::new(file);
        let mut header = Vec::with_capacity(SNIFF_LEN);

        let id = self.id;
        let events = self.acquirer.registry.event_sender();
        let on_retry = move |segment: usize, retry: u32| {
            events.send(Event::SegmentRetried { id, segment, retry }).ok();
        };

        let chunks =
            self.acquirer
                .fetcher
                .fetch_ordered(&manifest.segments, &self.cancel, &on_retry);
        futures::pin_mut!(chunks);

        let mut fetched = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            fetched += chunk.bytes.len() as u64;

            let plain = match decryptor.update(&chunk.bytes) {
                Ok(plain) => plain,
                Err(e) => {
                    // Header and padding checks belong to decryption
                    self.transition(LifecycleState::Decrypting).await;
                    return Err(e);
                }
            };
            write_plain(&mut writer, &mut header, &plain, staged).await?;

            let (index, retries) = (chunk.index, chunk.retries);
            self.acquirer
                .registry
                .update(id, move |status| {
                    status.bytes_fetched = fetched;
                    status.segments_done = index + 1;
                    if retries > 0 {
                        status.segment_retries.insert(index, retries);
                    }
                })
                .await;
            self.acquirer.registry.emit(Event::Progress {
                id,
                bytes_fetched: fetched,
                total_bytes: manifest.total_size,
            });
        }

        self.check_cancelled()?;
        self.transition(LifecycleState::Decrypting).await;

        let tail = decryptor.finish()?;
        write_plain(&mut writer, &mut header, &tail, staged).await?;
        writer
            .flush()
            .await
            .map_err(|e| Error::from_destination_io(staged, e))?;

        tracing::debug!(task_id = id.get(), bytes = fetched, "stream decrypted");
        Ok(match manifest.container {
            ContainerFormat::Unknown => ContainerFormat::sniff(&header),
            known => known,
        })
    }

    async fn transcode(
        &self,
        input: &Path,
        source: ContainerFormat,
        target: crate::config::TranscodeTarget,
        output: &Path,
    ) -> Result<()> {
        let slots = Arc::clone(&self.acquirer.pool.transcodes);
        let _slot = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            acquired = slots.acquire_owned() => acquired.map_err(|_| Error::ShuttingDown)?,
        };

        self.transition(LifecycleState::Transcoding).await;
        tracing::info!(
            task_id = self.id.get(),
            transcoder = self.acquirer.transcoder.name(),
            %source,
            target = %target.container(),
            "transcoding"
        );

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = self.acquirer.transcoder.transcode(input, source, target, output) => result,
        }
    }

    async fn finish(&self, quality: QualitySelection, outcome: Result<Finished>) {
        let registry = &self.acquirer.registry;
        let id = self.id;

        let outcome = match outcome {
            Ok(Finished::Skipped { path }) => {
                registry.transition(id, LifecycleState::Skipped).await;
                tracing::info!(task_id = id.get(), path = %path.display(), "destination exists, skipped");
                registry.emit(Event::Skipped {
                    id,
                    path: path.clone(),
                });
                TaskOutcome::Skipped { path }
            }
            Ok(Finished::Completed { path, bytes }) => {
                registry.transition(id, LifecycleState::Completed).await;
                tracing::info!(
                    task_id = id.get(),
                    path = %path.display(),
                    bytes,
                    "item completed"
                );
                registry.emit(Event::Completed {
                    id,
                    path: path.clone(),
                    bytes,
                });
                TaskOutcome::Completed { path, bytes }
            }
            Err(error) => {
                let stage = registry
                    .state(id)
                    .await
                    .unwrap_or(LifecycleState::Pending);
                registry.transition(id, LifecycleState::Failed).await;
                if matches!(error, Error::Cancelled) {
                    tracing::info!(task_id = id.get(), %stage, "task cancelled");
                } else {
                    tracing::error!(task_id = id.get(), %stage, error = %error, "item failed");
                }
                registry.emit(Event::Failed {
                    id,
                    stage,
                    kind: error.kind(),
                    error: error.to_string(),
                });
                if error.is_fatal() {
                    self.acquirer.abort_run(&error);
                }
                TaskOutcome::Failed {
                    stage,
                    kind: error.kind(),
                    message: error.to_string(),
                }
            }
        };

        let completed_path = match &outcome {
            TaskOutcome::Completed { path, .. } => Some(path.clone()),
            _ => None,
        };
        registry
            .finish(TaskResult {
                id,
                descriptor: self.descriptor.clone(),
                quality,
                outcome,
            })
            .await;

        if let Some(path) = completed_path {
            if let Err(e) = self.acquirer.tagger.tag(&path, &self.descriptor).await {
                tracing::warn!(task_id = id.get(), error = %e, "tagging failed, keeping file");
                registry.emit(Event::TaggingFailed {
                    id,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn transition(&self, to: LifecycleState) {
        self.acquirer.registry.transition(self.id, to).await;
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

async fn write_plain(
    writer: &mut BufWriter<tokio::fs::File>,
    header: &mut Vec<u8>,
    plain: &[u8],
    path: &Path,
) -> Result<()> {
    if header.len() < SNIFF_LEN {
        let take = (SNIFF_LEN - header.len()).min(plain.len());
        header.extend_from_slice(&plain[..take]);
    }
    writer
        .write_all(plain)
        .await
        .map_err(|e| Error::from_destination_io(path, e))
}
