//! End-to-end acquisition through the public API with in-memory collaborators
//!
//! ```bash
//! cargo test --test pipeline
//! ```

mod common;

use common::{
    FakeResolver, FakeSource, FakeTranscoder, ctr_encrypt, flac_stream, mp4_stream,
    ranged_manifest, test_config,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;
use tidal_dl::decrypt::ContainerFormat;
use tidal_dl::manifest::{CipherAlgorithm, CipherParams, KeyEncoding};
use tidal_dl::{
    Acquirer, AudioQuality, Collaborators, Config, ErrorKind, Event, ItemDescriptor,
    LifecycleState, QualitySelection, TaskId, TaskOutcome, TaskResult,
};

const HIFI: QualitySelection = QualitySelection::Audio(AudioQuality::HiFi);
const MAX: QualitySelection = QualitySelection::Audio(AudioQuality::Max);

async fn build(
    config: Config,
    resolver: &Arc<FakeResolver>,
    source: &Arc<FakeSource>,
    transcoder: &Arc<FakeTranscoder>,
) -> Acquirer {
    let collaborators = Collaborators::new(&config, resolver.clone(), source.clone())
        .with_transcoder(transcoder.clone());
    Acquirer::new(config, collaborators).await.unwrap()
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

fn transitions(events: &[Event], task: TaskId) -> Vec<LifecycleState> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::StateChanged { id, to, .. } if *id == task => Some(*to),
            _ => None,
        })
        .collect()
}

fn failure_kind(result: &TaskResult) -> ErrorKind {
    match &result.outcome {
        TaskOutcome::Failed { kind, .. } => *kind,
        other => panic!("expected failure, got {other:?}"),
    }
}

async fn wait_for_state(acquirer: &Acquirer, id: TaskId, state: LifecycleState) {
    for _ in 0..400 {
        if acquirer.status(id).await.map(|s| s.state) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {id} never reached {state}");
}

#[tokio::test]
async fn encrypted_hifi_track_survives_one_segment_timeout() {
    let dir = TempDir::new().unwrap();
    let key = [0x2bu8; 16];
    let nonce = [0x07u8; 8];
    let plain = flac_stream(2500);

    let source = Arc::new(FakeSource::default());
    source.put("cdn/a", ctr_encrypt(&key, &nonce, &plain));
    source.slow_once(1);

    let mut manifest = ranged_manifest("cdn/a", 2500, 1000, ContainerFormat::Flac);
    manifest.cipher = Some(CipherParams {
        algorithm: CipherAlgorithm::Aes128Ctr,
        key_material: [key.as_slice(), nonce.as_slice()].concat(),
        key_encoding: KeyEncoding::Raw,
    });
    let resolver = Arc::new(FakeResolver::default());
    resolver.insert("a", manifest);

    let acquirer = build(
        test_config(dir.path()),
        &resolver,
        &source,
        &Arc::new(FakeTranscoder::default()),
    )
    .await;
    let mut events = acquirer.subscribe();

    let id = acquirer
        .submit(ItemDescriptor::track("a"), HIFI)
        .await
        .unwrap();
    let result = acquirer.wait(id).await.unwrap();

    let TaskOutcome::Completed { path, bytes } = result.outcome else {
        panic!("expected completion, got {:?}", result.outcome);
    };
    assert_eq!(bytes, 2500);
    assert_eq!(std::fs::read(&path).unwrap(), plain);

    let status = acquirer.status(id).await.unwrap();
    assert_eq!(status.state, LifecycleState::Completed);
    assert_eq!(status.segment_retries, BTreeMap::from([(1, 1)]));
    assert_eq!(status.segments_done, 3);
    assert_eq!(resolver.calls(), 1);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::SegmentRetried {
            segment: 1,
            retry: 1,
            ..
        }
    )));
    assert_eq!(
        transitions(&events, id),
        vec![
            LifecycleState::Resolving,
            LifecycleState::Fetching,
            LifecycleState::Decrypting,
            LifecycleState::Finalizing,
            LifecycleState::Completed,
        ]
    );
}

#[tokio::test]
async fn max_quality_passes_through_transcoding_once() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(FakeSource::default());
    source.put("cdn/b", mp4_stream(3000));
    let resolver = Arc::new(FakeResolver::default());
    resolver.insert("b", ranged_manifest("cdn/b", 3000, 1024, ContainerFormat::Mp4));
    let transcoder = Arc::new(FakeTranscoder::default());

    let acquirer = build(test_config(dir.path()), &resolver, &source, &transcoder).await;
    let mut events = acquirer.subscribe();

    let id = acquirer
        .submit(ItemDescriptor::track("b"), MAX)
        .await
        .unwrap();
    let result = acquirer.wait(id).await.unwrap();

    let TaskOutcome::Completed { path, .. } = &result.outcome else {
        panic!("expected completion, got {:?}", result.outcome);
    };
    assert_eq!(path.extension().unwrap(), "flac");
    assert!(std::fs::read(path).unwrap().starts_with(b"fLaC"));
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);

    let states = transitions(&drain(&mut events), id);
    let transcoding: Vec<_> = states
        .iter()
        .enumerate()
        .filter(|(_, s)| **s == LifecycleState::Transcoding)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(transcoding.len(), 1);
    assert_eq!(states[transcoding[0] + 1], LifecycleState::Finalizing);

    // Staging files are gone
    let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .filter(|name| name.to_string_lossy().ends_with(".part"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[tokio::test]
async fn worker_pool_bounds_active_items() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.download.max_concurrent_items = 2;

    let source = Arc::new(FakeSource::default());
    source.set_delay(Duration::from_millis(40));
    let resolver = Arc::new(FakeResolver::default());
    for n in 0..5 {
        let url = format!("cdn/{n}");
        source.put(&url, flac_stream(600));
        resolver.insert(
            &n.to_string(),
            ranged_manifest(&url, 600, 200, ContainerFormat::Flac),
        );
    }

    let acquirer = build(
        config,
        &resolver,
        &source,
        &Arc::new(FakeTranscoder::default()),
    )
    .await;

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(
            acquirer
                .submit(ItemDescriptor::track(n.to_string()), HIFI)
                .await
                .unwrap(),
        );
    }

    let mut peak = 0;
    loop {
        let statuses = acquirer.statuses().await;
        let active = statuses.iter().filter(|s| s.state.is_active()).count();
        assert!(active <= 2, "{active} items active at once");
        peak = peak.max(active);
        if statuses.iter().all(|s| s.state.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    let summary = acquirer.wait_all().await;
    assert_eq!(summary.completed, 5);
    assert_eq!(peak, 2);
}

#[tokio::test]
async fn duplicate_submission_waits_for_the_writer_then_skips() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let plain = flac_stream(900);
    let source = Arc::new(FakeSource::default());
    source.set_delay(Duration::from_millis(60));
    source.put("cdn/a", plain.clone());
    let resolver = Arc::new(FakeResolver::default());
    resolver.insert("a", ranged_manifest("cdn/a", 900, 300, ContainerFormat::Flac));

    let acquirer = build(
        config,
        &resolver,
        &source,
        &Arc::new(FakeTranscoder::default()),
    )
    .await;
    let mut events = acquirer.subscribe();

    let first = acquirer
        .submit(ItemDescriptor::track("a"), HIFI)
        .await
        .unwrap();
    wait_for_state(&acquirer, first, LifecycleState::Fetching).await;
    let second = acquirer
        .submit(ItemDescriptor::track("a"), HIFI)
        .await
        .unwrap();

    let summary = acquirer.wait_all().await;
    let first = acquirer.wait(first).await.unwrap();
    let second = acquirer.wait(second).await.unwrap();

    let TaskOutcome::Completed { path, bytes } = first.outcome else {
        panic!("expected completion, got {:?}", first.outcome);
    };
    assert_eq!(bytes, 900);
    assert_eq!(second.outcome, TaskOutcome::Skipped { path: path.clone() });
    assert_eq!((summary.completed, summary.skipped, summary.failed), (1, 1, 0));

    assert_eq!(std::fs::read(&path).unwrap(), plain);
    assert_eq!(resolver.calls(), 1);
    assert_eq!(source.calls(), 3);
    assert!(!path.with_extension("flac.part").exists());
    assert_eq!(
        transitions(&drain(&mut events), second.id),
        vec![LifecycleState::Skipped]
    );
}

#[tokio::test]
async fn existing_destination_is_skipped_without_network() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let existing = config.download.download_dir.join("tracks/c.flac");
    std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
    std::fs::write(&existing, b"previous run").unwrap();

    let resolver = Arc::new(FakeResolver::default());
    let source = Arc::new(FakeSource::default());
    let acquirer = build(
        config,
        &resolver,
        &source,
        &Arc::new(FakeTranscoder::default()),
    )
    .await;
    let mut events = acquirer.subscribe();

    let id = acquirer
        .submit(ItemDescriptor::track("c"), HIFI)
        .await
        .unwrap();
    let result = acquirer.wait(id).await.unwrap();

    assert_eq!(result.outcome, TaskOutcome::Skipped { path: existing.clone() });
    assert_eq!(resolver.calls(), 0);
    assert_eq!(source.calls(), 0);
    assert_eq!(std::fs::read(&existing).unwrap(), b"previous run");
    assert_eq!(
        transitions(&drain(&mut events), id),
        vec![LifecycleState::Skipped]
    );
}

#[tokio::test]
async fn exhausted_segment_leaves_no_output() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.fetch.max_manifest_attempts = 2;

    let source = Arc::new(FakeSource::default());
    source.put("cdn/d", flac_stream(2500));
    source.break_segment(2);
    let resolver = Arc::new(FakeResolver::default());
    resolver.insert("d", ranged_manifest("cdn/d", 2500, 1000, ContainerFormat::Flac));

    let acquirer = build(
        config,
        &resolver,
        &source,
        &Arc::new(FakeTranscoder::default()),
    )
    .await;

    let id = acquirer
        .submit(ItemDescriptor::track("d"), HIFI)
        .await
        .unwrap();
    let summary = acquirer.wait_all().await;

    assert_eq!(summary.failed, 1);
    assert_eq!(failure_kind(&summary.results[0]), ErrorKind::FetchExhausted);
    // One fresh manifest after the first exhaustion
    assert_eq!(resolver.calls(), 2);

    let destination = acquirer.status(id).await.unwrap().destination.unwrap();
    assert!(!destination.exists());
    let parent = destination.parent().unwrap();
    assert_eq!(std::fs::read_dir(parent).unwrap().count(), 0);

    let json = summary.to_json().unwrap();
    assert!(json.contains("\"kind\": \"fetch_exhausted\""), "{json}");
}

#[tokio::test]
async fn cancel_mid_fetch_cleans_up() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(FakeSource::default());
    source.put("cdn/e", flac_stream(2500));
    source.hang_segment(1);
    let resolver = Arc::new(FakeResolver::default());
    resolver.insert("e", ranged_manifest("cdn/e", 2500, 1000, ContainerFormat::Flac));

    let mut config = test_config(dir.path());
    config.fetch.request_timeout = Duration::from_secs(30);
    let acquirer = build(
        config,
        &resolver,
        &source,
        &Arc::new(FakeTranscoder::default()),
    )
    .await;

    let id = acquirer
        .submit(ItemDescriptor::track("e"), HIFI)
        .await
        .unwrap();
    wait_for_state(&acquirer, id, LifecycleState::Fetching).await;
    acquirer.cancel(id).await.unwrap();
    let result = acquirer.wait(id).await.unwrap();

    assert_eq!(failure_kind(&result), ErrorKind::Cancelled);
    let destination = acquirer.status(id).await.unwrap().destination.unwrap();
    assert!(!destination.exists());
    let parent = destination.parent().unwrap();
    assert_eq!(std::fs::read_dir(parent).unwrap().count(), 0);
}

#[tokio::test]
async fn shutdown_cancels_every_task() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(FakeSource::default());
    source.hang_segment(0);
    let resolver = Arc::new(FakeResolver::default());
    for n in 0..3 {
        let url = format!("cdn/{n}");
        source.put(&url, flac_stream(100));
        resolver.insert(
            &n.to_string(),
            ranged_manifest(&url, 100, 100, ContainerFormat::Flac),
        );
    }

    let mut config = test_config(dir.path());
    config.download.max_concurrent_items = 1;
    config.fetch.request_timeout = Duration::from_secs(30);
    let acquirer = build(
        config,
        &resolver,
        &source,
        &Arc::new(FakeTranscoder::default()),
    )
    .await;
    let mut events = acquirer.subscribe();

    for n in 0..3 {
        acquirer
            .submit(ItemDescriptor::track(n.to_string()), HIFI)
            .await
            .unwrap();
    }
    wait_for_state(&acquirer, TaskId(1), LifecycleState::Fetching).await;

    acquirer.shutdown().await;

    let results = acquirer.results().await;
    assert_eq!(results.len(), 3);
    assert!(
        results
            .iter()
            .all(|r| failure_kind(r) == ErrorKind::Cancelled)
    );
    assert!(drain(&mut events).iter().any(|e| matches!(e, Event::Shutdown)));
    assert!(
        acquirer
            .submit(ItemDescriptor::track("4"), HIFI)
            .await
            .is_err()
    );
}
