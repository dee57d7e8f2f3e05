//! Transcode engine tests against fake `ffmpeg` / `ffprobe` executables.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use narwhal_core::aggregate::AggregateRoot;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::ports::{TranscodeService, TranscodeState, TranscodeStatus};
use narwhal_test_support::{FakeFfmpeg, FakeProbe, FixedClock, RecordingPublisher, write_fake_ffmpeg, write_fake_ffprobe};
use narwhal_transcode::{JobOptions, LocalStorage, TranscodeEngine, TranscodeSettings, TranscodeStores};
use tempfile::TempDir;
use uuid::Uuid;

struct Harness {
    engine: TranscodeEngine,
    stores: TranscodeStores,
    settings: TranscodeSettings,
    publisher: Arc<RecordingPublisher>,
    dir: TempDir,
}

impl Harness {
    fn new(ffmpeg: &FakeFfmpeg, probe: &FakeProbe) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path().join("bin");
        std::fs::create_dir_all(&tools).unwrap();
        let settings = TranscodeSettings {
            ffmpeg_path: write_fake_ffmpeg(&tools, ffmpeg).unwrap(),
            ffprobe_path: write_fake_ffprobe(&tools, probe).unwrap(),
            probe_timeout: Duration::from_secs(5),
            max_retries: 1,
            progress_interval: Duration::from_millis(50),
        };
        let publisher = Arc::new(RecordingPublisher::new());
        let stores = TranscodeStores::in_memory();
        let engine = Self::engine(&dir, stores.clone(), settings.clone(), publisher.clone());
        Self {
            engine,
            stores,
            settings,
            publisher,
            dir,
        }
    }

    fn engine(
        dir: &TempDir,
        stores: TranscodeStores,
        settings: TranscodeSettings,
        publisher: Arc<RecordingPublisher>,
    ) -> TranscodeEngine {
        let storage = Arc::new(LocalStorage::new(dir.path().join("media"), Some("https://cdn.example/media".into())));
        TranscodeEngine::new(
            stores,
            settings,
            Some(storage),
            publisher,
            Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 4, 2, 8, 0, 0).unwrap())),
        )
    }

    /// A fresh engine over the same job store, as after a process restart.
    fn restarted(&self) -> TranscodeEngine {
        Self::engine(&self.dir, self.stores.clone(), self.settings.clone(), self.publisher.clone())
    }

    async fn wait_idle(&self) {
        for _ in 0..400 {
            if self.engine.active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("engine never became idle");
    }

    fn output(&self, name: &str) -> PathBuf {
        self.dir.path().join("media").join(name)
    }

    async fn wait_terminal(&self, job_id: Uuid) -> TranscodeStatus {
        for _ in 0..400 {
            let status = self.engine.job_status(&Context::background(), job_id).await.unwrap();
            if status.state.is_terminal() && self.engine.active_count() == 0 {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {job_id} never finished");
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn test_hls_job_writes_master_playlist_for_full_ladder() {
    // Arrange
    let harness = Harness::new(&FakeFfmpeg::default(), &FakeProbe::default());
    let output = harness.output("M");
    let ctx = Context::background().with_correlation("corr-hls");

    // Act
    let job_id = harness
        .engine
        .start_transcode(&ctx, "/d/M/movie.mkv", &path_str(&output), "hls_1080p")
        .await
        .unwrap();
    let status = harness.wait_terminal(job_id).await;

    // Assert
    assert_eq!(status.state, TranscodeState::Completed, "error: {:?}", status.error);
    assert!((status.percent - 100.0).abs() < f64::EPSILON);
    let master = output.join("master.m3u8");
    assert_eq!(status.output_path.as_deref(), Some(path_str(&master).as_str()));
    let playlist = m3u8_rs::parse_master_playlist_res(&std::fs::read(&master).unwrap()).unwrap();
    assert_eq!(playlist.variants.len(), 3);
    for index in 0..3 {
        assert!(output.join(format!("variant_{index}")).join("playlist.m3u8").exists());
    }

    let types = harness.publisher.event_types();
    assert_eq!(types.first().map(String::as_str), Some("TranscodeJobCreated"));
    assert_eq!(types.get(1).map(String::as_str), Some("TranscodeJobStarted"));
    assert_eq!(types.last().map(String::as_str), Some("TranscodeJobCompleted"));

    let completed = harness.publisher.of_type("TranscodeJobCompleted");
    assert_eq!(completed[0].data["variant_count"], 3);
    assert_eq!(completed[0].data["url"], "https://cdn.example/media/M/master.m3u8");
    assert!(completed[0].data["output_bytes"].as_u64().unwrap() > 0);
    assert!(harness.publisher.published().iter().all(|e| e.correlation_id.as_deref() == Some("corr-hls")));

    let percents: Vec<f64> = harness
        .publisher
        .of_type("TranscodeJobProgress")
        .iter()
        .map(|e| e.data["percent"].as_f64().unwrap())
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert!(percents.iter().all(|p| (0.0..=100.0).contains(p)));
}

#[tokio::test]
async fn test_small_input_keeps_lowest_variant_only() {
    let probe = FakeProbe {
        width: 640,
        height: 360,
        ..FakeProbe::default()
    };
    let harness = Harness::new(&FakeFfmpeg::default(), &probe);
    let output = harness.output("tiny");

    let job_id = harness
        .engine
        .start_transcode(&Context::background(), "/d/tiny.mkv", &path_str(&output), "hls")
        .await
        .unwrap();
    let status = harness.wait_terminal(job_id).await;

    assert_eq!(status.state, TranscodeState::Completed);
    let playlist = m3u8_rs::parse_master_playlist_res(&std::fs::read(output.join("master.m3u8")).unwrap()).unwrap();
    assert_eq!(playlist.variants.len(), 1);
}

#[tokio::test]
async fn test_mp4_job_writes_single_file() {
    let harness = Harness::new(&FakeFfmpeg::default(), &FakeProbe::default());
    let output = harness.output("M");

    let job_id = harness
        .engine
        .start_transcode(&Context::background(), "/d/M/movie.mkv", &path_str(&output), "mp4")
        .await
        .unwrap();
    let status = harness.wait_terminal(job_id).await;

    assert_eq!(status.state, TranscodeState::Completed);
    assert!(output.join("output.mp4").exists());
    let job = harness.engine.get_job(&Context::background(), job_id).await.unwrap();
    let probe = job.probe().unwrap();
    assert_eq!((probe.width, probe.height), (1920, 1080));
    assert!(probe.frame_rate.is_some_and(|rate| (rate - 23.976).abs() < 1e-3));
    assert_eq!(harness.publisher.of_type("TranscodeJobCompleted")[0].data["variant_count"], 0);
}

#[tokio::test]
async fn test_non_zero_exit_fails_with_stderr_then_retry_budget_applies() {
    // Arrange
    let harness = Harness::new(&FakeFfmpeg::failing("Conversion failed!"), &FakeProbe::default());
    let ctx = Context::background();
    let output = harness.output("M");

    // Act
    let job_id = harness
        .engine
        .start_transcode(&ctx, "/d/M/movie.mkv", &path_str(&output), "hls_720p")
        .await
        .unwrap();
    let first = harness.wait_terminal(job_id).await;
    harness.engine.retry_job(&ctx, job_id).await.unwrap();
    let second = harness.wait_terminal(job_id).await;
    let exhausted = harness.engine.retry_job(&ctx, job_id).await.unwrap_err();

    // Assert
    assert_eq!(first.state, TranscodeState::Failed);
    assert!(first.error.as_deref().unwrap().contains("Conversion failed!"));
    assert_eq!(second.state, TranscodeState::Failed);
    assert_eq!(harness.engine.get_job(&ctx, job_id).await.unwrap().retry_count(), 1);
    assert!(matches!(exhausted, DomainError::Validation(ref m) if m.contains("exceeded")));
    assert_eq!(harness.publisher.of_type("TranscodeJobFailed").len(), 2);
    assert!(!output.join("master.m3u8").exists());
}

#[tokio::test]
async fn test_cancel_kills_running_job_and_second_cancel_is_noop() {
    // Arrange
    let harness = Harness::new(&FakeFfmpeg::slow(10), &FakeProbe::default());
    let ctx = Context::background();
    let job_id = harness
        .engine
        .start_transcode(&ctx, "/d/M/movie.mkv", &path_str(&harness.output("M")), "hls")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Act
    harness.engine.cancel_transcode(&ctx, job_id).await.unwrap();
    let status = harness.wait_terminal(job_id).await;
    harness.engine.cancel_transcode(&ctx, job_id).await.unwrap();

    // Assert
    assert_eq!(status.state, TranscodeState::Cancelled);
    assert_eq!(harness.publisher.of_type("TranscodeJobCancelled").len(), 1);
    assert!(harness.publisher.of_type("TranscodeJobCompleted").is_empty());
}

#[tokio::test]
async fn test_shutdown_leaves_job_running_for_recovery() {
    // Arrange
    let harness = Harness::new(&FakeFfmpeg::slow(2), &FakeProbe::default());
    let ctx = Context::background();
    let job_id = harness
        .engine
        .start_transcode(&ctx, "/d/M/movie.mkv", &path_str(&harness.output("M")), "hls")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Act
    harness.engine.shutdown();
    harness.wait_idle().await;
    let interrupted = harness.engine.job_status(&ctx, job_id).await.unwrap();
    let restarted = harness.restarted();
    let recovered = restarted.recover_interrupted(&ctx).await.unwrap();
    let mut status = restarted.job_status(&ctx, job_id).await.unwrap();
    for _ in 0..400 {
        if status.state.is_terminal() && restarted.active_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        status = restarted.job_status(&ctx, job_id).await.unwrap();
    }

    // Assert
    assert_eq!(interrupted.state, TranscodeState::Running);
    assert!(harness.publisher.of_type("TranscodeJobCancelled").is_empty());
    assert_eq!(recovered, vec![job_id]);
    assert_eq!(status.state, TranscodeState::Completed, "error: {:?}", status.error);
    assert_eq!(harness.publisher.of_type("TranscodeJobRequeued").len(), 1);
    assert_eq!(harness.publisher.of_type("TranscodeJobStarted").len(), 2);
}

#[tokio::test]
async fn test_recovery_ignores_jobs_that_are_not_running() {
    let harness = Harness::new(&FakeFfmpeg::default(), &FakeProbe::default());
    let ctx = Context::background();
    let pending = harness
        .engine
        .create_job(&ctx, "/d/M/movie.mkv", &path_str(&harness.output("P")), "mp4", &JobOptions::default())
        .await
        .unwrap();
    let done = harness
        .engine
        .start_transcode(&ctx, "/d/M/movie.mkv", &path_str(&harness.output("D")), "mp4")
        .await
        .unwrap();
    harness.wait_terminal(done).await;

    let recovered = harness.engine.recover_interrupted(&ctx).await.unwrap();

    assert!(recovered.is_empty());
    let pending_status = harness.engine.job_status(&ctx, pending.aggregate_id()).await.unwrap();
    assert_eq!(pending_status.state, TranscodeState::Pending);
}

#[tokio::test]
async fn test_resume_starts_pending_job_once() {
    // Arrange
    let harness = Harness::new(&FakeFfmpeg::default(), &FakeProbe::default());
    let ctx = Context::background();
    let job = harness
        .engine
        .create_job(&ctx, "/d/M/movie.mkv", &path_str(&harness.output("M")), "webm", &JobOptions::default())
        .await
        .unwrap();
    let job_id = job.aggregate_id();

    // Act
    harness.engine.resume_transcode(&ctx, job_id).await.unwrap();
    harness.engine.resume_transcode(&ctx, job_id).await.unwrap();
    let status = harness.wait_terminal(job_id).await;
    harness.engine.resume_transcode(&ctx, job_id).await.unwrap();

    // Assert
    assert_eq!(status.state, TranscodeState::Completed);
    assert_eq!(harness.publisher.of_type("TranscodeJobStarted").len(), 1);
}

#[tokio::test]
async fn test_probe_failure_fails_job() {
    let probe = FakeProbe {
        fail: true,
        ..FakeProbe::default()
    };
    let harness = Harness::new(&FakeFfmpeg::default(), &probe);

    let job_id = harness
        .engine
        .start_transcode(&Context::background(), "/d/M/broken.mkv", &path_str(&harness.output("M")), "hls")
        .await
        .unwrap();
    let status = harness.wait_terminal(job_id).await;

    assert_eq!(status.state, TranscodeState::Failed);
    assert!(status.error.as_deref().unwrap().contains("probe failed"));
}

#[tokio::test]
async fn test_unsupported_profile_and_relative_paths_are_rejected() {
    let harness = Harness::new(&FakeFfmpeg::default(), &FakeProbe::default());
    let ctx = Context::background();

    let profile = harness
        .engine
        .create_job(&ctx, "/d/M/movie.mkv", "/h/M", "av1_4k", &JobOptions::default())
        .await
        .unwrap_err();
    let relative = harness
        .engine
        .create_job(&ctx, "movie.mkv", "/h/M", "hls", &JobOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(profile, DomainError::Validation(ref m) if m.contains("unsupported transcode profile")));
    assert!(matches!(relative, DomainError::Validation(_)));
    assert!(harness.publisher.published().is_empty());
}

#[tokio::test]
async fn test_start_of_completed_job_is_invalid() {
    let harness = Harness::new(&FakeFfmpeg::default(), &FakeProbe::default());
    let ctx = Context::background();
    let job_id = harness
        .engine
        .start_transcode(&ctx, "/d/M/movie.mkv", &path_str(&harness.output("M")), "webm")
        .await
        .unwrap();
    harness.wait_terminal(job_id).await;

    let err = harness.engine.start_job(&ctx, job_id).await.unwrap_err();

    assert!(matches!(err, DomainError::Validation(ref m) if m.contains("invalid job status")));
}
