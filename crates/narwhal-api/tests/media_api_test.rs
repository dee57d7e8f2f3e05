//! Integration tests for the media, saga and transcode routes of the full app.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use narwhal_core::context::Context;
use serde_json::json;

#[tokio::test]
async fn test_series_lifecycle_through_versioned_routes() {
    let app = common::build_test_app().await;

    let (status, series) = common::post_json(
        app.router.clone(),
        "/api/v1/series",
        &json!({ "title": "The Wire", "release_year": 2002 }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let series_id = series["id"].as_str().unwrap().to_owned();

    let (status, episode) = common::post_json(
        app.router.clone(),
        &format!("/api/v1/series/{series_id}/episodes"),
        &json!({ "season_number": 1, "episode_number": 1, "title": "The Target" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let episode_id = episode["id"].as_str().unwrap().to_owned();

    let (status, fetched) = common::get_json(app.router.clone(), &format!("/api/v1/media/{series_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["media_type"], "series");
    assert_eq!(fetched["episodes"].as_array().unwrap().len(), 1);

    let (status, _) = common::delete(app.router.clone(), &format!("/api/v1/media/{series_id}")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, json) = common::get_json(app.router, &format!("/api/v1/media/{episode_id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn test_update_details_renames_movie() {
    let app = common::build_test_app().await;
    let (_, movie) = common::post_json(app.router.clone(), "/api/v1/movies", &json!({ "title": "Heat" })).await;
    let id = movie["id"].as_str().unwrap().to_owned();

    let (status, updated) = common::put_json(
        app.router.clone(),
        &format!("/api/v1/media/{id}"),
        &json!({ "title": "Heat (Director's Cut)", "release_year": 1995, "duration_minutes": 171 }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["title"], "Heat (Director's Cut)");
    assert_eq!(updated["duration_minutes"], 171);
}

#[tokio::test]
async fn test_saga_and_transcode_routes_are_mounted() {
    let app = common::build_test_app().await;

    let (status, sagas) = common::get_json(app.router.clone(), "/api/v1/sagas").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sagas, json!([]));

    let (status, jobs) = common::get_json(app.router.clone(), "/api/v1/transcode/jobs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs, json!([]));

    let (status, dead_letters) = common::get_json(app.router, "/api/v1/dlq").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dead_letters, json!([]));
}

#[cfg(unix)]
#[tokio::test]
async fn test_movie_with_processing_becomes_ready() {
    use narwhal_test_support::{FakeFfmpeg, FakeProbe, write_fake_ffmpeg, write_fake_ffprobe};

    let work = tempfile::tempdir().unwrap();
    let tools = work.path().join("bin");
    std::fs::create_dir_all(&tools).unwrap();
    let ffmpeg = write_fake_ffmpeg(&tools, &FakeFfmpeg::default()).unwrap();
    let ffprobe = write_fake_ffprobe(&tools, &FakeProbe::default()).unwrap();
    let source = work.path().join("incoming.mkv");
    std::fs::write(&source, b"matroska-bytes").unwrap();
    let target = work.path().join("downloads");
    let output = work.path().join("media").join("heat");

    let app = common::build_test_app_with(&[
        ("FFMPEG_PATH", ffmpeg.to_string_lossy().into_owned()),
        ("FFPROBE_PATH", ffprobe.to_string_lossy().into_owned()),
    ])
    .await;
    let background = app.state.start(&Context::background()).await.unwrap();

    let (status, movie) = common::post_json(
        app.router.clone(),
        "/api/v1/movies",
        &json!({
            "title": "Heat",
            "processing": {
                "download_url": format!("file://{}", source.display()),
                "target_path": target.to_string_lossy(),
                "output_path": output.to_string_lossy(),
                "transcode_profile": "hls",
            },
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = movie["id"].as_str().unwrap().to_owned();

    let mut completed = Vec::new();
    for _ in 0..120 {
        let (_, sagas) = common::get_json(app.router.clone(), "/api/v1/sagas?state=completed").await;
        completed = sagas.as_array().cloned().unwrap_or_default();
        if !completed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    let (_, movie) = common::get_json(app.router.clone(), &format!("/api/v1/media/{id}")).await;
    background.shutdown(&app.state).await;

    assert_eq!(completed.len(), 1, "movie: {movie}");
    assert_eq!(completed[0]["saga_type"], "MediaProcessing");
    assert_eq!(movie["status"], "ready");
    assert!(movie["file_path"].as_str().unwrap().ends_with("master.m3u8"));
}
