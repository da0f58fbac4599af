use camgate_supervisor::*;
use std::path::PathBuf;

mod common;
use common::*;

#[tokio::test]
async fn unknown_camera_is_not_found() {
    let h = harness();
    let ghost = CameraId::from("unknown_camera");

    assert!(h.gateway.camera_status(&ghost).await.is_none());
    match h.gateway.on_publish_start("s1", &ghost).await {
        Err(GatewayError::Registry(RegistryError::UnknownCamera(c))) => assert_eq!(c, ghost),
        other => panic!("expected unknown camera, got {:?}", other),
    }
    assert!(h.gateway.save_now(&ghost).await.is_err());

    assert_eq!(h.launcher.launch_count(), 0);
    assert_eq!(h.gateway.cameras().len(), CAMERAS.len());
    assert!(h.registry.get(&ghost).is_none());
}

#[tokio::test]
async fn status_view_reports_process_and_files() {
    let h = harness();
    let camera = CameraId::from("camera1");

    let idle = h.gateway.camera_status(&camera).await.unwrap();
    assert!(!idle.has_process);
    assert_eq!(idle.hls_files, HlsOutputStats::default());

    h.gateway.on_publish_start("s1", &camera).await.unwrap();
    write_hls_output(&h.hls_dir("camera1"));

    let live = h.gateway.camera_status(&camera).await.unwrap();
    assert!(live.status.is_streaming);
    assert!(live.has_process);
    assert_eq!(live.hls_files.total_files, 2);
    assert_eq!(live.hls_files.ts_files, 1);
    assert_eq!(live.hls_files.m3u8_files, 1);
    assert!(live.hls_files.has_recent_activity);

    let json = serde_json_value(&live);
    assert!(json.contains("\"hasProcess\":true"));
    assert!(json.contains("\"isStreaming\":true"));
    assert!(json.contains("\"totalConnections\":1"));

    h.gateway.shutdown().await;
}

fn serde_json_value<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap()
}

#[tokio::test]
async fn publish_without_connect_counts_as_connection() {
    let h = harness();
    let camera = CameraId::from("camera2");

    h.gateway.on_publish_start("s9", &camera).await.unwrap();
    let (status, metrics) = h.registry.get(&camera).unwrap();
    assert!(status.is_connected);
    assert!(status.connection_time.is_some());
    assert_eq!(metrics.total_connections, 1);

    h.gateway.on_publish_end("s9", &camera).await.unwrap();

    // Connect that already names the camera is not double counted
    h.gateway.on_client_connect("s10", Some(&camera)).unwrap();
    h.gateway.on_publish_start("s10", &camera).await.unwrap();
    let (_, metrics) = h.registry.get(&camera).unwrap();
    assert_eq!(metrics.total_connections, 2);
    assert_eq!(metrics.total_disconnections, 1);

    h.gateway.shutdown().await;
}

#[tokio::test]
async fn publish_starts_both_supervisors() {
    let h = harness();
    let camera = CameraId::from("camera1");

    h.gateway.on_publish_start("s1", &camera).await.unwrap();
    h.launcher.nth(1).await;
    assert_eq!(h.launcher.live_count("hls:camera1"), 1);
    assert_eq!(h.launcher.live_count("recording:camera1"), 1);
    assert!(h.recording.is_active(&camera));

    h.gateway.on_publish_end("s1", &camera).await.unwrap();
    assert_eq!(h.launcher.live_count("hls:camera1"), 0);
    assert_eq!(h.launcher.live_count("recording:camera1"), 0);
    assert!(!h.recording.is_active(&camera));
}

#[tokio::test]
async fn preview_launch_failure_keeps_recording_and_records_error() {
    let h = harness();
    let camera = CameraId::from("camera3");
    // Only the preview launch fails; recording launches after it
    h.launcher
        .fail_next_launch(LaunchError::NotFound(PathBuf::from("/nope/ffmpeg")));

    let result = h.gateway.on_publish_start("s1", &camera).await;
    assert!(matches!(result, Err(GatewayError::Hls(_))));

    let (status, metrics) = h.registry.get(&camera).unwrap();
    assert!(status.is_streaming);
    assert!(metrics.last_error.unwrap().contains("not found"));
    h.launcher.nth(0).await;
    assert_eq!(h.launcher.live_count("recording:camera3"), 1);

    h.gateway.shutdown().await;
}

#[tokio::test]
async fn save_now_returns_retained_file() {
    let h = harness();
    let camera = CameraId::from("camera1");

    let gateway = h.gateway.clone();
    let save = tokio::spawn(async move { gateway.save_now(&CameraId::from("camera1")).await });
    h.launcher.nth(0).await.exit(0);

    let filename = save.await.unwrap().unwrap();
    assert!(filename.starts_with("camera1-manual-"));
    assert!(h.catalog.rows()[0].retain);
    assert!(h.registry.get(&camera).unwrap().1.last_error.is_none());
}

#[tokio::test]
async fn cleanup_stops_previews_and_wipes_output() {
    let h = harness();
    for name in ["camera1", "camera2"] {
        h.hls.start(&CameraId::from(name)).await.unwrap();
        write_hls_output(&h.hls_dir(name));
    }

    let report = h.gateway.cleanup().await.unwrap();
    assert_eq!(report.stopped, 2);
    // The debounced per-camera cleanup may get to some files first
    assert!(report.removed_files <= 4);
    assert_eq!(h.launcher.live_count("hls:camera1"), 0);
    assert_eq!(h.launcher.live_count("hls:camera2"), 0);
    assert_eq!(file_count(&h.hls_dir("camera1")), 0);
    assert_eq!(file_count(&h.hls_dir("camera2")), 0);
}
