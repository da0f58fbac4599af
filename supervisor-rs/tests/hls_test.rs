use camgate_supervisor::testing::TerminateBehaviour;
use camgate_supervisor::*;
use std::path::PathBuf;

mod common;
use common::*;

fn uses_transcode(args: &[String]) -> bool {
    args.iter().any(|a| a == "libx264")
}

#[tokio::test]
async fn publish_fallback_and_unpublish_end_to_end() {
    let h = harness();
    let camera = CameraId::from("camera1");
    let mut events = h.events.subscribe();

    h.gateway.on_client_connect("session-1", None).unwrap();
    h.gateway.on_publish_start("session-1", &camera).await.unwrap();

    let (status, _) = h.registry.get(&camera).unwrap();
    assert!(status.is_streaming);

    let first = h.launcher.with_label("hls:camera1").remove(0);
    assert!(!uses_transcode(first.args()));
    assert!(first.args().iter().any(|a| a == "rtmp://127.0.0.1:1935/live/camera1"));
    write_hls_output(&h.hls_dir("camera1"));

    first.emit("frame=  10 fps=0.0 q=-1.0 size=N/A time=00:00:00.40");
    first.emit(CODEC_LINE);

    wait_until("transcoding relaunch", || h.launcher.with_label("hls:camera1").len() == 2).await;
    let second = h.launcher.with_label("hls:camera1").remove(1);
    assert!(uses_transcode(second.args()));
    assert!(!first.is_live());
    assert_eq!(h.launcher.max_live("hls:camera1"), 1);

    let snapshot = h.hls.snapshot(&camera).unwrap();
    assert_eq!(snapshot.state, HlsState::Running);
    assert_eq!(snapshot.strategy, Some(Strategy::Transcode));
    assert_eq!(snapshot.retries, 1);
    wait_until("transcodingActive", || {
        h.registry.get(&camera).map(|(s, _)| s.transcoding_active).unwrap_or(false)
    })
    .await;

    write_hls_output(&h.hls_dir("camera1"));
    h.gateway.on_publish_end("session-1", &camera).await.unwrap();

    let states = collect_states_until(&mut events, "camera1", HlsState::Idle, 1).await;
    assert_eq!(
        states,
        vec![
            HlsState::Starting,
            HlsState::Running,
            HlsState::Restarting,
            HlsState::Starting,
            HlsState::Running,
            HlsState::Stopping,
            HlsState::Idle,
        ]
    );

    let (status, metrics) = h.registry.get(&camera).unwrap();
    assert!(!status.is_streaming);
    assert!(!status.is_connected);
    assert!(!status.transcoding_active);
    assert_eq!(metrics.total_disconnections, 1);
    assert!(!second.is_live());

    let dir = h.hls_dir("camera1");
    wait_until("HLS directory emptied", || file_count(&dir) == 0).await;
}

#[tokio::test]
async fn second_codec_failure_in_one_cycle_is_fatal() {
    let h = harness();
    let camera = CameraId::from("camera2");
    let mut events = h.events.subscribe();

    h.hls.start(&camera).await.unwrap();
    h.launcher.nth(0).await.emit(CODEC_LINE);
    let transcoder = h.launcher.nth(1).await;
    transcoder.emit(CODEC_LINE);

    let error = next_matching(&mut events, |e| match e {
        SupervisorEvent::HlsFailed { error, .. } => Some(error.clone()),
        _ => None,
    })
    .await;
    assert!(error.contains("is not implemented"));

    wait_until("worker idle", || {
        h.hls.snapshot(&camera).map(|s| s.state == HlsState::Idle).unwrap_or(false)
    })
    .await;
    assert_eq!(h.launcher.launch_count(), 2);
    assert!(!transcoder.is_live());
    assert!(!h.hls.snapshot(&camera).unwrap().has_process);
}

#[tokio::test]
async fn fallback_exit_code_retries_once_with_transcoding() {
    let h = harness();
    let camera = CameraId::from("camera1");

    h.hls.start(&camera).await.unwrap();
    h.launcher.nth(0).await.exit(218);

    let retry = h.launcher.nth(1).await;
    assert!(uses_transcode(retry.args()));

    // Same code again under transcoding is an ordinary failure
    retry.exit(218);
    wait_until("worker idle", || {
        h.hls.snapshot(&camera).map(|s| s.state == HlsState::Idle).unwrap_or(false)
    })
    .await;
    assert_eq!(h.launcher.launch_count(), 2);
    assert!(h.hls.snapshot(&camera).unwrap().last_error.is_some());
}

#[tokio::test]
async fn unexpected_exit_cleans_output_without_restart() {
    let h = harness();
    let camera = CameraId::from("camera1");

    h.hls.start(&camera).await.unwrap();
    let process = h.launcher.nth(0).await;
    let dir = h.hls_dir("camera1");
    write_hls_output(&dir);

    process.exit(1);
    wait_until("partial output removed", || file_count(&dir) == 0).await;

    let snapshot = h.hls.snapshot(&camera).unwrap();
    assert_eq!(snapshot.state, HlsState::Idle);
    assert_eq!(snapshot.last_error.as_deref(), Some("ffmpeg exited with code 1"));
    assert_eq!(h.launcher.launch_count(), 1);
}

#[tokio::test]
async fn stop_then_start_never_overlaps() {
    let h = harness();
    let camera = CameraId::from("camera3");

    for _ in 0..5 {
        h.hls.start(&camera).await.unwrap();
        h.hls.stop(&camera).await.unwrap();
        h.hls.start(&camera).await.unwrap();
    }
    // Racing requests are serialized by the worker
    let (a, b, c) = tokio::join!(h.hls.start(&camera), h.hls.stop(&camera), h.hls.start(&camera));
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(h.launcher.max_live("hls:camera3"), 1);
    assert!(h.launcher.live_count("hls:camera3") <= 1);
}

#[tokio::test]
async fn restart_waits_for_previous_exit() {
    let h = harness();
    let camera = CameraId::from("camera1");

    h.hls.start(&camera).await.unwrap();
    let first = h.launcher.nth(0).await;
    h.hls.start(&camera).await.unwrap();

    assert_eq!(first.terminate_requests(), 1);
    assert!(!first.is_live());
    assert!(h.launcher.nth(1).await.is_live());
    assert_eq!(h.launcher.max_live("hls:camera1"), 1);
}

#[tokio::test]
async fn launch_failure_is_surfaced_without_retry() {
    let h = harness();
    let camera = CameraId::from("camera1");
    h.launcher
        .fail_next_launch(LaunchError::NotFound(PathBuf::from("/missing/ffmpeg")));

    match h.hls.start(&camera).await {
        Err(SupervisorError::Launch(LaunchError::NotFound(_))) => {}
        other => panic!("expected launch failure, got {:?}", other),
    }
    let snapshot = h.hls.snapshot(&camera).unwrap();
    assert_eq!(snapshot.state, HlsState::Idle);
    assert!(!snapshot.has_process);
    assert_eq!(h.launcher.launch_count(), 0);

    // A manual retry works
    h.hls.start(&camera).await.unwrap();
    assert_eq!(h.launcher.launch_count(), 1);
}

#[tokio::test]
async fn stop_escalates_when_process_ignores_quit() {
    let h = harness();
    let camera = CameraId::from("camera2");
    h.launcher.set_terminate_behaviour(TerminateBehaviour::Ignore);

    h.hls.start(&camera).await.unwrap();
    let process = h.launcher.nth(0).await;
    h.hls.stop(&camera).await.unwrap();

    assert_eq!(process.terminate_requests(), 1);
    assert_eq!(process.kill_requests(), 1);
    assert!(!process.is_live());
    assert_eq!(h.hls.snapshot(&camera).unwrap().state, HlsState::Idle);
}

#[tokio::test]
async fn stop_of_unknown_camera_is_a_noop() {
    let h = harness();
    h.hls.stop(&CameraId::from("camera1")).await.unwrap();
    assert!(h.hls.cameras().is_empty());
}
