mod support;

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};
use shadercam::{
    CopyStrategy, EngineError, EngineEvent, EngineState, FinishReason, PassthroughBinder,
    RecordingError, RecordingPhase, RenderEngine, SurfaceId, Viewport, Y4mInfo,
};
use tempfile::TempDir;

use support::{
    camera_image, engine_config, temp_files, wait_until, Call, CallLog, FakeBackend, FakeOptions,
    LoggingEncoder, RejectingEncoder,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn next_event(events: &Receiver<EngineEvent>) -> EngineEvent {
    events
        .recv_timeout(EVENT_TIMEOUT)
        .expect("engine event did not arrive")
}

fn engine(dir: &TempDir, log: &CallLog, options: FakeOptions) -> RenderEngine {
    RenderEngine::new(
        engine_config(dir.path()),
        FakeBackend::with_options(log.clone(), options),
        LoggingEncoder::new(log.clone()),
        PassthroughBinder,
    )
}

fn started(dir: &TempDir, log: &CallLog) -> (RenderEngine, Receiver<EngineEvent>) {
    let mut engine = engine(dir, log, FakeOptions::default());
    let events = engine.listen();
    engine.start().unwrap();
    assert_eq!(next_event(&events), EngineEvent::Ready);
    (engine, events)
}

/// Pushes one image and waits until the render thread has presented it.
fn render(engine: &RenderEngine, marker: u8, timestamp_ns: i64) {
    let before = engine.stats().frames_rendered;
    engine
        .frame_producer()
        .push(camera_image(marker, timestamp_ns))
        .unwrap();
    assert!(
        wait_until(|| engine.stats().frames_rendered > before),
        "frame {marker} was never rendered"
    );
}

fn shutdown(mut engine: RenderEngine, events: &Receiver<EngineEvent>) -> FinishReason {
    engine.request_shutdown();
    let reason = loop {
        if let EngineEvent::Finished(reason) = next_event(events) {
            break reason;
        }
    };
    engine.join().unwrap();
    assert_eq!(engine.state(), EngineState::Terminated);
    reason
}

fn preview_id(log: &CallLog) -> SurfaceId {
    log.snapshot()
        .into_iter()
        .find_map(|call| match call {
            Call::CreatePreview(id) => Some(id),
            _ => None,
        })
        .expect("preview surface was never created")
}

#[test]
fn ready_is_reported_once_and_shutdown_finishes() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let (engine, events) = started(&dir, &log);
    assert_eq!(engine.state(), EngineState::Running);

    assert_eq!(shutdown(engine, &events), FinishReason::Requested);
    assert!(events.try_iter().all(|event| event != EngineEvent::Ready));
}

#[test]
fn invalid_fragment_reports_init_failed() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let config = engine_config(dir.path());
    fs::write(&config.shaders.fragment, "void main() { this is not glsl }").unwrap();
    let mut engine = RenderEngine::new(
        config,
        FakeBackend::new(log.clone()),
        LoggingEncoder::new(log.clone()),
        PassthroughBinder,
    );
    let events = engine.listen();
    engine.start().unwrap();

    assert!(matches!(next_event(&events), EngineEvent::InitFailed(_)));
    assert_eq!(
        next_event(&events),
        EngineEvent::Finished(FinishReason::InitFailed)
    );
    engine.join().unwrap();
    assert_eq!(engine.state(), EngineState::Terminated);
    assert_eq!(log.count(|call| matches!(call, Call::Link(_))), 0);
    assert_eq!(log.snapshot().last(), Some(&Call::Release));
}

#[test]
fn context_failure_reports_init_failed() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let mut engine = engine(
        &dir,
        &log,
        FakeOptions {
            fail_context: true,
            ..FakeOptions::default()
        },
    );
    let events = engine.listen();
    engine.start().unwrap();

    match next_event(&events) {
        EngineEvent::InitFailed(message) => assert!(message.contains("no display available")),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        next_event(&events),
        EngineEvent::Finished(FinishReason::InitFailed)
    );
    engine.join().unwrap();
    assert!(log.snapshot().is_empty());
}

#[test]
fn start_requires_listener_and_runs_once() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let mut engine = engine(&dir, &log, FakeOptions::default());
    assert!(matches!(engine.start(), Err(EngineError::ListenerNotSet)));

    let events = engine.listen();
    engine.start().unwrap();
    assert!(matches!(engine.start(), Err(EngineError::AlreadyStarted)));
    assert_eq!(next_event(&events), EngineEvent::Ready);
    shutdown(engine, &events);
}

#[test]
fn missing_shader_file_fails_before_spawning() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let config = engine_config(dir.path());
    fs::remove_file(&config.shaders.vertex).unwrap();
    let mut engine = RenderEngine::new(
        config,
        FakeBackend::new(log.clone()),
        LoggingEncoder::new(log.clone()),
        PassthroughBinder,
    );
    let _events = engine.listen();

    assert!(matches!(engine.start(), Err(EngineError::ShaderLoad { .. })));
    assert_eq!(engine.state(), EngineState::Created);
}

#[test]
fn recording_requests_are_validated() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let unstarted = engine(&dir, &log, FakeOptions::default());
    assert!(matches!(
        unstarted.start_recording(dir.path().join("out.y4m")),
        Err(EngineError::NotRunning)
    ));
    drop(unstarted);

    let (engine, events) = started(&dir, &log);
    assert!(matches!(
        engine.start_recording(""),
        Err(EngineError::NoOutputPath)
    ));
    assert!(engine.stop_recording().unwrap().is_none());
    assert!(!engine.is_recording());

    engine.start_recording(dir.path().join("out.y4m")).unwrap();
    assert!(matches!(
        engine.start_recording(dir.path().join("other.y4m")),
        Err(EngineError::Recording(RecordingError::AlreadyRecording))
    ));
    shutdown(engine, &events);
}

#[test]
fn stop_moves_recording_into_place() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let (engine, events) = started(&dir, &log);
    let output = dir.path().join("clip.y4m");

    engine.start_recording(&output).unwrap();
    assert!(engine.is_recording());
    assert_eq!(engine.recording_phase(), RecordingPhase::Active);
    for index in 0..4u8 {
        render(&engine, index + 1, i64::from(index) * 33_000_000);
    }
    let outcome = engine.stop_recording().unwrap().expect("recording was active");

    assert_eq!(outcome.path, output);
    assert_eq!(outcome.frames, 4);
    assert_eq!(fs::metadata(&output).unwrap().len(), outcome.bytes);
    assert_eq!(Y4mInfo::read(&output).unwrap().frames, 4);
    assert_eq!(engine.recording_phase(), RecordingPhase::Idle);
    assert_eq!(engine.stats().frames_recorded, 4);

    // The finished session's temp file is gone; only the re-armed one remains.
    assert_eq!(temp_files(&dir.path().join("cache")).len(), 1);
    shutdown(engine, &events);
    assert!(temp_files(&dir.path().join("cache")).is_empty());
}

#[test]
fn shutdown_while_recording_finalizes_first() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let (engine, events) = started(&dir, &log);
    let output = dir.path().join("interrupted.y4m");

    engine.start_recording(&output).unwrap();
    render(&engine, 7, 0);
    render(&engine, 8, 33_000_000);
    assert_eq!(shutdown(engine, &events), FinishReason::Requested);

    assert_eq!(Y4mInfo::read(&output).unwrap().frames, 2);
    let stop = log.position(|call| *call == Call::EncoderStop).unwrap();
    let release = log.rposition(|call| *call == Call::Release).unwrap();
    assert!(stop < release);
    assert!(temp_files(&dir.path().join("cache")).is_empty());
}

#[test]
fn teardown_releases_in_order() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let (engine, events) = started(&dir, &log);
    render(&engine, 1, 0);
    shutdown(engine, &events);

    let preview = preview_id(&log);
    let recording = log
        .snapshot()
        .into_iter()
        .find_map(|call| match call {
            Call::CreateEncoderSurface(id) => Some(id),
            _ => None,
        })
        .unwrap();
    let at = |expected: Call| log.rposition(|call| *call == expected).unwrap();

    let recording_gone = at(Call::DestroySurface(recording));
    let preview_gone = at(Call::DestroySurface(preview));
    let encoder_released = at(Call::EncoderRelease);
    let program_deleted = log
        .position(|call| matches!(call, Call::DeleteProgram(_)))
        .unwrap();
    let released = at(Call::Release);

    assert!(recording_gone < preview_gone);
    assert!(preview_gone < encoder_released);
    assert!(encoder_released < program_deleted);
    assert!(program_deleted < released);
    assert_eq!(log.snapshot().last(), Some(&Call::Release));
}

#[test]
fn queued_images_collapse_to_the_newest() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let mut engine = engine(&dir, &log, FakeOptions::default());
    let producer = engine.frame_producer();
    for marker in 1..=10u8 {
        producer
            .push(camera_image(marker, i64::from(marker) * 1_000_000))
            .unwrap();
    }
    let events = engine.listen();
    engine.start().unwrap();
    assert_eq!(next_event(&events), EngineEvent::Ready);
    assert!(wait_until(|| engine.stats().frames_rendered == 1));

    let uploads: Vec<u8> = log
        .snapshot()
        .into_iter()
        .filter_map(|call| match call {
            Call::CameraTexture { marker, .. } => Some(marker),
            _ => None,
        })
        .collect();
    assert_eq!(uploads, vec![10]);
    assert_eq!(engine.stats().frames_dropped, 9);
    shutdown(engine, &events);
}

#[test]
fn preview_loss_shuts_the_engine_down() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let mut engine = engine(
        &dir,
        &log,
        FakeOptions {
            lose_preview_after: Some(1),
            ..FakeOptions::default()
        },
    );
    let events = engine.listen();
    engine.start().unwrap();
    assert_eq!(next_event(&events), EngineEvent::Ready);

    render(&engine, 1, 0);
    engine.frame_producer().push(camera_image(2, 1)).unwrap();
    assert_eq!(
        next_event(&events),
        EngineEvent::Finished(FinishReason::SurfaceLost)
    );
    engine.join().unwrap();
    assert_eq!(engine.state(), EngineState::Terminated);
    assert_eq!(log.snapshot().last(), Some(&Call::Release));
}

#[test]
fn matching_sizes_blit_instead_of_redrawing() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let mut config = engine_config(dir.path());
    config.preview_size = (16, 16);
    config.copy_strategy = CopyStrategy::Blit;
    let mut engine = RenderEngine::new(
        config,
        FakeBackend::with_options(
            log.clone(),
            FakeOptions {
                framebuffer_blit: true,
                ..FakeOptions::default()
            },
        ),
        LoggingEncoder::new(log.clone()),
        PassthroughBinder,
    );
    let events = engine.listen();
    engine.start().unwrap();
    assert_eq!(next_event(&events), EngineEvent::Ready);

    engine.start_recording(dir.path().join("blit.y4m")).unwrap();
    render(&engine, 3, 0);
    engine.stop_recording().unwrap();

    assert_eq!(log.count(|call| matches!(call, Call::Blit { .. })), 1);
    assert_eq!(log.count(|call| matches!(call, Call::Draw { .. })), 1);
    shutdown(engine, &events);
}

#[test]
fn redraw_targets_the_recording_surface() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let (engine, events) = started(&dir, &log);
    engine.start_recording(dir.path().join("redraw.y4m")).unwrap();
    render(&engine, 3, 0);
    engine.stop_recording().unwrap();

    let preview = preview_id(&log);
    let draws: Vec<(SurfaceId, Viewport)> = log
        .snapshot()
        .into_iter()
        .filter_map(|call| match call {
            Call::Draw { surface, viewport } => Some((surface, viewport)),
            _ => None,
        })
        .collect();
    assert_eq!(draws.len(), 2);
    assert_eq!(draws[0], (preview, Viewport::new(8, 0, 48, 48)));
    assert_ne!(draws[1].0, preview);
    assert_eq!(draws[1].1, Viewport::full((16, 16)));
    assert_eq!(log.count(|call| matches!(call, Call::Blit { .. })), 0);
    shutdown(engine, &events);
}

#[test]
fn preview_letterboxes_against_reported_viewport() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let (engine, events) = started(&dir, &log);
    engine.update_viewport(32, 16);
    render(&engine, 1, 0);

    let viewport = log
        .snapshot()
        .into_iter()
        .find_map(|call| match call {
            Call::Draw { viewport, .. } => Some(viewport),
            _ => None,
        })
        .unwrap();
    assert_eq!(viewport, Viewport::new(8, 0, 16, 16));
    shutdown(engine, &events);
}

#[test]
fn presentation_times_follow_camera_timestamps() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let (engine, events) = started(&dir, &log);
    engine.start_recording(dir.path().join("pts.y4m")).unwrap();
    render(&engine, 1, 1_000);
    render(&engine, 2, 34_000_000);
    engine.stop_recording().unwrap();

    let stamps: Vec<i64> = log
        .snapshot()
        .into_iter()
        .filter_map(|call| match call {
            Call::PresentationTime { nanos, .. } => Some(nanos),
            _ => None,
        })
        .collect();
    assert_eq!(stamps, vec![1_000, 34_000_000]);
    shutdown(engine, &events);
}

#[test]
fn rejected_frames_end_the_session_but_not_the_preview() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let mut engine = RenderEngine::new(
        engine_config(dir.path()),
        FakeBackend::new(log.clone()),
        RejectingEncoder::new(log.clone()),
        PassthroughBinder,
    );
    let events = engine.listen();
    engine.start().unwrap();
    assert_eq!(next_event(&events), EngineEvent::Ready);

    let output = dir.path().join("partial.bin");
    engine.start_recording(&output).unwrap();
    render(&engine, 1, 0);
    match next_event(&events) {
        EngineEvent::RecordingFailed(message) => assert!(message.contains("codec went away")),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!engine.is_recording());
    assert_eq!(fs::read(&output).unwrap(), b"partial");

    render(&engine, 2, 33_000_000);
    assert_eq!(engine.state(), EngineState::Running);
    shutdown(engine, &events);
}

#[test]
fn thirty_frames_with_a_twenty_frame_recording() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let (engine, events) = started(&dir, &log);
    let output = dir.path().join("session.y4m");

    for index in 0..30i64 {
        if index == 5 {
            engine.start_recording(&output).unwrap();
        }
        if index == 25 {
            let outcome = engine.stop_recording().unwrap().unwrap();
            assert_eq!(outcome.frames, 20);
        }
        render(&engine, index as u8, index * 33_000_000);
    }

    let info = Y4mInfo::read(&output).unwrap();
    assert_eq!((info.width, info.height, info.frame_rate), (16, 16, 30));
    assert!(
        (18..=22).contains(&info.frames),
        "expected about 20 frames, got {}",
        info.frames
    );
    assert_eq!(engine.stats().frames_rendered, 30);
    shutdown(engine, &events);
}

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn other_threads_can_query_and_stop_the_engine() {
    assert_send_sync::<RenderEngine>();
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let (engine, events) = started(&dir, &log);
    engine.start_recording(dir.path().join("shared.y4m")).unwrap();
    render(&engine, 1, 0);

    thread::scope(|scope| {
        scope.spawn(|| {
            assert!(engine.is_recording());
            engine.request_shutdown();
        });
    });
    assert_eq!(shutdown(engine, &events), FinishReason::Requested);
    assert_eq!(Y4mInfo::read(&dir.path().join("shared.y4m")).unwrap().frames, 1);
}

#[test]
fn stop_after_shutdown_returns_the_finalized_recording() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let (engine, events) = started(&dir, &log);
    let output = dir.path().join("late-stop.y4m");
    engine.start_recording(&output).unwrap();
    render(&engine, 1, 0);
    render(&engine, 2, 33_000_000);

    let engine = Arc::new(engine);
    engine.request_shutdown();
    let (done, stopped) = bounded(1);
    let stopper = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || done.send(engine.stop_recording()).unwrap())
    };
    let outcome = stopped
        .recv_timeout(EVENT_TIMEOUT)
        .expect("stop_recording blocked behind shutdown")
        .unwrap()
        .expect("shutdown finalized the active recording");
    stopper.join().unwrap();

    assert_eq!(outcome.path, output);
    assert_eq!(outcome.frames, 2);
    assert_eq!(Y4mInfo::read(&output).unwrap().frames, 2);
    assert!(engine.stop_recording().unwrap().is_none());
    assert!(!engine.is_recording());

    let engine = Arc::try_unwrap(engine).ok().expect("engine is still shared");
    assert_eq!(shutdown(engine, &events), FinishReason::Requested);
}

#[test]
fn start_after_shutdown_is_refused() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let (engine, events) = started(&dir, &log);
    engine.request_shutdown();

    assert!(matches!(
        engine.start_recording(dir.path().join("never.y4m")),
        Err(EngineError::NotRunning)
    ));
    assert_eq!(engine.recording_phase(), RecordingPhase::Idle);
    assert!(engine.stop_recording().unwrap().is_none());
    assert_eq!(shutdown(engine, &events), FinishReason::Requested);
}

#[test]
fn recording_requests_racing_shutdown_always_return() {
    for round in 0..20 {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let (engine, events) = started(&dir, &log);
        let output = dir.path().join(format!("race-{round}.y4m"));
        let engine = Arc::new(engine);

        let (done, answered) = bounded(1);
        let requester = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let started = engine.start_recording(&output);
                let stopped = engine.stop_recording();
                done.send((started, stopped)).unwrap();
            })
        };
        engine.request_shutdown();
        let (started, stopped) = answered
            .recv_timeout(EVENT_TIMEOUT)
            .expect("recording request blocked behind shutdown");
        requester.join().unwrap();

        match started {
            Ok(()) | Err(EngineError::NotRunning) => {}
            Err(other) => panic!("unexpected start error {other:?}"),
        }
        assert!(stopped.is_ok());
        assert!(!engine.is_recording());

        let engine = Arc::try_unwrap(engine).ok().expect("engine is still shared");
        assert_eq!(shutdown(engine, &events), FinishReason::Requested);
    }
}
