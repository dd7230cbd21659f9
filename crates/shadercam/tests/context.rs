mod support;

use std::panic;
use std::thread;

use shadercam::{ContextRequest, FrameProducer, FrameSource, RenderBackend, RenderContext};

use support::{camera_image, Call, CallLog, FakeBackend};

fn context(log: &CallLog) -> RenderContext {
    let backend: Box<dyn RenderBackend> = Box::new(FakeBackend::new(log.clone()));
    RenderContext::create(
        backend,
        &ContextRequest {
            preview_size: (64, 48),
            recordable: true,
        },
    )
    .unwrap()
}

#[test]
fn released_surfaces_let_the_context_go() {
    let log = CallLog::default();
    let mut context = context(&log);
    let preview = context.create_preview_surface().unwrap();
    assert_eq!(context.live_surfaces(), 1);

    let id = preview.id();
    preview.release(&mut context);
    assert_eq!(context.live_surfaces(), 0);
    context.release();

    assert_eq!(
        log.snapshot(),
        vec![Call::CreatePreview(id), Call::DestroySurface(id), Call::Release]
    );
}

#[test]
#[should_panic(expected = "still bound")]
fn releasing_with_a_live_surface_panics() {
    let log = CallLog::default();
    let mut context = context(&log);
    let _preview = context.create_preview_surface().unwrap();
    assert_eq!(context.live_surfaces(), 1);
    context.release();
}

#[test]
#[should_panic(expected = "pull_latest_image")]
fn pulling_frames_off_the_bound_thread_panics() {
    let producer = FrameProducer::new();
    let mut source = FrameSource::bind(&producer);
    producer.push(camera_image(1, 0)).unwrap();

    let log = CallLog::default();
    let pulled = thread::spawn(move || {
        let mut context = context(&log);
        let _ = source.pull_latest_image(&mut context);
    })
    .join();
    if let Err(payload) = pulled {
        panic::resume_unwind(payload);
    }
}

#[test]
fn pulling_on_the_bound_thread_uploads_the_newest_image() {
    let log = CallLog::default();
    let mut context = context(&log);
    let producer = FrameProducer::new();
    let mut source = FrameSource::bind(&producer);
    producer.push(camera_image(1, 10)).unwrap();
    producer.push(camera_image(2, 20)).unwrap();

    let stamp = source.pull_latest_image(&mut context).unwrap().unwrap();
    assert_eq!(stamp.timestamp_ns, 20);
    assert_eq!(stamp.size, (8, 8));
    assert!(source.pull_latest_image(&mut context).unwrap().is_none());
    context.release();
}
