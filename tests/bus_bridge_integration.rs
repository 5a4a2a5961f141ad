//! Integration tests for the bridge, the bus and the consumers
//!
//! These tests cover the path a frame takes once the driver hands it over:
//! - Driver-thread callbacks sampled and handed off to the bus
//! - Consumers competing for a topic
//! - A consumer carrying on after a failed external call

#![cfg(feature = "mock-device")]

mod common;

use aria_relay::backend::StreamObserver;
use aria_relay::config::{InferenceSettings, StreamingSettings};
use aria_relay::pipeline::{
    spawn_consumer, CallbackBridge, ConsumerFactory, Event, EventBus, InferenceForwarder, Payload,
    SessionId, Topic,
};
use aria_relay::types::{CameraId, CaptureRecord, ImageView, Rotation};
use common::builders::frame_sample;
use common::mock_helpers::RecordingConsumer;
use common::{eventually, test_timeout};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_driver_thread_callbacks_sampled_in_order() {
    let bus = EventBus::new();
    let streaming = StreamingSettings {
        sample_divisor: 30,
        rotation: Rotation::None,
        ..StreamingSettings::default()
    };
    let bridge = Arc::new(CallbackBridge::new(
        bus.spawn_handoff(),
        SessionId(1),
        &streaming,
        vec![Topic::FRAME],
    ));

    let driver_bridge = Arc::clone(&bridge);
    std::thread::spawn(move || {
        let buffer = vec![7u8; 4 * 2 * 3];
        for frame_number in 1..=100 {
            let record = CaptureRecord {
                camera: CameraId::Rgb,
                capture_timestamp_ns: frame_number as i64,
                frame_number,
            };
            driver_bridge.on_image_received(ImageView::new(4, 2, &buffer), &record);
        }
    })
    .join()
    .unwrap();

    let mut frames = bus.subscribe(Topic::FRAME);
    let mut indices = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(test_timeout(), frames.next())
            .await
            .unwrap()
            .unwrap();
        indices.push(event.payload().frame().unwrap().sample_index);
    }
    assert_eq!(indices, vec![30, 60, 90]);
    assert_eq!(bridge.stats().forwarded, 3);
    assert_eq!(bus.stats(Topic::FRAME).depth, 0);
}

#[tokio::test]
async fn test_competing_consumers_split_a_topic() {
    let bus = EventBus::new();
    let cancel = CancellationToken::new();

    let (first, mut first_seen) = RecordingConsumer::new(Topic::FRAME);
    let (second, mut second_seen) = RecordingConsumer::new(Topic::FRAME);
    let first = spawn_consumer(Box::new(first), &bus, SessionId(1), cancel.clone());
    let second = spawn_consumer(Box::new(second), &bus, SessionId(1), cancel.clone());

    for index in 1..=20 {
        let payload = Payload::Frame {
            session: SessionId(1),
            sample: frame_sample(2, 2, index),
        };
        bus.publish(Topic::FRAME, payload).unwrap();
    }

    eventually(|| bus.stats(Topic::FRAME).depth == 0).await;
    cancel.cancel();
    let handled = first.await.unwrap().handled + second.await.unwrap().handled;
    assert_eq!(handled, 20);

    // Each event went to exactly one of them
    let mut seen = Vec::new();
    while let Ok(event) = first_seen.try_recv() {
        seen.push(event.payload().frame().unwrap().sample_index);
    }
    while let Ok(event) = second_seen.try_recv() {
        seen.push(event.payload().frame().unwrap().sample_index);
    }
    seen.sort_unstable();
    assert_eq!(seen, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_inference_consumer_survives_failed_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/infer/"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/infer/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "detections": [{"class_name": "person", "confidence": 0.97}]
        })))
        .mount(&server)
        .await;

    let settings = InferenceSettings {
        endpoint: format!("{}/infer/", server.uri()),
        backoff_ms: 0,
        ..InferenceSettings::default()
    };
    let factory = InferenceForwarder::factory(&settings).unwrap();

    let bus = EventBus::new();
    let cancel = CancellationToken::new();
    let consumer = spawn_consumer(factory.create(), &bus, SessionId(4), cancel.clone());

    for index in [30, 60] {
        bus.publish_event(Event::new(
            Topic::FRAME,
            Payload::Frame {
                session: SessionId(4),
                sample: frame_sample(16, 16, index),
            },
        ))
        .unwrap();
    }

    tokio::time::timeout(test_timeout(), async {
        loop {
            let received = server.received_requests().await.unwrap_or_default();
            if received.len() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("second frame never reached the inference service");

    // Let the second response be processed before stopping
    eventually(|| bus.stats(Topic::FRAME).depth == 0).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    cancel.cancel();

    let stats = consumer.await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.stale, 0);
}
