//! InferenceForwarder: posts sampled frames to the object detection service.
//!
//! Each frame is JPEG-encoded and uploaded as the multipart field `file`
//! (`image.jpg`, `image/jpeg`). The service answers with
//! `{"detections": [{"class_name": ..., "confidence": ...}]}`, which is logged.
//!
//! An unreachable service or a timed-out request is transient: the runner
//! pauses for `inference.backoff_ms` before taking the next frame. A non-success
//! status is logged and the next frame is sent right away.

use super::{encode_jpeg, Consumer, ConsumerError, ConsumerFactory, ConsumerPolicy};
use crate::config::InferenceSettings;
use crate::error::{RelayError, Result};
use crate::pipeline::event::{Event, Topic};
use crate::types::{Detection, InferenceResponse};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::time::Duration;

/// Consumer that forwards frames to the inference service
pub struct InferenceForwarder {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    topic: Topic,
    request_timeout: Duration,
    backoff: Duration,
    jpeg_quality: u8,
}

fn parse_endpoint(settings: &InferenceSettings) -> Result<reqwest::Url> {
    reqwest::Url::parse(&settings.endpoint).map_err(|e| {
        RelayError::Config(format!(
            "Invalid inference endpoint {:?}: {}",
            settings.endpoint, e
        ))
    })
}

impl InferenceForwarder {
    pub fn new(client: reqwest::Client, settings: &InferenceSettings) -> Result<Self> {
        let endpoint = parse_endpoint(settings)?;
        Ok(Self::with_endpoint(client, endpoint, settings))
    }

    fn with_endpoint(
        client: reqwest::Client,
        endpoint: reqwest::Url,
        settings: &InferenceSettings,
    ) -> Self {
        Self {
            client,
            endpoint,
            topic: Topic::FRAME,
            request_timeout: settings.request_timeout(),
            backoff: settings.backoff(),
            jpeg_quality: settings.jpeg_quality,
        }
    }

    /// Consume from another topic than `frame`
    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = topic;
        self
    }

    /// Build a factory that shares one HTTP client across pipeline runs
    pub fn factory(settings: &InferenceSettings) -> Result<impl ConsumerFactory> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let endpoint = parse_endpoint(settings)?;
        let settings = settings.clone();

        Ok(move || -> Box<dyn Consumer> {
            Box::new(Self::with_endpoint(client.clone(), endpoint.clone(), &settings))
        })
    }

    fn classify(&self, err: reqwest::Error) -> ConsumerError {
        if err.is_timeout() {
            ConsumerError::Timeout(self.request_timeout)
        } else {
            ConsumerError::Unreachable(format!("{}: {}", self.endpoint, err))
        }
    }

    /// Upload one JPEG and parse the detections
    pub async fn infer(
        &self,
        jpeg: Vec<u8>,
    ) -> std::result::Result<InferenceResponse, ConsumerError> {
        let part = Part::bytes(jpeg)
            .file_name("image.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| ConsumerError::Encode(e.to_string()))?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(self.endpoint.clone())
            .multipart(form)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConsumerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<InferenceResponse>()
            .await
            .map_err(|e| ConsumerError::Decode(e.to_string()))
    }
}

fn describe(detections: &[Detection]) -> String {
    detections
        .iter()
        .map(|d| format!("{} ({:.2})", d.class_name, d.confidence))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl Consumer for InferenceForwarder {
    fn name(&self) -> &str {
        "InferenceForwarder"
    }

    fn topic(&self) -> Topic {
        self.topic.clone()
    }

    fn policy(&self) -> ConsumerPolicy {
        ConsumerPolicy {
            // The request carries its own timeout; this only catches encoding stalls
            call_timeout: Some(self.request_timeout + Duration::from_secs(1)),
            backoff: self.backoff,
        }
    }

    async fn handle(&mut self, event: Event) -> std::result::Result<(), ConsumerError> {
        let Some(frame) = event.payload().frame() else {
            return Err(ConsumerError::UnexpectedPayload(event.topic().clone()));
        };

        let jpeg = encode_jpeg(&frame.image, self.jpeg_quality)?;
        let response = self.infer(jpeg).await?;

        if response.detections.is_empty() {
            tracing::debug!("Sample {}: no detections", frame.sample_index);
        } else {
            tracing::info!(
                "Sample {}: {}",
                frame.sample_index,
                describe(&response.detections)
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::Payload;
    use crate::pipeline::id::SessionId;
    use crate::types::{CameraId, CaptureRecord, FrameSample};
    use image::RgbImage;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn frame_event() -> Event {
        Event::new(
            Topic::FRAME,
            Payload::Frame {
                session: SessionId(1),
                sample: Arc::new(FrameSample {
                    image: RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30])),
                    record: CaptureRecord {
                        camera: CameraId::Rgb,
                        capture_timestamp_ns: 0,
                        frame_number: 30,
                    },
                    sample_index: 30,
                }),
            },
        )
    }

    fn settings(endpoint: String) -> InferenceSettings {
        InferenceSettings {
            endpoint,
            request_timeout_ms: 500,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_posts_multipart_jpeg() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "detections": [{"class_name": "cup", "confidence": 0.91}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut forwarder =
            InferenceForwarder::new(
                reqwest::Client::new(),
                &settings(format!("{}/infer/", server.uri())),
            )
                .unwrap();
        forwarder.handle(frame_event()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("name=\"file\""));
        assert!(body.contains("filename=\"image.jpg\""));
        assert!(body.contains("image/jpeg"));
    }

    #[tokio::test]
    async fn test_non_success_is_rejected_not_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let mut forwarder =
            InferenceForwarder::new(reqwest::Client::new(), &settings(server.uri())).unwrap();
        let err = forwarder.handle(frame_event()).await.unwrap_err();
        assert!(matches!(err, ConsumerError::Rejected { status: 503, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transient() {
        // Bind then drop to get a port nothing listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let mut forwarder = InferenceForwarder::new(
            reqwest::Client::new(),
            &settings(format!("http://127.0.0.1:{}/infer/", port)),
        )
        .unwrap();
        let err = forwarder.handle(frame_event()).await.unwrap_err();
        assert!(err.is_transient(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_slow_service_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"detections": []}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let mut forwarder =
            InferenceForwarder::new(reqwest::Client::new(), &settings(server.uri())).unwrap();
        let err = forwarder.handle(frame_event()).await.unwrap_err();
        assert!(matches!(err, ConsumerError::Timeout(_)));
    }

    #[test]
    fn test_factory_rejects_bad_endpoint() {
        assert!(InferenceForwarder::factory(&settings("::nope".to_string())).is_err());
    }

    #[test]
    fn test_describe_detections() {
        let detections = vec![
            Detection {
                class_name: "person".into(),
                confidence: 0.9,
            },
            Detection {
                class_name: "chair".into(),
                confidence: 0.5,
            },
        ];
        assert_eq!(describe(&detections), "person (0.90), chair (0.50)");
    }
}
