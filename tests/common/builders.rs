//! Test data builders for creating test objects

use aria_relay::backend::MockDeviceBackend;
use aria_relay::config::{DeviceSettings, PipelineSettings, StreamingSettings};
use aria_relay::pipeline::{ConsumerFactory, EventBus, Supervisor, Topic};
use aria_relay::types::{CameraId, CaptureRecord, FrameSample, Rotation};
use image::RgbImage;
use std::sync::Arc;

/// Builder for pipeline settings tuned for fast tests
pub struct PipelineSettingsBuilder {
    device: DeviceSettings,
    streaming: StreamingSettings,
    frame_topics: Option<Vec<Topic>>,
}

impl PipelineSettingsBuilder {
    pub fn new() -> Self {
        Self {
            device: DeviceSettings::default(),
            streaming: StreamingSettings {
                sample_divisor: 1,
                rotation: Rotation::None,
                ..StreamingSettings::default()
            },
            frame_topics: None,
        }
    }

    pub fn min_battery(mut self, percent: u8) -> Self {
        self.device.min_battery_percent = percent;
        self
    }

    pub fn sample_divisor(mut self, divisor: u64) -> Self {
        self.streaming.sample_divisor = divisor;
        self
    }

    pub fn frame_topics(mut self, topics: Vec<Topic>) -> Self {
        self.frame_topics = Some(topics);
        self
    }

    pub fn build(self) -> PipelineSettings {
        let settings = PipelineSettings::new(self.device, self.streaming);
        match self.frame_topics {
            Some(topics) => settings.with_frame_topics(topics),
            None => settings,
        }
    }
}

/// Builder for a supervisor wired to a simulated device
pub struct SupervisorBuilder {
    backend: MockDeviceBackend,
    settings: PipelineSettings,
    bus: EventBus,
    consumers: Vec<Arc<dyn ConsumerFactory>>,
}

impl SupervisorBuilder {
    pub fn new(backend: MockDeviceBackend) -> Self {
        Self {
            backend,
            settings: PipelineSettingsBuilder::new().build(),
            bus: EventBus::new(),
            consumers: Vec::new(),
        }
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn consumer(mut self, factory: impl ConsumerFactory + 'static) -> Self {
        self.consumers.push(Arc::new(factory));
        self
    }

    pub fn build(self) -> Supervisor {
        let supervisor = Supervisor::new(Arc::new(self.backend), self.bus, self.settings);
        for factory in self.consumers {
            supervisor.add_consumer(factory);
        }
        supervisor
    }
}

/// A solid-colour frame sample
pub fn frame_sample(width: u32, height: u32, sample_index: u64) -> Arc<FrameSample> {
    Arc::new(FrameSample {
        image: RgbImage::from_pixel(width, height, image::Rgb([40, 80, 120])),
        record: CaptureRecord {
            camera: CameraId::Rgb,
            capture_timestamp_ns: sample_index as i64 * 33_000_000,
            frame_number: sample_index,
        },
        sample_index,
    })
}

