//! Topic-keyed event bus.
//!
//! The bus holds one FIFO queue per topic. Queues are created on first
//! reference and live as long as the bus; a topic name always resolves to the
//! same queue.
//!
//! # Delivery
//!
//! Subscribers of the same topic **compete** for events: each event is handed
//! to whichever subscriber polls next (work-queue semantics). Code that needs
//! the same frame in two places publishes it to two topics instead; see
//! [`CallbackBridge`](crate::pipeline::CallbackBridge).
//!
//! There is no acknowledgement, replay or persistence. An event taken by a
//! consumer that then fails is gone.
//!
//! # Capacity
//!
//! Queues are unbounded by default, so a stalled consumer grows memory without
//! limit. With `bus.queue_capacity` set, publishing onto a full topic drops the
//! new event and returns [`PipelineError::QueueFull`].
//!
//! # Foreign threads
//!
//! Code running on a thread the scheduler does not own never touches the bus
//! directly. It posts through a [`Handoff`], whose pump task runs on the
//! scheduler and performs the publish there.

use crate::config::BusSettings;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::event::{Event, Payload, Topic};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Infinite stream of events for one topic.
pub type Subscription = BoxStream<'static, Event>;

/// Per-topic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicStats {
    /// Events accepted into the queue
    pub published: u64,
    /// Events rejected because the queue was full
    pub dropped: u64,
    /// Events waiting for a subscriber
    pub depth: usize,
}

struct TopicQueue {
    tx: mpsc::UnboundedSender<Event>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Event>>,
    depth: AtomicUsize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl TopicQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: AsyncMutex::new(rx),
            depth: AtomicUsize::new(0),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: Event, capacity: Option<usize>) -> PipelineResult<()> {
        if let Some(capacity) = capacity {
            if self.depth.load(Ordering::Acquire) >= capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(PipelineError::QueueFull {
                    topic: event.topic().clone(),
                });
            }
        }

        self.depth.fetch_add(1, Ordering::AcqRel);
        // The receiver lives inside this queue, so the send cannot fail.
        let _ = self.tx.send(event);
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Wait for the next event. Cancel safe: dropping the future before it
    /// completes never loses an event.
    async fn pop(&self) -> Option<Event> {
        let mut rx = self.rx.lock().await;
        let event = rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(event)
    }

    fn stats(&self) -> TopicStats {
        TopicStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            depth: self.depth.load(Ordering::Acquire),
        }
    }
}

struct BusInner {
    topics: Mutex<HashMap<Topic, Arc<TopicQueue>>>,
    capacity: Option<usize>,
}

/// Topic-keyed multi-producer/multi-consumer queue set.
///
/// Cloning is cheap; clones share the same queues.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topics())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl EventBus {
    /// Create a bus with unbounded queues
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Create a bus whose queues hold at most `capacity` events each
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    pub fn with_settings(settings: &BusSettings) -> Self {
        Self::with_capacity(settings.queue_capacity)
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: Mutex::new(HashMap::new()),
                capacity,
            }),
        }
    }

    fn queue(&self, topic: &Topic) -> Arc<TopicQueue> {
        let mut topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.clone())
            .or_insert_with(|| {
                tracing::trace!("Creating queue for topic {}", topic);
                Arc::new(TopicQueue::new())
            })
            .clone()
    }

    /// Enqueue an event and return. Never waits for consumers.
    pub fn publish(&self, topic: Topic, payload: Payload) -> PipelineResult<()> {
        self.publish_event(Event::new(topic, payload))
    }

    /// Enqueue a prebuilt event
    pub fn publish_event(&self, event: Event) -> PipelineResult<()> {
        let queue = self.queue(event.topic());
        queue.push(event, self.inner.capacity)
    }

    /// Subscribe to a topic.
    ///
    /// The returned stream is lazy (nothing is taken from the queue until it is
    /// polled) and never ends. Each call creates an independent cursor that
    /// competes with every other subscriber of the topic.
    pub fn subscribe(&self, topic: impl Into<Topic>) -> Subscription {
        let queue = self.queue(&topic.into());
        stream::unfold(queue, |queue| async move {
            let event = queue.pop().await?;
            Some((event, queue))
        })
        .boxed()
    }

    /// Counters for a topic (creates the topic if it does not exist yet)
    pub fn stats(&self, topic: impl Into<Topic>) -> TopicStats {
        self.queue(&topic.into()).stats()
    }

    /// Topics referenced so far
    pub fn topics(&self) -> Vec<Topic> {
        let topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<Topic> = topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Create a handoff and the pump that drains it into this bus.
    ///
    /// The pump must run on the scheduler; it finishes once every [`Handoff`]
    /// clone has been dropped.
    pub fn handoff(&self) -> (Handoff, HandoffPump) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Handoff { tx },
            HandoffPump {
                rx,
                bus: self.clone(),
            },
        )
    }

    /// Create a handoff whose pump is spawned on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn_handoff(&self) -> Handoff {
        let (handoff, pump) = self.handoff();
        tokio::spawn(pump.run());
        handoff
    }
}

/// Thread-safe entry point into the scheduler.
///
/// `post` never blocks and may be called from any thread, including driver
/// callback threads.
#[derive(Debug, Clone)]
pub struct Handoff {
    tx: mpsc::UnboundedSender<Event>,
}

impl Handoff {
    /// Queue an event for publication on the scheduler thread
    pub fn post(&self, event: Event) -> PipelineResult<()> {
        self.tx.send(event).map_err(|_| PipelineError::HandoffClosed)
    }

    /// Whether the pump has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Scheduler-side half of a [`Handoff`].
pub struct HandoffPump {
    rx: mpsc::UnboundedReceiver<Event>,
    bus: EventBus,
}

impl HandoffPump {
    /// Publish handed-off events until every sender is gone
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            if let Err(e) = self.bus.publish_event(event) {
                tracing::warn!("Dropping handed-off event: {}", e);
            }
        }
        tracing::trace!("Handoff pump finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::id::SessionId;
    use crate::types::StreamingErrorCode;
    use std::time::Duration;
    use tokio::time::timeout;

    fn failure(n: usize) -> Payload {
        Payload::StreamFailure {
            session: SessionId(1),
            code: StreamingErrorCode::Internal,
            message: n.to_string(),
        }
    }

    fn message_of(event: &Event) -> String {
        match event.payload() {
            Payload::StreamFailure { message, .. } => message.clone(),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_buffered_events_arrive_in_publish_order() {
        let bus = EventBus::new();
        for i in 0..5 {
            bus.publish(Topic::STREAM_FAILURE, failure(i)).unwrap();
        }

        let mut sub = bus.subscribe(Topic::STREAM_FAILURE);
        for i in 0..5 {
            let event = sub.next().await.unwrap();
            assert_eq!(message_of(&event), i.to_string());
        }
    }

    #[tokio::test]
    async fn test_topic_resolves_to_same_queue() {
        let bus = EventBus::new();
        bus.publish(Topic::from("a".to_string()), failure(1)).unwrap();
        let _sub = bus.subscribe("a");
        bus.publish(Topic::new("a"), failure(2)).unwrap();

        assert_eq!(bus.topics(), vec![Topic::new("a")]);
        assert_eq!(bus.stats("a").published, 2);
    }

    #[tokio::test]
    async fn test_subscribe_is_lazy() {
        let bus = EventBus::new();
        bus.publish(Topic::FRAME, failure(1)).unwrap();

        let unused = bus.subscribe(Topic::FRAME);
        drop(unused);

        assert_eq!(bus.stats(Topic::FRAME).depth, 1);
        let mut sub = bus.subscribe(Topic::FRAME);
        assert!(sub.next().await.is_some());
        assert_eq!(bus.stats(Topic::FRAME).depth, 0);
    }

    #[tokio::test]
    async fn test_subscribers_compete_for_events() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(Topic::FRAME);
        let mut b = bus.subscribe(Topic::FRAME);

        for i in 0..10 {
            bus.publish(Topic::FRAME, failure(i)).unwrap();
        }

        let mut seen = Vec::new();
        loop {
            let next = tokio::select! {
                Some(e) = a.next() => e,
                Some(e) = b.next() => e,
                _ = tokio::time::sleep(Duration::from_millis(50)) => break,
            };
            seen.push(message_of(&next));
        }

        seen.sort_by_key(|s| s.parse::<usize>().unwrap());
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(seen, expected, "each event is delivered exactly once");
    }

    #[tokio::test]
    async fn test_bounded_queue_drops_newest() {
        let bus = EventBus::bounded(2);
        bus.publish(Topic::FRAME, failure(0)).unwrap();
        bus.publish(Topic::FRAME, failure(1)).unwrap();
        let err = bus.publish(Topic::FRAME, failure(2)).unwrap_err();
        assert!(matches!(err, PipelineError::QueueFull { .. }));

        let stats = bus.stats(Topic::FRAME);
        assert_eq!(stats.published, 2);
        assert_eq!(stats.dropped, 1);

        let mut sub = bus.subscribe(Topic::FRAME);
        assert_eq!(message_of(&sub.next().await.unwrap()), "0");
        assert_eq!(message_of(&sub.next().await.unwrap()), "1");

        // Room again after draining
        bus.publish(Topic::FRAME, failure(3)).unwrap();
    }

    #[tokio::test]
    async fn test_handoff_from_foreign_thread() {
        let bus = EventBus::new();
        let handoff = bus.spawn_handoff();

        let producer = std::thread::spawn(move || {
            for i in 0..3 {
                handoff
                    .post(Event::new(Topic::STREAM_FAILURE, failure(i)))
                    .unwrap();
            }
        });
        producer.join().unwrap();

        let mut sub = bus.subscribe(Topic::STREAM_FAILURE);
        for i in 0..3 {
            let event = timeout(Duration::from_secs(1), sub.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message_of(&event), i.to_string());
        }
    }

    #[tokio::test]
    async fn test_handoff_reports_closed_pump() {
        let bus = EventBus::new();
        let (handoff, pump) = bus.handoff();
        drop(pump);

        assert!(handoff.is_closed());
        let err = handoff
            .post(Event::new(Topic::FRAME, failure(0)))
            .unwrap_err();
        assert!(matches!(err, PipelineError::HandoffClosed));
    }
}
