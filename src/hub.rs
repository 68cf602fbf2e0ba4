//! Typed-topic event hub: per-topic log ring buffers plus live fan-out
//!
//! Every captured output line flows through here twice over: appended to the
//! topic's bounded ring buffer (the source of truth for replay) and pushed to
//! all live subscribers. Both happen under the same lock, which is what makes
//! the replay-then-live seam exact: a subscriber snapshots the buffer and
//! registers its receiver atomically, so an entry published concurrently with
//! the subscribe lands in the live stream, never dropped and never doubled.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::models::{LogEntry, SessionState};
use crate::utils::lock_mutex_recover;

/// Default number of log entries retained per topic
pub const DEFAULT_LOG_CAPACITY: usize = 100;

/// Bounded per-subscription buffering; slow consumers observe a lag marker
/// instead of blocking the producer
const BROADCAST_CAPACITY: usize = 512;

/// Addressing key for publish/subscribe
///
/// A typed topic instead of composed string keys: process logs and assistant
/// output cannot collide no matter what the caller names things.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Dev-server output for one project, keyed by project name
    ProcessLog(String),
    /// Assistant output for one invocation, keyed by session id
    AssistantOutput(String),
}

/// One event delivered to live subscribers of a topic
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A captured output line (also appended to the ring buffer)
    Log(LogEntry),
    /// Terminal event for a process topic
    ProcessExited {
        exit_code: Option<i32>,
        forced: bool,
    },
    /// Terminal event for an assistant topic
    SessionComplete {
        state: SessionState,
        result: Option<String>,
        error: Option<String>,
    },
}

struct TopicChannel {
    buffer: VecDeque<LogEntry>,
    tx: broadcast::Sender<StreamEvent>,
}

impl TopicChannel {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            buffer: VecDeque::new(),
            tx,
        }
    }
}

/// A live observer's registration against a topic
///
/// `backlog` is the buffer snapshot taken at subscribe time; `rx` yields only
/// events published after that point. Dropping the receiver is the
/// unsubscribe path; it never affects other subscriptions or the buffer.
pub struct Subscription {
    pub backlog: Vec<LogEntry>,
    pub rx: broadcast::Receiver<StreamEvent>,
}

/// Per-topic log history and live event fan-out
pub struct EventHub {
    capacity: usize,
    topics: Mutex<HashMap<Topic, TopicChannel>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            // A zero-capacity buffer would still hold the entry just pushed;
            // one is the smallest honest history
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Append a log entry to the topic's ring buffer and fan it out to live
    /// subscribers. Creates the topic lazily on first output. O(1) amortized;
    /// the oldest entry is evicted once the buffer is at capacity.
    pub fn append_log(&self, topic: &Topic, entry: LogEntry) {
        let mut topics = lock_mutex_recover(&self.topics);
        let channel = topics
            .entry(topic.clone())
            .or_insert_with(TopicChannel::new);
        if channel.buffer.len() >= self.capacity {
            channel.buffer.pop_front();
        }
        channel.buffer.push_back(entry.clone());
        // No receivers is fine; the buffer already has the entry
        let _ = channel.tx.send(StreamEvent::Log(entry));
    }

    /// Fan out a lifecycle event to live subscribers without buffering it.
    /// Late joiners synthesize terminals from status instead of replay.
    pub fn publish(&self, topic: &Topic, event: StreamEvent) {
        let mut topics = lock_mutex_recover(&self.topics);
        let channel = topics
            .entry(topic.clone())
            .or_insert_with(TopicChannel::new);
        let _ = channel.tx.send(event);
    }

    /// Up to `limit` most recent entries in chronological order; empty for an
    /// unknown topic. Never blocks and never creates the topic.
    pub fn replay(&self, topic: &Topic, limit: usize) -> Vec<LogEntry> {
        let topics = lock_mutex_recover(&self.topics);
        match topics.get(topic) {
            Some(channel) => {
                let skip = channel.buffer.len().saturating_sub(limit);
                channel.buffer.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Snapshot the backlog and register a live receiver atomically
    pub fn subscribe(&self, topic: &Topic) -> Subscription {
        let mut topics = lock_mutex_recover(&self.topics);
        let channel = topics
            .entry(topic.clone())
            .or_insert_with(TopicChannel::new);
        Subscription {
            backlog: channel.buffer.iter().cloned().collect(),
            rx: channel.tx.subscribe(),
        }
    }

    /// Drop a topic's history. The live channel stays up; subscribers keep
    /// receiving events published after the clear.
    pub fn clear(&self, topic: &Topic) {
        let mut topics = lock_mutex_recover(&self.topics);
        if let Some(channel) = topics.get_mut(topic) {
            channel.buffer.clear();
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StreamKind;

    fn topic(key: &str) -> Topic {
        Topic::ProcessLog(key.to_string())
    }

    fn entry(text: &str) -> LogEntry {
        LogEntry::stdout(text)
    }

    #[test]
    fn test_replay_unknown_topic_is_empty() {
        let hub = EventHub::default();
        assert!(hub.replay(&topic("nope"), 100).is_empty());
    }

    #[test]
    fn test_append_preserves_order() {
        let hub = EventHub::default();
        let t = topic("svc");
        for text in ["a", "b", "c"] {
            hub.append_log(&t, entry(text));
        }
        let texts: Vec<_> = hub
            .replay(&t, 100)
            .into_iter()
            .map(|e| e.text)
            .collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_order_independent_of_other_topics() {
        let hub = EventHub::default();
        let t1 = topic("svc-1");
        let t2 = topic("svc-2");
        hub.append_log(&t1, entry("a"));
        hub.append_log(&t2, entry("x"));
        hub.append_log(&t1, entry("b"));
        hub.append_log(&t2, entry("y"));
        hub.append_log(&t1, entry("c"));

        let texts: Vec<_> = hub.replay(&t1, 100).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_eviction_keeps_most_recent() {
        let hub = EventHub::new(3);
        let t = topic("svc");
        for i in 0..5 {
            hub.append_log(&t, entry(&format!("line-{}", i)));
        }
        let texts: Vec<_> = hub.replay(&t, 100).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["line-2", "line-3", "line-4"]);
    }

    #[test]
    fn test_replay_limit_returns_most_recent() {
        let hub = EventHub::default();
        let t = topic("svc");
        for i in 0..10 {
            hub.append_log(&t, entry(&format!("line-{}", i)));
        }
        let texts: Vec<_> = hub.replay(&t, 2).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["line-8", "line-9"]);
    }

    #[tokio::test]
    async fn test_subscribe_backlog_then_live() {
        let hub = EventHub::default();
        let t = topic("svc");
        hub.append_log(&t, entry("old-1"));
        hub.append_log(&t, entry("old-2"));

        let mut sub = hub.subscribe(&t);
        assert_eq!(sub.backlog.len(), 2);

        hub.append_log(&t, entry("new-1"));
        match sub.rx.recv().await.unwrap() {
            StreamEvent::Log(e) => assert_eq!(e.text, "new-1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_retroactive_delivery() {
        let hub = EventHub::default();
        let t = topic("svc");
        hub.append_log(&t, entry("before"));

        let mut sub = hub.subscribe(&t);
        hub.append_log(&t, entry("after"));

        // "before" arrives only via the backlog
        let backlog: Vec<_> = sub.backlog.iter().map(|e| e.text.clone()).collect();
        assert_eq!(backlog, vec!["before"]);
        match sub.rx.recv().await.unwrap() {
            StreamEvent::Log(e) => assert_eq!(e.text, "after"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fanout_to_multiple_subscribers() {
        let hub = EventHub::default();
        let t = topic("svc");
        let mut sub1 = hub.subscribe(&t);
        let mut sub2 = hub.subscribe(&t);

        hub.append_log(&t, entry("hello"));

        for sub in [&mut sub1, &mut sub2] {
            match sub.rx.recv().await.unwrap() {
                StreamEvent::Log(e) => assert_eq!(e.text, "hello"),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_disturb_others() {
        let hub = EventHub::default();
        let t = topic("svc");
        let sub1 = hub.subscribe(&t);
        let mut sub2 = hub.subscribe(&t);
        drop(sub1);

        hub.append_log(&t, entry("still-here"));
        match sub2.rx.recv().await.unwrap() {
            StreamEvent::Log(e) => assert_eq!(e.text, "still-here"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(hub.replay(&t, 100).len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_not_buffered() {
        let hub = EventHub::default();
        let t = topic("svc");
        let mut sub = hub.subscribe(&t);
        hub.publish(
            &t,
            StreamEvent::ProcessExited {
                exit_code: Some(0),
                forced: false,
            },
        );
        match sub.rx.recv().await.unwrap() {
            StreamEvent::ProcessExited { exit_code, forced } => {
                assert_eq!(exit_code, Some(0));
                assert!(!forced);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // Replay sees only log entries
        assert!(hub.replay(&t, 100).is_empty());
    }

    #[test]
    fn test_clear_forgets_history() {
        let hub = EventHub::default();
        let t = topic("svc");
        hub.append_log(&t, entry("a"));
        hub.clear(&t);
        assert!(hub.replay(&t, 100).is_empty());
    }

    #[tokio::test]
    async fn test_clear_leaves_live_subscriptions_intact() {
        let hub = EventHub::default();
        let t = topic("svc");
        hub.append_log(&t, entry("before"));

        let mut sub = hub.subscribe(&t);
        hub.clear(&t);
        hub.append_log(&t, entry("after-clear"));

        match sub.rx.recv().await.unwrap() {
            StreamEvent::Log(e) => assert_eq!(e.text, "after-clear"),
            other => panic!("unexpected event: {:?}", other),
        }
        // History restarted from the clear
        let texts: Vec<_> = hub.replay(&t, 100).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["after-clear"]);
    }

    #[test]
    fn test_zero_capacity_clamped_to_one() {
        let hub = EventHub::new(0);
        let t = topic("svc");
        hub.append_log(&t, entry("only"));
        hub.append_log(&t, entry("newest"));
        let texts: Vec<_> = hub.replay(&t, 100).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["newest"]);
    }

    /// Publish from another task while subscribing in a loop; the merged
    /// backlog + live sequence must have every number exactly once.
    #[tokio::test]
    async fn test_seam_has_no_gap_and_no_duplicate() {
        use std::sync::Arc;

        let hub = Arc::new(EventHub::new(10_000));
        let t = topic("svc");
        let total = 500usize;

        let producer = {
            let hub = hub.clone();
            let t = t.clone();
            tokio::spawn(async move {
                for i in 0..total {
                    hub.append_log(&t, LogEntry::new(StreamKind::Stdout, i.to_string()));
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        // Subscribe mid-publish
        tokio::task::yield_now().await;
        let mut sub = hub.subscribe(&t);

        let mut seen: Vec<usize> = sub
            .backlog
            .iter()
            .map(|e| e.text.parse().unwrap())
            .collect();
        while seen.len() < total {
            match sub.rx.recv().await.unwrap() {
                StreamEvent::Log(e) => seen.push(e.text.parse().unwrap()),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        producer.await.unwrap();

        let expected: Vec<usize> = (0..total).collect();
        assert_eq!(seen, expected);
    }
}
