//! Lifecycle events fanned out to subscribers (spec.md §4.2, §9 "event fan-out").
//!
//! Each subscriber gets its own unbounded queue so a slow listener never stalls the
//! supervisor — the reference's single blocking subscriber-list is explicitly called out
//! as a defect to avoid.

use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum InstanceEvent {
    Starting { instance_id: String, topic_id: i64 },
    Ready {
        instance_id: String,
        topic_id: i64,
        port: u16,
        session_id: Option<String>,
    },
    Stopped { instance_id: String, topic_id: i64 },
    Crashed {
        instance_id: String,
        topic_id: i64,
        exit_code: Option<i32>,
        will_restart: bool,
    },
    Failed { instance_id: String, topic_id: i64, reason: String },
    IdleTimeout { instance_id: String, topic_id: i64 },
    PortExhausted { topic_id: i64 },
}

/// Non-blocking fan-out: each subscriber receives a clone down its own channel. A full or
/// dropped receiver never blocks delivery to the others.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<mpsc::UnboundedSender<InstanceEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<InstanceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, event: InstanceEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_drops_closed_subscribers_without_affecting_others() {
        let mut bus = EventBus::new();
        let rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();
        drop(rx_a);
        bus.publish(InstanceEvent::Starting {
            instance_id: "i1".into(),
            topic_id: 1,
        });
        assert!(rx_b.try_recv().is_ok());
        assert_eq!(bus.subscribers.len(), 1);
    }
}
