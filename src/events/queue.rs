//! Cross-thread event submission
//!
//! Background threads (microphone capture, stdin reader) cannot await the
//! bus directly. They push events into an unbounded channel through an
//! [`EventSender`]; the coordination task owns the [`EventQueue`] and
//! publishes each event to completion before taking the next one, so the
//! submission order is the delivery order.

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tracing::debug;

use super::{Event, EventBus};

/// Thread-safe handle for submitting events to the coordination task
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Submit an event. Never blocks; safe to call from any thread.
    pub fn send(&self, event: Event) -> Result<()> {
        let kind = event.kind();
        self.tx
            .send(event)
            .map_err(|_| anyhow!("Event queue closed, dropped {}", kind))
    }

    /// Whether the receiving side has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, drained by the coordination task
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventQueue {
    /// Wait for the next submitted event
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take the next event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Publish the next submitted event. Returns `false` once every sender
    /// has been dropped and the queue is empty.
    pub async fn dispatch_next(&mut self, bus: &EventBus) -> bool {
        match self.rx.recv().await {
            Some(event) => {
                debug!("Dispatching {}", event.kind());
                bus.publish(event).await;
                true
            }
            None => false,
        }
    }

    /// Drain the queue until all senders are gone. Returns the number of
    /// events dispatched.
    pub async fn run(mut self, bus: &EventBus) -> usize {
        let mut dispatched = 0;
        while self.dispatch_next(bus).await {
            dispatched += 1;
        }
        dispatched
    }
}

/// Create a sender/queue pair
pub fn channel() -> (EventSender, EventQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventQueue { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_cross_thread_order_preserved() {
        let bus = EventBus::new();
        let (sender, queue) = EventBus::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        bus.subscribe(EventKind::VoiceCommandDetected, "record", move |event| {
            let s = s.clone();
            async move {
                s.lock().unwrap().push(event.str_or("text", "").to_string());
                Ok(())
            }
        });

        let producer = std::thread::spawn(move || {
            for i in 0..50 {
                sender.send(Event::voice_command(format!("cmd {}", i))).unwrap();
            }
        });
        producer.join().unwrap();

        let dispatched = queue.run(&bus).await;
        assert_eq!(dispatched, 50);

        let expected: Vec<String> = (0..50).map(|i| format!("cmd {}", i)).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_send_after_queue_dropped_fails() {
        let (sender, queue) = channel();
        drop(queue);
        assert!(sender.is_closed());
        assert!(sender.send(Event::system_startup()).is_err());
    }

    #[tokio::test]
    async fn test_try_recv() {
        let (sender, mut queue) = channel();
        assert!(queue.try_recv().is_none());
        sender.send(Event::user_emotion("Calm")).unwrap();
        let event = queue.try_recv().unwrap();
        assert_eq!(event.kind(), EventKind::UserEmotionDetected);
    }
}
