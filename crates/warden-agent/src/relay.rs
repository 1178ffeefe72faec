use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};
use warden_process::{LogLine, ServerId};

const SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Destination for drained lines. Runs on the consumer's thread only.
pub trait LineSink {
    fn deliver(&mut self, server_id: &ServerId, text: &str);
}

impl<F> LineSink for F
where
    F: FnMut(&ServerId, &str),
{
    fn deliver(&mut self, server_id: &ServerId, text: &str) {
        self(server_id, text)
    }
}

pub struct MessageRelay;

impl MessageRelay {
    /// Creates the queue; clone the sender once per producer.
    pub fn bounded(capacity: usize) -> (RelaySender, RelayConsumer) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        (
            RelaySender {
                tx,
                dropped: dropped.clone(),
            },
            RelayConsumer { rx, dropped },
        )
    }
}

#[derive(Clone)]
pub struct RelaySender {
    tx: Sender<LogLine>,
    dropped: Arc<AtomicU64>,
}

impl RelaySender {
    /// Enqueues one line, waiting briefly when the queue is full. Returns
    /// false if the line was dropped.
    pub fn send(&self, server_id: &ServerId, text: impl Into<String>) -> bool {
        let line = LogLine {
            server_id: server_id.clone(),
            text: text.into(),
        };
        let line = match self.tx.try_send(line) {
            Ok(()) => return true,
            Err(TrySendError::Full(line)) => line,
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        match self.tx.send_timeout(line, SEND_TIMEOUT) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // Warn at 1, 2, 4, 8, ... drops.
                if total.is_power_of_two() {
                    tracing::warn!(server_id = %server_id, dropped = total, "relay full; dropping log lines");
                }
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct RelayConsumer {
    rx: Receiver<LogLine>,
    dropped: Arc<AtomicU64>,
}

impl RelayConsumer {
    /// Delivers every line queued right now, in arrival order. Returns how
    /// many were delivered.
    pub fn drain(&self, sink: &mut dyn LineSink) -> usize {
        let mut n = 0;
        for line in self.rx.try_iter() {
            sink.deliver(&line.server_id, &line.text);
            n += 1;
        }
        n
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
