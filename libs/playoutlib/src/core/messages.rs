//! Element messages posted by the sink.
//!
//! The sink never aborts the stream for recoverable conditions; it posts a
//! message on the pipeline bus and keeps going. Embedders route
//! [`SinkMessage`] through their own bus via
//! [`PipelineContext::post_message`](super::sink::PipelineContext); the
//! [`MessageBus`] pair here is a ready-made backend for that.

use crossbeam_channel::{Receiver, Sender, unbounded};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDomain {
    /// Clock and synchronization problems.
    CoreClock,
    /// The stream format could not be handled.
    StreamFormat,
    /// The stream payload had the wrong shape.
    StreamWrongType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMessage {
    /// Posted from the pull-mode producer when upstream signalled
    /// end-of-stream.
    Eos,

    Warning {
        domain: MessageDomain,
        text: String,
        debug: String,
    },

    Error {
        domain: MessageDomain,
        text: String,
        debug: String,
    },
}

/// Unbounded mailbox for sink messages.
#[derive(Debug, Clone)]
pub struct MessageBus {
    tx: Sender<SinkMessage>,
    rx: Receiver<SinkMessage>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn post(&self, message: SinkMessage) {
        // The receiving half lives as long as self, the send cannot fail.
        let _ = self.tx.send(message);
    }

    /// Drain every message currently queued.
    pub fn drain(&self) -> Vec<SinkMessage> {
        self.rx.try_iter().collect()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
