//! Rule lifecycle events, delivered from the graph engine to a single consumer.
//!
//! Delivery is a rendezvous: `EventSender::send` resolves only once the consumer
//! has processed the event and acknowledged it. A rule therefore cannot report
//! its next state change before the previous one has been handled.

use crate::error::{Error, Result};
use tokio::sync::{mpsc, oneshot};

/// A lifecycle transition of one rule, identified by its target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleEvent {
    Started(String),
    Ended(String),
    Succeeded(String),
    Failed { target: String, cause: String },
}

impl RuleEvent {
    pub fn target(&self) -> &str {
        match self {
            Self::Started(t) | Self::Ended(t) | Self::Succeeded(t) => t,
            Self::Failed { target, .. } => target,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Started(_) => "started",
            Self::Ended(_) => "ended",
            Self::Succeeded(_) => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }
}

struct Envelope {
    event: RuleEvent,
    ack: oneshot::Sender<()>,
}

/// Acknowledges one received event. Dropping it without calling `ack` makes the
/// sender's `send` fail with `EventChannelClosed`.
pub struct Ack(oneshot::Sender<()>);

impl Ack {
    pub fn ack(self) {
        let _ = self.0.send(());
    }
}

/// Producer half. Cheap to clone; one per concurrently running rule is fine.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Envelope>,
}

impl EventSender {
    /// Deliver `event` and wait until the consumer has acknowledged it.
    pub async fn send(&self, event: RuleEvent) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Envelope { event, ack })
            .await
            .map_err(|_| Error::EventChannelClosed)?;
        done.await.map_err(|_| Error::EventChannelClosed)
    }
}

/// Consumer half.
pub struct EventReceiver {
    rx: mpsc::Receiver<Envelope>,
}

impl EventReceiver {
    /// Next event, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<(RuleEvent, Ack)> {
        self.rx
            .recv()
            .await
            .map(|env| (env.event, Ack(env.ack)))
    }

    /// An event already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<(RuleEvent, Ack)> {
        self.rx.try_recv().ok().map(|env| (env.event, Ack(env.ack)))
    }
}

/// Create a connected sender/receiver pair.
pub fn event_channel() -> (EventSender, EventReceiver) {
    // Capacity 1 plus the per-event ack keeps at most one event in flight per sender.
    let (tx, rx) = mpsc::channel(1);
    (EventSender { tx }, EventReceiver { rx })
}
