use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::usage::UsageRecord;

/// Logical output stream a piece of text belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Hidden reasoning trace.
    Analysis,
    /// Visible answer.
    Final,
    /// Echo of an executed tool's request and response.
    Tool,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Analysis => "analysis",
            Channel::Final => "final",
            Channel::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TurnEvent {
    pub channel: Channel,
    pub text: String,
    /// Position within the current channel burst. Resets when the channel changes.
    pub index: usize,
    /// Set on the terminal final-answer event.
    ///
    /// That event repeats the full answer text already streamed as
    /// non-terminal final events. Renderers should replace the final
    /// channel's contents with it rather than append it.
    pub end: bool,
    /// Line break inserted by the runtime rather than produced by the model.
    #[serde(default)]
    pub synthetic: bool,
}

impl TurnEvent {
    pub fn new(channel: Channel, text: impl Into<String>, index: usize, end: bool) -> Self {
        Self {
            channel,
            text: text.into(),
            index,
            end,
            synthetic: false,
        }
    }

    pub(crate) fn line_break(channel: Channel, index: usize) -> Self {
        Self {
            synthetic: true,
            ..Self::new(channel, "\n", index, false)
        }
    }
}

/// Receives channel events as a turn progresses. Must not block.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: TurnEvent);
}

impl EventSink for () {
    fn on_event(&self, _event: TurnEvent) {}
}

impl EventSink for mpsc::UnboundedSender<TurnEvent> {
    fn on_event(&self, event: TurnEvent) {
        // A dropped receiver means nobody is rendering; the turn still completes.
        let _ = self.send(event);
    }
}

/// Bounded delivery for callers that cap memory use.
///
/// A full channel drops the event with a warning instead of blocking the
/// turn, so a slow receiver can miss fragments. Use the unbounded sender
/// when every fragment must arrive.
impl EventSink for mpsc::Sender<TurnEvent> {
    fn on_event(&self, event: TurnEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.try_send(event) {
            warn!(
                channel = %event.channel,
                index = event.index,
                "event receiver is full; dropping event"
            );
        }
    }
}

/// Receives usage snapshots between mutations, never mid-update.
pub trait UsageSink: Send + Sync {
    fn on_usage(&self, usage: &UsageRecord);
}

impl UsageSink for () {
    fn on_usage(&self, _usage: &UsageRecord) {}
}

impl UsageSink for watch::Sender<UsageRecord> {
    fn on_usage(&self, usage: &UsageRecord) {
        self.send_replace(usage.clone());
    }
}

impl UsageSink for mpsc::UnboundedSender<UsageRecord> {
    fn on_usage(&self, usage: &UsageRecord) {
        let _ = self.send(usage.clone());
    }
}
