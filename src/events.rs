use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::link::LinkEvent;
use crate::utils::error::FrameDecodeError;

/// Everything acquisition units report to the watchdog.
#[derive(Debug, Clone)]
pub enum UnitEvent {
    Link(LinkEvent),
    SamplesProduced {
        unit: String,
        count: usize,
        at: DateTime<Utc>,
    },
    QualityEvent {
        unit: String,
        error: FrameDecodeError,
        consecutive_failures: u32,
    },
}

impl UnitEvent {
    pub fn unit(&self) -> &str {
        match self {
            UnitEvent::Link(event) => &event.source,
            UnitEvent::SamplesProduced { unit, .. } => unit,
            UnitEvent::QualityEvent { unit, .. } => unit,
        }
    }

    /// Connected links and produced samples both count as signs of life.
    pub fn is_heartbeat(&self) -> bool {
        match self {
            UnitEvent::Link(event) => event.status == crate::link::LinkStatus::Connected,
            UnitEvent::SamplesProduced { count, .. } => *count > 0,
            UnitEvent::QualityEvent { .. } => false,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<UnitEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<UnitEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
