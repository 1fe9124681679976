//! The two channels feeding the control loop.
//!
//! Engine events (indications, device connect/disconnect) and control
//! requests (OS signals, self-scheduled start/health-check) travel on
//! separate bounded queues so that a burst of one never starves the other.
//!
//! The event queue holds at most one entry per [`Event`] kind. An event
//! whose kind is already queued replaces the queued value in place, so a
//! burst of indications can neither fill the queue nor push out a
//! ModemReset behind it.

use std::collections::HashMap;
use std::mem::{self, Discriminant};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// One slot per [`Event`] variant is all the event queue ever needs.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;
pub const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// Something the engine (or an embedding application) reports to the
/// control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DeviceConnected,
    DeviceDisconnected,
    RegistrationChanged,
    DataCallListChanged,
    ModemReset,
    LoopbackConfig {
        enabled: bool,
        replication_factor: u32,
    },
    Quit,
}

type EventKind = Discriminant<Event>;

/// Latest value of every queued event kind.
type Queued = Arc<Mutex<HashMap<EventKind, Event>>>;

fn queued(map: &Mutex<HashMap<EventKind, Event>>) -> MutexGuard<'_, HashMap<EventKind, Event>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<EventKind>,
    queued: Queued,
}

impl EventSender {
    /// Queue `event` without waiting. Returns false once the receiver is
    /// gone.
    pub fn offer(&self, event: Event) -> bool {
        let kind = mem::discriminant(&event);
        let mut queued = queued(&self.queued);
        if let Some(previous) = queued.insert(kind, event) {
            debug!("Merged {:?} into queued event", previous);
            return !self.tx.is_closed();
        }
        match self.tx.try_send(kind) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = queued.remove(&kind);
                warn!("Event channel full, dropping {:?}", dropped);
                false
            }
            Err(TrySendError::Closed(_)) => {
                queued.remove(&kind);
                false
            }
        }
    }
}

pub struct EventReceiver {
    rx: mpsc::Receiver<EventKind>,
    queued: Queued,
}

impl EventReceiver {
    /// Next event in arrival order of its kind. `None` once every sender
    /// is dropped and the queue is empty.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let kind = self.rx.recv().await?;
            if let Some(event) = queued(&self.queued).remove(&kind) {
                return Some(event);
            }
        }
    }

    /// Number of events waiting to be received.
    pub fn len(&self) -> usize {
        queued(&self.queued).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let queued = Queued::default();
    (
        EventSender {
            tx,
            queued: queued.clone(),
        },
        EventReceiver { rx, queued },
    )
}

/// Requests on the signal-derived channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    StartAttempt,
    HealthCheck,
    Stop,
}

/// Cloneable sender half of the control channel.
#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<Control>,
}

impl ControlSender {
    /// Queue a request without waiting.
    ///
    /// The control loop posts to its own channel, so this must never block.
    /// On a full queue the request is dropped.
    pub fn post(&self, control: Control) -> bool {
        match self.tx.try_send(control) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                warn!("Control channel full, dropping {:?}", dropped);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the control loop to stop. Waits for room so a stop is never lost.
    pub async fn stop(&self) -> bool {
        self.tx.send(Control::Stop).await.is_ok()
    }
}

pub type ControlReceiver = mpsc::Receiver<Control>;

pub fn control_channel() -> (ControlSender, ControlReceiver) {
    let (tx, rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
    (ControlSender { tx }, rx)
}
