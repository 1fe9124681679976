//! Connection state machine.
//!
//! A [`Session`] drives one modem from bring-up to shutdown. It is the only
//! owner of the profile and of every per-family status; the engine reaches
//! it through the event channel and OS signals through the control channel.
//! Each session attempt (the first one and every one after a modem reset)
//! opens a fresh transport and engine.

mod backoff;
mod bringup;
mod handlers;
mod recovery;

pub use backoff::Backoff;

use std::sync::Arc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::apn::ApnResolver;
use crate::config::SessionConfig;
use crate::connection::Engine;
use crate::error::SessionError;
use crate::event::{
    Control, ControlReceiver, ControlSender, Event, EventReceiver, control_channel, event_channel,
};
use crate::host::{DeviceWatch, LinkNotifier};
use crate::ops::{Backend, RequestOps};
use crate::profile::{IpFamily, Profile};
use crate::state::{ConnectionStatus, FamilyStates, LinkState, SessionState};

/// How a session ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Stop was requested and the data calls were torn down.
    Stopped,
    /// The device went away while the session was running.
    DeviceDisconnected,
}

/// Engine, request operations and event stream of one session attempt.
struct Attempt {
    engine: Engine,
    ops: Box<dyn RequestOps>,
    events: EventReceiver,
}

impl Attempt {
    async fn close(self) {
        let Attempt { engine, ops, events } = self;
        drop(ops);
        drop(events);
        engine.shutdown().await;
    }
}

/// Why the steady-state loop returned.
enum Exit {
    Stop,
    Disconnected,
    Reset,
}

pub struct Session {
    backend: Arc<dyn Backend>,
    profile: Profile,
    config: SessionConfig,
    notifier: Box<dyn LinkNotifier>,
    resolver: Option<Arc<dyn ApnResolver>>,
    watch: Arc<dyn DeviceWatch>,
    control_tx: ControlSender,
    control_rx: ControlReceiver,
    state: SessionState,
    families: FamilyStates,
    link: LinkState,
    backoff: Backoff,
    retry_at: Option<Instant>,
    ps_attached: bool,
}

impl Session {
    pub fn new(
        backend: Arc<dyn Backend>,
        profile: Profile,
        config: SessionConfig,
        notifier: Box<dyn LinkNotifier>,
        watch: Arc<dyn DeviceWatch>,
    ) -> Self {
        let (control_tx, control_rx) = control_channel();
        let backoff = Backoff::new(&config.backoff_table);
        Self {
            backend,
            profile,
            config,
            notifier,
            resolver: None,
            watch,
            control_tx,
            control_rx,
            state: SessionState::Initializing,
            families: FamilyStates::default(),
            link: LinkState::default(),
            backoff,
            retry_at: None,
            ps_attached: false,
        }
    }

    pub fn with_apn_resolver(mut self, resolver: Arc<dyn ApnResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Handle for posting Stop (or any other control request) from outside.
    pub fn control(&self) -> ControlSender {
        self.control_tx.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn status(&self, family: IpFamily) -> ConnectionStatus {
        self.families.get(family)
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Run until stopped, disconnected, or a fatal error.
    pub async fn run(&mut self) -> Result<SessionOutcome, SessionError> {
        loop {
            let mut attempt = match self.open_attempt().await {
                Ok(attempt) => attempt,
                Err(e) => {
                    self.enter(SessionState::Terminated);
                    return Err(e);
                }
            };

            match self.bring_up(&mut attempt).await {
                Ok(true) => {}
                Ok(false) => {
                    self.enter(SessionState::ShuttingDown);
                    self.stop(attempt.ops.as_mut()).await;
                    attempt.close().await;
                    self.enter(SessionState::Terminated);
                    return Ok(SessionOutcome::Stopped);
                }
                Err(e) => {
                    warn!("Bring-up failed: {}", e);
                    attempt.close().await;
                    self.enter(SessionState::Terminated);
                    return Err(e);
                }
            }

            self.enter(SessionState::Ready);
            match self.steady_state(&mut attempt).await {
                Exit::Stop => {
                    self.enter(SessionState::ShuttingDown);
                    self.stop(attempt.ops.as_mut()).await;
                    attempt.close().await;
                    self.enter(SessionState::Terminated);
                    return Ok(SessionOutcome::Stopped);
                }
                Exit::Disconnected => {
                    warn!("Device disconnected");
                    self.families = FamilyStates::default();
                    self.update_link().await;
                    attempt.close().await;
                    self.enter(SessionState::Terminated);
                    return Ok(SessionOutcome::DeviceDisconnected);
                }
                Exit::Reset => {
                    self.enter(SessionState::Resetting);
                    match self.recover(attempt).await {
                        Ok(true) => self.enter(SessionState::Initializing),
                        Ok(false) => {
                            self.enter(SessionState::Terminated);
                            return Ok(SessionOutcome::Stopped);
                        }
                        Err(e) => {
                            self.enter(SessionState::Terminated);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    fn enter(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!("Unexpected session transition {} -> {}", self.state, next);
        }
        info!("Session {} -> {}", self.state, next);
        self.state = next;
    }

    async fn open_attempt(&mut self) -> Result<Attempt, SessionError> {
        let transport = self.backend.open().await?;
        let (events_tx, events) = event_channel();
        let engine = Engine::spawn(
            transport,
            self.backend.codec(),
            events_tx,
            self.config.request_timeout,
        );
        let ops = self.backend.bind(engine.client());

        self.families = FamilyStates::default();
        self.ps_attached = false;
        self.retry_at = None;
        Ok(Attempt {
            engine,
            ops,
            events,
        })
    }

    async fn steady_state(&mut self, attempt: &mut Attempt) -> Exit {
        loop {
            let idle_at = Instant::now() + self.config.idle_timeout;
            let retry_due = self.retry_at.filter(|at| *at <= idle_at);
            let deadline = retry_due.unwrap_or(idle_at);

            tokio::select! {
                biased;
                control = self.control_rx.recv() => {
                    self.retry_at = None;
                    let control = control.unwrap_or(Control::Stop);
                    debug!("Control {:?}", control);
                    match control {
                        Control::Stop => return Exit::Stop,
                        Control::StartAttempt => self.start_attempt(attempt.ops.as_mut()).await,
                        Control::HealthCheck => self.health_check(attempt.ops.as_mut()).await,
                    }
                }
                event = attempt.events.recv() => {
                    let Some(event) = event else {
                        return Exit::Disconnected;
                    };
                    debug!("Event {:?}", event);
                    match event {
                        Event::DeviceConnected => {}
                        Event::DeviceDisconnected => return Exit::Disconnected,
                        Event::ModemReset => return Exit::Reset,
                        Event::Quit => return Exit::Stop,
                        Event::RegistrationChanged => {
                            self.registration_changed(attempt.ops.as_mut()).await
                        }
                        Event::DataCallListChanged => self.data_call_list_changed(),
                        Event::LoopbackConfig { enabled, replication_factor } => {
                            self.loopback_requested(enabled, replication_factor)
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    if retry_due.is_some() {
                        self.retry_at = None;
                        self.post(Control::StartAttempt);
                    } else {
                        self.post(Control::HealthCheck);
                    }
                }
            }
        }
    }

    fn post(&self, control: Control) {
        self.control_tx.post(control);
    }

    /// Drain pending control requests; true if one of them was Stop.
    fn stop_requested(&mut self) -> bool {
        let mut stop = false;
        while let Ok(control) = self.control_rx.try_recv() {
            stop |= control == Control::Stop;
        }
        stop
    }
}
