//! Message correlation engine.
//!
//! A single read task owns the inbound side of the transport. Responses are
//! matched to waiting callers by transaction id through a table of one-shot
//! senders; indications are mapped to [`Event`]s and queued for the control
//! loop. Callers never read the transport themselves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::transport::Transport;
use crate::error::{CallError, ProtocolError, TransportError};
use crate::event::{Event, EventSender};
use crate::frame::{Codec, Frame, FrameKind, IdSpace};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TransactionKey {
    space: IdSpace,
    id: u32,
}

struct Waiter {
    ticket: u64,
    slot: oneshot::Sender<Frame>,
}

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<TransactionKey, Waiter>,
    last_id: HashMap<IdSpace, u32>,
    next_ticket: u64,
    closed: bool,
}

impl PendingTable {
    /// Next free id in `space`, wrapping at `max` and never handing out 0.
    fn allocate(&mut self, space: IdSpace, max: u32) -> Option<u32> {
        let live = self.waiters.len() as u64;
        let last = self.last_id.entry(space).or_insert(0);
        for _ in 0..=live {
            let candidate = if *last >= max { 1 } else { *last + 1 };
            *last = candidate;
            let key = TransactionKey {
                space,
                id: candidate,
            };
            if !self.waiters.contains_key(&key) {
                return Some(candidate);
            }
        }
        None
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    pending: Mutex<PendingTable>,
    default_timeout: Duration,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, raw: &[u8], events: &EventSender) {
        trace!("<< {}", hex::encode(raw));

        let frame = match self.codec.decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping undecodable {} frame: {}", self.codec.name(), e);
                return;
            }
        };

        match frame.kind {
            FrameKind::Response => self.complete(frame),
            FrameKind::Indication => match self.codec.indication_event(&frame) {
                Some(event) => {
                    debug!("Indication 0x{:04x} -> {:?}", frame.message_id, event);
                    if !events.offer(event) {
                        debug!("Event receiver gone, indication dropped");
                    }
                }
                None => debug!(
                    "Ignoring indication 0x{:04x} on {:?}",
                    frame.message_id, frame.channel
                ),
            },
            FrameKind::Request => debug!("Ignoring request frame sent by the device"),
        }
    }

    fn complete(&self, frame: Frame) {
        let key = TransactionKey {
            space: frame.channel.id_space(),
            id: frame.transaction_id,
        };
        let waiter = self.table().waiters.remove(&key);
        match waiter {
            Some(waiter) => {
                if waiter.slot.send(frame).is_err() {
                    debug!("Waiter for transaction {} already gone", key.id);
                }
            }
            None => debug!(
                "Discarding unmatched response 0x{:04x} (transaction {})",
                frame.message_id, key.id
            ),
        }
    }

    /// Fail every outstanding call and refuse new ones.
    fn close(&self) {
        let mut table = self.table();
        table.closed = true;
        let dropped = table.waiters.len();
        table.waiters.clear();
        if dropped > 0 {
            debug!("Released {} outstanding requests", dropped);
        }
    }
}

/// Deregisters a pending request when the caller stops waiting for it,
/// whether it finished, timed out or was cancelled.
struct PendingGuard<'a> {
    shared: &'a Shared,
    key: TransactionKey,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.shared.table();
        if table
            .waiters
            .get(&self.key)
            .is_some_and(|w| w.ticket == self.ticket)
        {
            table.waiters.remove(&self.key);
        }
    }
}

/// Cloneable handle used by request operations to issue calls.
#[derive(Clone)]
pub struct EngineClient {
    shared: Arc<Shared>,
}

impl EngineClient {
    pub async fn send_and_wait(&self, request: Frame) -> Result<Frame, CallError> {
        let timeout = self.shared.default_timeout;
        self.send_and_wait_timeout(request, timeout).await
    }

    /// Send `request` and wait for the response carrying its transaction id.
    ///
    /// A zero transaction id is replaced with a freshly allocated one; a
    /// non-zero id is used as given and rejected if it is still
    /// outstanding.
    pub async fn send_and_wait_timeout(
        &self,
        mut request: Frame,
        timeout: Duration,
    ) -> Result<Frame, CallError> {
        let shared = &*self.shared;
        let space = request.channel.id_space();

        let (guard, slot) = {
            let mut table = shared.table();
            if table.closed {
                return Err(TransportError::Closed.into());
            }

            if request.transaction_id == 0 {
                let max = shared.codec.max_transaction_id(space);
                request.transaction_id = table
                    .allocate(space, max)
                    .ok_or(ProtocolError::Unencodable("transaction ids exhausted"))?;
            }

            let key = TransactionKey {
                space,
                id: request.transaction_id,
            };
            if table.waiters.contains_key(&key) {
                return Err(CallError::DuplicateTransaction(key.id));
            }

            let ticket = table.next_ticket;
            table.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            table.waiters.insert(key, Waiter { ticket, slot: tx });
            (
                PendingGuard {
                    shared,
                    key,
                    ticket,
                },
                rx,
            )
        };

        let raw = shared.codec.encode(&request)?;
        trace!(">> {}", hex::encode(&raw));
        shared.transport.send(raw).await?;

        let result = match tokio::time::timeout(timeout, slot).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Closed.into()),
            Err(_) => {
                warn!(
                    "Request 0x{:04x} (transaction {}) timed out after {:?}",
                    request.message_id, guard.key.id, timeout
                );
                Err(CallError::Timeout(timeout))
            }
        };
        drop(guard);
        result
    }

    /// Number of calls currently waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.shared.table().waiters.len()
    }

    pub fn codec(&self) -> &dyn Codec {
        &*self.shared.codec
    }
}

/// Owner of the read task. Dropping it without [`Engine::shutdown`] leaves
/// the task running until the transport ends.
pub struct Engine {
    client: EngineClient,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Engine {
    pub fn spawn(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        events: EventSender,
        default_timeout: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            transport,
            codec,
            pending: Mutex::new(PendingTable::default()),
            default_timeout,
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(read_loop(shared.clone(), events, cancel.clone()));

        Self {
            client: EngineClient { shared },
            cancel,
            task,
        }
    }

    pub fn client(&self) -> EngineClient {
        self.client.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the read loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Engine read task failed: {}", e);
        }
    }
}

async fn read_loop(shared: Arc<Shared>, events: EventSender, cancel: CancellationToken) {
    info!("Starting {} read loop", shared.codec.name());

    if cancel.is_cancelled() || !events.offer(Event::DeviceConnected) {
        shared.close();
        return;
    }

    loop {
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Read loop cancelled");
                break;
            }
            raw = shared.transport.read() => raw,
        };

        match raw {
            Ok(raw) => shared.dispatch(&raw, &events),
            Err(e) => {
                warn!("Device read failed: {}", e);
                shared.close();
                events.offer(Event::DeviceDisconnected);
                break;
            }
        }
    }

    shared.close();
    info!("Read loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::{MemoryPeer, MemoryTransport};
    use crate::event::{EventReceiver, event_channel};
    use crate::frame::Channel;
    use crate::qmi::{self, QmiCodec};
    use anyhow::{Context, Result};
    use tokio::time::Instant;

    const DMS: Channel = Channel::Service {
        service: qmi::SERVICE_DMS,
        client: 1,
    };

    fn start() -> (Engine, MemoryPeer, EventReceiver) {
        let (transport, peer) = MemoryTransport::pair();
        let (tx, rx) = event_channel();
        let engine = Engine::spawn(
            Arc::new(transport),
            Arc::new(QmiCodec),
            tx,
            DEFAULT_REQUEST_TIMEOUT,
        );
        (engine, peer, rx)
    }

    async fn next_request(peer: &mut MemoryPeer) -> Result<Frame> {
        let raw = peer.recv().await.context("transport dropped")?;
        Ok(QmiCodec.decode(&raw)?)
    }

    fn reply(peer: &MemoryPeer, request: &Frame, payload: &'static [u8]) -> Result<()> {
        let raw = QmiCodec.encode(&request.response(payload))?;
        assert!(peer.inject(raw));
        Ok(())
    }

    #[tokio::test]
    async fn test_response_wakes_matching_caller() -> Result<()> {
        let (engine, mut peer, mut events) = start();
        assert_eq!(events.recv().await, Some(Event::DeviceConnected));

        let client = engine.client();
        let call = tokio::spawn(async move {
            client
                .send_and_wait(Frame::request(DMS, 0x0023, &b""[..]))
                .await
        });

        let request = next_request(&mut peer).await?;
        assert_ne!(request.transaction_id, 0);
        reply(&peer, &request, b"\x02\x04\x00\x00\x00\x00\x00")?;

        let response = call.await??;
        assert_eq!(response.transaction_id, request.transaction_id);
        assert_eq!(response.kind, FrameKind::Response);
        assert_eq!(engine.client().outstanding(), 0);

        engine.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_unmatched_responses_are_discarded() -> Result<()> {
        let (engine, mut peer, mut events) = start();
        assert_eq!(events.recv().await, Some(Event::DeviceConnected));

        for id in [77u32, 78, 0, 0xffff] {
            let stray = Frame::request(DMS, 0x0025, &b""[..])
                .with_transaction_id(id)
                .response(&b""[..]);
            assert!(peer.inject(QmiCodec.encode(&stray)?));
        }
        assert!(peer.inject(&b"\x01\x02"[..]));

        let client = engine.client();
        let call = tokio::spawn(async move {
            client
                .send_and_wait(Frame::request(DMS, 0x0023, &b""[..]))
                .await
        });
        let request = next_request(&mut peer).await?;
        reply(&peer, &request, b"")?;
        call.await??;

        assert!(!engine.is_finished());
        engine.shutdown().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_deregisters_and_ignores_late_reply() -> Result<()> {
        let (engine, mut peer, mut events) = start();
        assert_eq!(events.recv().await, Some(Event::DeviceConnected));
        let client = engine.client();

        let began = Instant::now();
        let result = client
            .send_and_wait_timeout(
                Frame::request(DMS, 0x0023, &b""[..]),
                Duration::from_millis(2_000),
            )
            .await;
        let elapsed = began.elapsed();

        assert!(matches!(result, Err(CallError::Timeout(_))));
        assert!(elapsed >= Duration::from_millis(2_000));
        assert!(elapsed < Duration::from_millis(2_100));
        assert_eq!(client.outstanding(), 0);

        let late = next_request(&mut peer).await?;
        reply(&peer, &late, b"")?;
        tokio::task::yield_now().await;
        assert_eq!(client.outstanding(), 0);

        let next = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_and_wait(Frame::request(DMS, 0x0025, &b""[..]))
                    .await
            })
        };
        let request = next_request(&mut peer).await?;
        assert_ne!(request.transaction_id, late.transaction_id);
        reply(&peer, &request, b"")?;
        assert_eq!(next.await??.message_id, 0x0025);

        engine.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_callers_wait_independently() -> Result<()> {
        let (engine, mut peer, mut events) = start();
        assert_eq!(events.recv().await, Some(Event::DeviceConnected));

        let first = {
            let client = engine.client();
            tokio::spawn(async move {
                client
                    .send_and_wait(Frame::request(DMS, 0x0023, &b""[..]))
                    .await
            })
        };
        let first_req = next_request(&mut peer).await?;

        let second = {
            let client = engine.client();
            tokio::spawn(async move {
                client
                    .send_and_wait(Frame::request(DMS, 0x0025, &b""[..]))
                    .await
            })
        };
        let second_req = next_request(&mut peer).await?;
        assert_ne!(first_req.transaction_id, second_req.transaction_id);
        assert_eq!(engine.client().outstanding(), 2);

        reply(&peer, &second_req, b"")?;
        reply(&peer, &first_req, b"")?;

        assert_eq!(first.await??.message_id, 0x0023);
        assert_eq!(second.await??.message_id, 0x0025);

        engine.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_live_transaction_id_is_rejected() -> Result<()> {
        let (engine, mut peer, mut events) = start();
        assert_eq!(events.recv().await, Some(Event::DeviceConnected));

        let held = {
            let client = engine.client();
            tokio::spawn(async move {
                client
                    .send_and_wait(Frame::request(DMS, 0x0023, &b""[..]).with_transaction_id(9))
                    .await
            })
        };
        let request = next_request(&mut peer).await?;
        assert_eq!(request.transaction_id, 9);

        let clash = engine
            .client()
            .send_and_wait(Frame::request(DMS, 0x0025, &b""[..]).with_transaction_id(9))
            .await;
        assert!(matches!(clash, Err(CallError::DuplicateTransaction(9))));

        reply(&peer, &request, b"")?;
        assert_eq!(held.await??.message_id, 0x0023);

        engine.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_indications_become_events() -> Result<()> {
        let (engine, peer, mut events) = start();
        assert_eq!(events.recv().await, Some(Event::DeviceConnected));

        let unknown = Frame::indication(DMS, 0x0001, &b""[..]);
        assert!(peer.inject(QmiCodec.encode(&unknown)?));

        let serving = Frame::indication(
            Channel::Service {
                service: qmi::SERVICE_NAS,
                client: 2,
            },
            qmi::NAS_SERVING_SYSTEM as u32,
            &b""[..],
        );
        assert!(peer.inject(QmiCodec.encode(&serving)?));

        assert_eq!(events.recv().await, Some(Event::RegistrationChanged));
        engine.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_indication_burst_keeps_modem_reset() -> Result<()> {
        let (engine, mut peer, mut events) = start();
        let serving = Frame::indication(
            Channel::Service {
                service: qmi::SERVICE_NAS,
                client: 2,
            },
            qmi::NAS_SERVING_SYSTEM as u32,
            &b""[..],
        );
        for _ in 0..80 {
            assert!(peer.inject(QmiCodec.encode(&serving)?));
        }
        let sync = Frame::indication(Channel::Control, qmi::CTL_SYNC as u32, &b""[..]);
        assert!(peer.inject(QmiCodec.encode(&sync)?));

        // A request issued after the burst returning proves the read loop
        // got through every indication without anyone draining events.
        let client = engine.client();
        let call = tokio::spawn(async move {
            client
                .send_and_wait(Frame::request(DMS, 0x0023, &b""[..]))
                .await
        });
        let request = next_request(&mut peer).await?;
        reply(&peer, &request, b"")?;
        call.await??;

        assert_eq!(events.len(), 3);
        assert_eq!(events.recv().await, Some(Event::DeviceConnected));
        assert_eq!(events.recv().await, Some(Event::RegistrationChanged));
        assert_eq!(events.recv().await, Some(Event::ModemReset));
        assert!(events.is_empty());

        engine.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_end_of_stream_disconnects_and_fails_waiters() -> Result<()> {
        let (engine, mut peer, mut events) = start();
        assert_eq!(events.recv().await, Some(Event::DeviceConnected));

        let client = engine.client();
        let call = tokio::spawn(async move {
            client
                .send_and_wait(Frame::request(DMS, 0x0023, &b""[..]))
                .await
        });
        next_request(&mut peer).await?;
        peer.close();

        assert_eq!(events.recv().await, Some(Event::DeviceDisconnected));
        assert!(matches!(
            call.await?,
            Err(CallError::Transport(TransportError::Closed))
        ));
        assert_eq!(events.recv().await, None);

        let after = engine
            .client()
            .send_and_wait(Frame::request(DMS, 0x0023, &b""[..]))
            .await;
        assert!(matches!(
            after,
            Err(CallError::Transport(TransportError::Closed))
        ));
        engine.shutdown().await;
        Ok(())
    }

    #[test]
    fn test_allocation_wraps_and_skips_zero() {
        let mut table = PendingTable::default();
        let space = IdSpace::Control;
        assert_eq!(table.allocate(space, 3), Some(1));
        assert_eq!(table.allocate(space, 3), Some(2));
        assert_eq!(table.allocate(space, 3), Some(3));
        assert_eq!(table.allocate(space, 3), Some(1));
    }
}
