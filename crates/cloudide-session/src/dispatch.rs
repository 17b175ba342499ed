use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cloudide_protocol::{InboundEnvelope, OutboundEnvelope, RequestId, WorkspaceRequest};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{EventBus, Subscription};
use crate::connection::{Connection, Inbound, InboundStream};
use crate::error::{RequestError, TransportError};

/// How long [`Dispatcher::request`] waits for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    Never,
    After(Duration),
}

impl TimeoutPolicy {
    /// `0` means [`TimeoutPolicy::Never`].
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Self::Never
        } else {
            Self::After(Duration::from_millis(ms))
        }
    }
}

/// How replies are paired with requests.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMatching {
    /// Tag each request with a `requestId` the backend echoes back.
    #[default]
    RequestId,
    /// Take the next event carrying the request's reply tag. Needed for
    /// backends that do not echo ids; a late reply to an abandoned request
    /// with the same tag is indistinguishable from the real one.
    EventTag,
}

type PendingTable = Arc<Mutex<HashMap<RequestId, oneshot::Sender<InboundEnvelope>>>>;

/// Completion handle shared by a tag-matched request's subscription and
/// the router. Whichever fires first takes it.
type ReplySlot = Arc<Mutex<Option<oneshot::Sender<InboundEnvelope>>>>;

/// Tag-matched requests in send order. An id-less rejection has no reply
/// tag, so it completes the oldest of these.
type TagWaiters = Arc<Mutex<VecDeque<(u64, ReplySlot)>>>;

/// Send side of the workspace connection plus request/reply correlation.
///
/// A router task drains the connection's inbound stream: replies carrying a
/// known `requestId` complete their pending call, everything without an id
/// goes to the [`EventBus`].
pub struct Dispatcher {
    connection: Connection,
    bus: EventBus,
    pending: PendingTable,
    tag_waiters: TagWaiters,
    next_id: AtomicU64,
    timeout: TimeoutPolicy,
    matching: ReplyMatching,
    router: JoinHandle<()>,
}

impl Dispatcher {
    pub fn start(
        connection: Connection,
        inbound: InboundStream,
        bus: EventBus,
        timeout: TimeoutPolicy,
        matching: ReplyMatching,
    ) -> Self {
        let pending = PendingTable::default();
        let tag_waiters = TagWaiters::default();
        let router = tokio::spawn(route_inbound(
            inbound,
            bus.clone(),
            pending.clone(),
            tag_waiters.clone(),
        ));
        Self {
            connection,
            bus,
            pending,
            tag_waiters,
            next_id: AtomicU64::new(0),
            timeout,
            matching,
            router,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_ready(&self) -> bool {
        self.connection.is_ready()
    }

    /// Fire-and-forget. Returns whether the envelope was queued; when the
    /// connection is not open nothing is written.
    pub fn send_request(&self, kind: &str, payload: Value) -> bool {
        self.send_envelope(OutboundEnvelope::new(kind, payload))
    }

    pub fn send(&self, request: &WorkspaceRequest) -> bool {
        match request.to_envelope() {
            Ok(envelope) => self.send_envelope(envelope),
            Err(e) => {
                warn!(request_type = request.kind(), "failed to encode request: {e}");
                false
            }
        }
    }

    /// Send `request` and wait for its reply under the configured policy.
    pub async fn request(&self, request: &WorkspaceRequest) -> Result<InboundEnvelope, RequestError> {
        if !self.connection.is_ready() {
            return Err(RequestError::NotReady);
        }
        let envelope = request
            .to_envelope()
            .map_err(|e| RequestError::Transport(TransportError::Encode(e)))?;

        let reply = match self.matching {
            ReplyMatching::RequestId => self.request_by_id(request.kind(), envelope).await?,
            ReplyMatching::EventTag => {
                self.request_by_tag(request.kind(), request.reply_tag(), envelope)
                    .await?
            }
        };
        if !reply.success {
            return Err(RequestError::Rejected {
                message: reply.message,
            });
        }
        Ok(reply)
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn close(&self) {
        self.connection.close();
    }

    async fn request_by_id(
        &self,
        kind: &'static str,
        envelope: OutboundEnvelope,
    ) -> Result<InboundEnvelope, RequestError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.write(&envelope.with_request_id(id))?;
        debug!(request_id = id, request_type = kind, "request sent");
        self.await_reply(kind, rx).await
    }

    async fn request_by_tag(
        &self,
        kind: &'static str,
        tag: &'static str,
        envelope: OutboundEnvelope,
    ) -> Result<InboundEnvelope, RequestError> {
        let (tx, rx) = oneshot::channel();
        let slot: ReplySlot = Arc::new(Mutex::new(Some(tx)));
        let waiter_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.tag_waiters.lock().push_back((waiter_id, slot.clone()));
        let _waiter = TagWaiterGuard {
            waiters: &self.tag_waiters,
            id: waiter_id,
        };

        let subscription = self.bus.subscribe_once(tag, move |payload| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(InboundEnvelope {
                    success: true,
                    message: tag.to_string(),
                    payload: payload.clone(),
                    request_id: None,
                });
            }
        });
        let _guard = SubscriptionGuard(subscription);

        self.write(&envelope)?;
        debug!(request_type = kind, tag, "request sent");
        self.await_reply(kind, rx).await
    }

    async fn await_reply(
        &self,
        kind: &'static str,
        rx: oneshot::Receiver<InboundEnvelope>,
    ) -> Result<InboundEnvelope, RequestError> {
        let connection = &self.connection;
        let reply = async move {
            tokio::select! {
                biased;
                reply = rx => reply.map_err(|_| RequestError::ConnectionLost),
                _ = connection.closed() => Err(RequestError::ConnectionLost),
            }
        };
        match self.timeout {
            TimeoutPolicy::Never => reply.await,
            TimeoutPolicy::After(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(result) => result,
                Err(_) => {
                    match timeout_hint(self.matching) {
                        Some(hint) => warn!(request_type = kind, "request timed out; {hint}"),
                        None => warn!(request_type = kind, "request timed out"),
                    }
                    Err(RequestError::Timeout {
                        request_type: kind,
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            },
        }
    }

    fn send_envelope(&self, envelope: OutboundEnvelope) -> bool {
        match self.write(&envelope) {
            Ok(()) => {
                debug!(request_type = %envelope.kind, "request sent");
                true
            }
            Err(TransportError::NotReady) => {
                warn!(request_type = %envelope.kind, "connection not open, request dropped");
                false
            }
            Err(e) => {
                warn!(request_type = %envelope.kind, "request dropped: {e}");
                false
            }
        }
    }

    fn write(&self, envelope: &OutboundEnvelope) -> Result<(), TransportError> {
        let text = envelope.to_json()?;
        self.connection.send(text)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.connection.close();
        self.router.abort();
    }
}

/// Removes a pending entry when its request finishes, times out or is
/// cancelled.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

struct TagWaiterGuard<'a> {
    waiters: &'a TagWaiters,
    id: u64,
}

impl Drop for TagWaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.lock().retain(|(id, _)| *id != self.id);
    }
}

struct SubscriptionGuard(Subscription);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

/// Extra context for a timeout, when the matching mode is a likely cause.
fn timeout_hint(matching: ReplyMatching) -> Option<&'static str> {
    match matching {
        ReplyMatching::RequestId => Some(
            "if the backend does not echo requestId, set reply_matching = \"event_tag\"",
        ),
        ReplyMatching::EventTag => None,
    }
}

async fn route_inbound(
    mut inbound: InboundStream,
    bus: EventBus,
    pending: PendingTable,
    tag_waiters: TagWaiters,
) {
    while let Some(frame) = inbound.recv().await {
        match frame {
            Inbound::Text(text) => route_text(&text, &bus, &pending, &tag_waiters),
            Inbound::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => route_text(&text, &bus, &pending, &tag_waiters),
                Err(_) => warn!("dropping non-utf8 binary frame"),
            },
            Inbound::Closed(reason) => {
                // Dropping the senders fails every waiter with ConnectionLost.
                let abandoned = pending.lock().drain().count();
                tag_waiters.lock().clear();
                debug!(?reason, abandoned, "workspace connection closed");
                break;
            }
        }
    }
}

fn route_text(text: &str, bus: &EventBus, pending: &PendingTable, tag_waiters: &TagWaiters) {
    match InboundEnvelope::parse(text) {
        Ok(envelope) => route_envelope(envelope, bus, pending, tag_waiters),
        Err(e) => warn!("dropping inbound frame: {e}"),
    }
}

fn route_envelope(
    envelope: InboundEnvelope,
    bus: &EventBus,
    pending: &PendingTable,
    tag_waiters: &TagWaiters,
) {
    let Some(id) = envelope.request_id else {
        if !envelope.success {
            reject_oldest_tag_waiter(&envelope, tag_waiters);
        }
        bus.dispatch(&envelope);
        return;
    };
    let waiter = pending.lock().remove(&id);
    match waiter {
        Some(tx) => {
            if tx.send(envelope).is_err() {
                debug!(request_id = id, "requester went away before its reply");
            }
        }
        None => debug!(
            request_id = id,
            tag = %envelope.message,
            "dropping reply for unknown request"
        ),
    }
}

fn reject_oldest_tag_waiter(envelope: &InboundEnvelope, tag_waiters: &TagWaiters) {
    let mut waiters = tag_waiters.lock();
    while let Some((id, slot)) = waiters.pop_front() {
        if let Some(tx) = slot.lock().take() {
            debug!(waiter = id, tag = %envelope.message, "rejection routed to tag-matched request");
            let _ = tx.send(envelope.clone());
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn reply(id: Option<RequestId>) -> InboundEnvelope {
        InboundEnvelope {
            success: true,
            message: "File retrieved successfully".to_string(),
            payload: json!({"content": "aGVsbG8="}),
            request_id: id,
        }
    }

    fn counting_bus() -> (EventBus, Arc<AtomicUsize>) {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe("File retrieved successfully", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (bus, count)
    }

    #[test]
    fn timeout_policy_from_millis() {
        assert_eq!(TimeoutPolicy::from_millis(0), TimeoutPolicy::Never);
        assert_eq!(
            TimeoutPolicy::from_millis(1500),
            TimeoutPolicy::After(Duration::from_millis(1500))
        );
    }

    #[test]
    fn reply_with_known_id_completes_only_that_call() {
        let (bus, broadcast) = counting_bus();
        let pending = PendingTable::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending.lock().insert(1, tx1);
        pending.lock().insert(2, tx2);

        route_envelope(reply(Some(2)), &bus, &pending, &TagWaiters::default());

        assert_eq!(rx2.try_recv().unwrap().request_id, Some(2));
        assert!(rx1.try_recv().is_err());
        assert_eq!(pending.lock().len(), 1);
        assert_eq!(broadcast.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reply_for_abandoned_request_is_dropped() {
        let (bus, broadcast) = counting_bus();
        let pending = PendingTable::default();
        let (tx, mut rx) = oneshot::channel();
        pending.lock().insert(5, tx);

        // Id 4 was abandoned; its late reply must not reach request 5.
        route_envelope(reply(Some(4)), &bus, &pending, &TagWaiters::default());

        assert!(rx.try_recv().is_err());
        assert_eq!(pending.lock().len(), 1);
        assert_eq!(broadcast.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn untagged_reply_goes_to_bus() {
        let (bus, broadcast) = counting_bus();
        let pending = PendingTable::default();
        route_envelope(reply(None), &bus, &pending, &TagWaiters::default());
        assert_eq!(broadcast.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn untagged_rejection_completes_oldest_tag_waiter() {
        let (bus, _) = counting_bus();
        let pending = PendingTable::default();
        let waiters = TagWaiters::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        // The first slot was already taken by its success subscription.
        waiters.lock().push_back((1, Arc::new(Mutex::new(None))));
        waiters.lock().push_back((2, Arc::new(Mutex::new(Some(tx1)))));
        waiters.lock().push_back((3, Arc::new(Mutex::new(Some(tx2)))));

        let rejection = InboundEnvelope {
            success: false,
            message: "File does not exist: /w/gone.txt".to_string(),
            payload: Value::Null,
            request_id: None,
        };
        route_envelope(rejection, &bus, &pending, &waiters);

        let got = rx1.try_recv().unwrap();
        assert!(!got.success);
        assert_eq!(got.message, "File does not exist: /w/gone.txt");
        assert!(rx2.try_recv().is_err());
        assert_eq!(waiters.lock().len(), 1);
    }

    #[test]
    fn untagged_success_leaves_tag_waiters_alone() {
        let (bus, broadcast) = counting_bus();
        let waiters = TagWaiters::default();
        let (tx, mut rx) = oneshot::channel();
        waiters.lock().push_back((1, Arc::new(Mutex::new(Some(tx)))));

        route_envelope(reply(None), &bus, &PendingTable::default(), &waiters);

        assert!(rx.try_recv().is_err());
        assert_eq!(waiters.lock().len(), 1);
        assert_eq!(broadcast.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_hint_points_at_event_tag_matching() {
        assert!(
            timeout_hint(ReplyMatching::RequestId)
                .is_some_and(|hint| hint.contains("reply_matching = \"event_tag\""))
        );
        assert_eq!(timeout_hint(ReplyMatching::EventTag), None);
    }

    #[test]
    fn reply_matching_config_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            m: ReplyMatching,
        }
        let w: Wrapper = toml::from_str("m = \"request_id\"").unwrap();
        assert_eq!(w.m, ReplyMatching::RequestId);
        let w: Wrapper = toml::from_str("m = \"event_tag\"").unwrap();
        assert_eq!(w.m, ReplyMatching::EventTag);
    }
}
