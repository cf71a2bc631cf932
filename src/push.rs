//! Push notification stream and queue.
//!
//! A single worker task holds the authenticated websocket connection to the
//! PSN push endpoint, keeps it alive with PING/PONG, and feeds parsed
//! notifications into the session's queue. Phase code consumes the queue
//! through [`NotificationWaiter`]s; each waiter observes every notification
//! exactly once, in insertion order.

use crate::error::{HolepunchError, Result};
use crate::message::{self, SessionMessage, SessionMessageAction};
use crate::session::{SessionInner, SessionState};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, warn};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

/// Kind of a push notification, mapped from its `dataType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    SessionCreated,
    MemberCreated,
    MemberDeleted,
    CustomData1Updated,
    SessionMessageCreated,
    Unknown,
}

impl NotificationKind {
    fn from_data_type(data_type: &str) -> Self {
        match data_type {
            "psn:sessionManager:sys:remotePlaySession:created" => Self::SessionCreated,
            "psn:sessionManager:sys:rps:members:created" => Self::MemberCreated,
            "psn:sessionManager:sys:rps:members:deleted" => Self::MemberDeleted,
            "psn:sessionManager:sys:rps:customData1:updated" => Self::CustomData1Updated,
            "psn:sessionManager:sys:rps:sessionMessage:created" => Self::SessionMessageCreated,
            _ => Self::Unknown,
        }
    }

    /// Bit used when filtering awaited notifications by kind.
    pub(crate) const fn mask(self) -> u8 {
        match self {
            Self::SessionCreated => 1,
            Self::MemberCreated => 1 << 1,
            Self::MemberDeleted => 1 << 2,
            Self::CustomData1Updated => 1 << 3,
            Self::SessionMessageCreated => 1 << 4,
            Self::Unknown => 0,
        }
    }
}

/// One received push notification.
#[derive(Debug)]
pub struct Notification {
    /// Stable queue id, increasing in insertion order.
    pub seq: u64,
    pub kind: NotificationKind,
    pub json: Value,
    pub raw: String,
}

#[derive(Default)]
struct QueueInner {
    entries: VecDeque<Arc<Notification>>,
    next_seq: u64,
}

/// Queue of notifications produced by the push worker.
///
/// The lock is held only for queue membership operations, never across I/O
/// or awaits.
#[derive(Default)]
pub(crate) struct NotificationQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl NotificationQueue {
    /// Append a notification and wake all waiters.
    pub fn push(&self, kind: NotificationKind, json: Value, raw: String) {
        {
            let mut inner = self.inner.lock().expect("notification queue poisoned");
            inner.next_seq += 1;
            let notification = Arc::new(Notification {
                seq: inner.next_seq,
                kind,
                json,
                raw,
            });
            inner.entries.push_back(notification);
        }
        self.notify.notify_waiters();
    }

    /// Remove a consumed notification from the queue.
    pub fn clear(&self, seq: u64) {
        let mut inner = self.inner.lock().expect("notification queue poisoned");
        inner.entries.retain(|n| n.seq != seq);
    }
}

/// Cursor over a [`NotificationQueue`].
///
/// Waiters track the newest sequence id they have examined, so concurrent
/// inserts are observed exactly once each and skipped entries are not
/// revisited by the same waiter.
pub(crate) struct NotificationWaiter {
    queue: Arc<NotificationQueue>,
    last_seen: u64,
}

impl NotificationWaiter {
    pub fn new(queue: Arc<NotificationQueue>) -> Self {
        Self {
            queue,
            last_seen: 0,
        }
    }

    /// Wait until a notification matching `mask` is queued, or `deadline`.
    pub async fn wait(
        &mut self,
        mask: u8,
        deadline: Instant,
        what: &'static str,
    ) -> Result<Arc<Notification>> {
        loop {
            let queue = self.queue.clone();
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            // Register for wakeup before scanning so a push between the scan
            // and the await is not lost.
            notified.as_mut().enable();
            if let Some(notification) = self.scan(mask) {
                return Ok(notification);
            }
            timeout_at(deadline, notified)
                .await
                .map_err(|_| HolepunchError::Timeout(what))?;
        }
    }

    fn scan(&mut self, mask: u8) -> Option<Arc<Notification>> {
        let inner = self.queue.inner.lock().expect("notification queue poisoned");
        for notification in inner.entries.iter() {
            if notification.seq <= self.last_seen {
                continue;
            }
            self.last_seen = notification.seq;
            if notification.kind.mask() & mask != 0 {
                return Some(notification.clone());
            }
        }
        None
    }
}

/// Whether the worker should automatically acknowledge peer OFFERs.
///
/// Between receiving the control offer and establishing the control channel
/// no further offers are expected, and after the data offer none at all; in
/// both windows stray offers are acked so the console does not stall.
pub(crate) fn should_auto_ack(state: SessionState) -> bool {
    (state.contains(SessionState::CTRL_OFFER_RECEIVED)
        && !state.contains(SessionState::CTRL_ESTABLISHED))
        || state.contains(SessionState::DATA_OFFER_RECEIVED)
}

/// Push worker entry point; logs its own failure.
pub(crate) async fn run_push_worker(
    inner: Arc<SessionInner>,
    fqdn: String,
    mut stop: watch::Receiver<bool>,
) {
    if let Err(e) = push_stream_loop(&inner, &fqdn, &mut stop).await {
        error!("push worker terminated: {}", e);
    }
}

async fn push_stream_loop(
    inner: &Arc<SessionInner>,
    fqdn: &str,
    stop: &mut watch::Receiver<bool>,
) -> Result<()> {
    let url = format!("wss://{}/np/pushNotification", fqdn);
    let mut request = url.as_str().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", inner.psn.token()))
        .map_err(|e| HolepunchError::network_with_source("token is not a valid header", e))?;
    let headers = request.headers_mut();
    headers.insert(AUTHORIZATION, bearer);
    headers.insert("Sec-WebSocket-Protocol", HeaderValue::from_static("np-pushpacket"));
    headers.insert(USER_AGENT, HeaderValue::from_static("WebSocket++/0.8.2"));
    headers.insert("X-PSN-APP-TYPE", HeaderValue::from_static("REMOTE_PLAY"));
    headers.insert("X-PSN-APP-VER", HeaderValue::from_static("RemotePlay/1.0"));
    headers.insert("X-PSN-KEEP-ALIVE-STATUS-TYPE", HeaderValue::from_static("3"));
    headers.insert("X-PSN-OS-VER", HeaderValue::from_static("Windows/10.0"));
    headers.insert("X-PSN-PROTOCOL-VERSION", HeaderValue::from_static("2.1"));
    headers.insert("X-PSN-RECONNECTION", HeaderValue::from_static("false"));

    let (stream, _response) = connect_async(request).await?;
    debug!("connected to push notification stream at {}", url);
    inner.set_state(SessionState::WS_OPEN);

    let (mut sink, mut stream) = stream.split();
    let mut ping = tokio::time::interval(inner.config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!("push worker stopping");
                    return Ok(());
                }
            }
            _ = ping.tick() => {
                if awaiting_pong {
                    return Err(HolepunchError::Timeout("websocket PONG"));
                }
                sink.send(Message::Ping(Vec::new())).await?;
                awaiting_pong = true;
            }
            frame = stream.next() => {
                let message = match frame {
                    Some(message) => message?,
                    None => return Err(HolepunchError::network("push stream ended")),
                };
                match message {
                    Message::Pong(_) => {
                        awaiting_pong = false;
                    }
                    Message::Ping(payload) => {
                        sink.send(Message::Pong(payload)).await?;
                    }
                    Message::Close(_) => {
                        return Err(HolepunchError::network("push stream closed by server"));
                    }
                    Message::Text(text) => {
                        handle_frame(inner, text).await;
                    }
                    Message::Binary(data) => {
                        handle_frame(inner, String::from_utf8_lossy(&data).into_owned()).await;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn handle_frame(inner: &Arc<SessionInner>, raw: String) {
    let json: Value = match serde_json::from_str(&raw) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to parse push payload as JSON: {}", e);
            debug!("payload was: {}", raw);
            return;
        }
    };
    let kind = match json.get("dataType").and_then(Value::as_str) {
        Some(data_type) => {
            let kind = NotificationKind::from_data_type(data_type);
            if kind == NotificationKind::Unknown {
                warn!("unknown notification type \"{}\"", data_type);
            }
            kind
        }
        None => {
            warn!("notification has no dataType field");
            NotificationKind::Unknown
        }
    };
    debug!("received {:?} notification", kind);

    // State is read and released before the queue lock is taken; the two
    // critical sections are never nested the other way around.
    if should_auto_ack(inner.state()) && kind == NotificationKind::SessionMessageCreated {
        // Observability must not delay the main flow
        if let Err(e) = auto_ack_offer(inner, &json).await {
            warn!("failed to auto-ack peer offer: {}", e);
        }
    }

    inner.queue.push(kind, json, raw);
}

async fn auto_ack_offer(inner: &Arc<SessionInner>, notification: &Value) -> Result<()> {
    let payload = message::payload_from_notification(notification)?;
    let message = SessionMessage::parse(&payload)?;
    if message.action == SessionMessageAction::Offer {
        debug!("auto-acknowledging peer OFFER with reqId {}", message.req_id);
        let ack = SessionMessage {
            action: SessionMessageAction::Result,
            req_id: message.req_id,
            error: 0,
            conn_request: None,
        };
        inner.send_session_message(&ack).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue_with(kinds: &[NotificationKind]) -> Arc<NotificationQueue> {
        let queue = Arc::new(NotificationQueue::default());
        for kind in kinds {
            queue.push(*kind, Value::Null, String::new());
        }
        queue
    }

    fn deadline_in(duration: Duration) -> Instant {
        Instant::now() + duration
    }

    #[test]
    fn test_notification_kind_from_data_type() {
        assert_eq!(
            NotificationKind::from_data_type("psn:sessionManager:sys:remotePlaySession:created"),
            NotificationKind::SessionCreated
        );
        assert_eq!(
            NotificationKind::from_data_type("psn:sessionManager:sys:rps:members:created"),
            NotificationKind::MemberCreated
        );
        assert_eq!(
            NotificationKind::from_data_type("psn:sessionManager:sys:rps:members:deleted"),
            NotificationKind::MemberDeleted
        );
        assert_eq!(
            NotificationKind::from_data_type("psn:sessionManager:sys:rps:customData1:updated"),
            NotificationKind::CustomData1Updated
        );
        assert_eq!(
            NotificationKind::from_data_type("psn:sessionManager:sys:rps:sessionMessage:created"),
            NotificationKind::SessionMessageCreated
        );
        assert_eq!(
            NotificationKind::from_data_type("psn:something:else"),
            NotificationKind::Unknown
        );
    }

    #[tokio::test]
    async fn test_waiter_sees_notifications_in_insertion_order() {
        let queue = queue_with(&[
            NotificationKind::SessionCreated,
            NotificationKind::MemberCreated,
        ]);
        let mut waiter = NotificationWaiter::new(queue);
        let mask = NotificationKind::SessionCreated.mask() | NotificationKind::MemberCreated.mask();

        let first = waiter
            .wait(mask, deadline_in(Duration::from_secs(1)), "test")
            .await
            .expect("first notification");
        assert_eq!(first.kind, NotificationKind::SessionCreated);

        let second = waiter
            .wait(mask, deadline_in(Duration::from_secs(1)), "test")
            .await
            .expect("second notification");
        assert_eq!(second.kind, NotificationKind::MemberCreated);
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn test_waiter_skips_unrequested_kinds_without_revisiting() {
        let queue = queue_with(&[
            NotificationKind::MemberDeleted,
            NotificationKind::SessionMessageCreated,
        ]);
        let mut waiter = NotificationWaiter::new(queue.clone());

        let found = waiter
            .wait(
                NotificationKind::SessionMessageCreated.mask(),
                deadline_in(Duration::from_secs(1)),
                "test",
            )
            .await
            .expect("session message notification");
        assert_eq!(found.kind, NotificationKind::SessionMessageCreated);

        // The skipped MemberDeleted entry is behind the cursor now.
        let err = waiter
            .wait(
                NotificationKind::MemberDeleted.mask(),
                deadline_in(Duration::from_millis(50)),
                "member deleted",
            )
            .await
            .expect_err("nothing new to see");
        assert!(matches!(err, HolepunchError::Timeout("member deleted")));
    }

    #[tokio::test]
    async fn test_two_waiters_each_observe_every_notification() {
        let queue = queue_with(&[NotificationKind::SessionCreated]);
        let mut first = NotificationWaiter::new(queue.clone());
        let mut second = NotificationWaiter::new(queue);
        let mask = NotificationKind::SessionCreated.mask();

        let deadline = deadline_in(Duration::from_secs(1));
        let a = first.wait(mask, deadline, "test").await.expect("waiter one");
        let b = second.wait(mask, deadline, "test").await.expect("waiter two");
        assert_eq!(a.seq, b.seq);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_concurrent_push() {
        let queue = Arc::new(NotificationQueue::default());
        let pusher = queue.clone();
        let mut waiter = NotificationWaiter::new(queue);

        let push = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push(NotificationKind::CustomData1Updated, Value::Null, String::new());
        });

        let found = waiter
            .wait(
                NotificationKind::CustomData1Updated.mask(),
                deadline_in(Duration::from_secs(1)),
                "test",
            )
            .await
            .expect("pushed notification");
        assert_eq!(found.kind, NotificationKind::CustomData1Updated);
        push.await.expect("pusher task");
    }

    #[tokio::test]
    async fn test_cleared_notification_is_not_seen_by_new_waiters() {
        let queue = queue_with(&[NotificationKind::SessionCreated]);
        let mut waiter = NotificationWaiter::new(queue.clone());
        let mask = NotificationKind::SessionCreated.mask();

        let found = waiter
            .wait(mask, deadline_in(Duration::from_secs(1)), "test")
            .await
            .expect("notification");
        queue.clear(found.seq);

        let mut fresh = NotificationWaiter::new(queue);
        let err = fresh
            .wait(mask, deadline_in(Duration::from_millis(50)), "cleared")
            .await
            .expect_err("queue is empty");
        assert!(matches!(err, HolepunchError::Timeout("cleared")));
    }

    #[test]
    fn test_auto_ack_predicate() {
        let mut state = SessionState::INIT;
        assert!(!should_auto_ack(state));

        state.insert(SessionState::CTRL_OFFER_RECEIVED);
        assert!(should_auto_ack(state));

        state.insert(SessionState::CTRL_ESTABLISHED);
        assert!(!should_auto_ack(state));

        state.insert(SessionState::DATA_OFFER_RECEIVED);
        assert!(should_auto_ack(state));

        state.insert(SessionState::DATA_ESTABLISHED);
        // Offers after the data phase are still acked
        assert!(should_auto_ack(state));
    }
}
