//! Control-plane socket (§4.7): a realtime channel, distinct from SSE,
//! used to push permission-changed events and online-session snapshots to
//! a user's connected devices, and to receive get/set-capability and
//! configure/unconfigure-server operations back from a device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Opaque id for one connected device socket (a user may have several).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

impl SocketId {
    fn next() -> Self {
        Self(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A message pushed down the control-plane socket to a device: either a
/// fire-and-forget event or a request awaiting a keyed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlPlaneMessage {
    /// `comparePermissions` fired for this user; devices should refetch
    /// their effective capability view.
    PermissionsChanged { user_id: String },
    /// Snapshot of the user's currently-online sessions.
    OnlineSessions { session_ids: Vec<String> },
    /// A request/response round trip keyed by `request_id` (get/set
    /// capabilities, configure/unconfigure server).
    Request {
        request_id: String,
        operation: String,
        payload: Value,
    },
    Response {
        request_id: String,
        payload: Value,
    },
}

/// One connected device's outbound channel plus bookkeeping needed to
/// cancel in-flight round trips when the socket disconnects.
pub struct ControlPlaneSocket {
    pub id: SocketId,
    pub user_id: String,
    sender: mpsc::Sender<ControlPlaneMessage>,
    pub cancellation: CancellationToken,
}

impl ControlPlaneSocket {
    pub fn send(&self, message: ControlPlaneMessage) {
        if let Err(err) = self.sender.try_send(message) {
            warn!(socket_id = ?self.id, error = %err, "dropping control-plane message, channel full or closed");
        }
    }
}

/// Rooms keyed by `userId`, each holding every device socket currently
/// connected for that user, plus the table of in-flight request/response
/// round trips.
#[derive(Default)]
pub struct ControlPlaneNotifier {
    rooms: DashMap<String, Vec<Arc<ControlPlaneSocket>>>,
    pending_requests: DashMap<String, oneshot::Sender<Value>>,
}

impl ControlPlaneNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly-authenticated device socket (bearer token
    /// validated the same way as `/mcp`, per §4.7) and returns the handle
    /// plus its outbound receiver for the wire adapter to drive.
    pub fn register(&self, user_id: String) -> (Arc<ControlPlaneSocket>, mpsc::Receiver<ControlPlaneMessage>) {
        let (sender, receiver) = mpsc::channel(64);
        let socket = Arc::new(ControlPlaneSocket {
            id: SocketId::next(),
            user_id: user_id.clone(),
            sender,
            cancellation: CancellationToken::new(),
        });
        self.rooms.entry(user_id).or_default().push(socket.clone());
        (socket, receiver)
    }

    /// Unregisters a socket on disconnect, cancelling any round trips
    /// that were awaiting a response on it.
    pub fn unregister(&self, socket: &ControlPlaneSocket) {
        if let Some(mut room) = self.rooms.get_mut(&socket.user_id) {
            room.retain(|s| s.id != socket.id);
        }
        socket.cancellation.cancel();
    }

    /// Routes a fire-and-forget message to every socket in `userId`'s room.
    pub fn send_to_user(&self, user_id: &str, message: ControlPlaneMessage) {
        if let Some(room) = self.rooms.get(user_id) {
            for socket in room.iter() {
                socket.send(message.clone());
            }
        }
    }

    #[must_use]
    pub fn room_size(&self, user_id: &str) -> usize {
        self.rooms.get(user_id).map(|r| r.len()).unwrap_or(0)
    }

    /// Sends a request to one socket and awaits its keyed response, with
    /// a timeout and disconnect-cancellation (§4.7 "per-request timeout
    /// and disconnect-cancellation").
    pub async fn request(
        &self,
        socket: &ControlPlaneSocket,
        operation: String,
        payload: Value,
        timeout: Duration,
    ) -> Option<Value> {
        let request_id = format!("cp_{}_{}", socket.id.0, gateway_types::now_millis());
        let (responder, receiver) = oneshot::channel();
        self.pending_requests.insert(request_id.clone(), responder);

        socket.send(ControlPlaneMessage::Request {
            request_id: request_id.clone(),
            operation,
            payload,
        });

        let result = tokio::select! {
            resp = tokio::time::timeout(timeout, receiver) => match resp {
                Ok(Ok(value)) => Some(value),
                _ => None,
            },
            () = socket.cancellation.cancelled() => None,
        };

        self.pending_requests.remove(&request_id);
        result
    }

    /// Delivers a device's response to whichever `request()` call is
    /// awaiting `request_id`. Returns `false` if no such request is
    /// pending (stale or duplicate response).
    pub fn resolve_response(&self, request_id: &str, payload: Value) -> bool {
        match self.pending_requests.remove(request_id) {
            Some((_, responder)) => responder.send(payload).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_to_user_reaches_every_socket_in_the_room() {
        let notifier = ControlPlaneNotifier::new();
        let (_s1, mut r1) = notifier.register("u1".into());
        let (_s2, mut r2) = notifier.register("u1".into());

        notifier.send_to_user("u1", ControlPlaneMessage::PermissionsChanged { user_id: "u1".into() });

        assert!(r1.try_recv().is_ok());
        assert!(r2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unregister_removes_from_room_and_cancels() {
        let notifier = ControlPlaneNotifier::new();
        let (socket, _rx) = notifier.register("u1".into());
        assert_eq!(notifier.room_size("u1"), 1);
        notifier.unregister(&socket);
        assert_eq!(notifier.room_size("u1"), 0);
        assert!(socket.cancellation.is_cancelled());
    }

    #[tokio::test]
    async fn request_resolves_when_response_arrives() {
        let notifier = Arc::new(ControlPlaneNotifier::new());
        let (socket, mut rx) = notifier.register("u1".into());

        let notifier_clone = notifier.clone();
        let responder = tokio::spawn(async move {
            let ControlPlaneMessage::Request { request_id, .. } = rx.recv().await.unwrap() else {
                panic!("expected request");
            };
            notifier_clone.resolve_response(&request_id, serde_json::json!({"ok": true}));
        });

        let result = notifier
            .request(&socket, "get_capabilities".into(), Value::Null, Duration::from_secs(1))
            .await;
        responder.await.unwrap();
        assert_eq!(result, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn request_times_out_when_no_response_arrives() {
        let notifier = ControlPlaneNotifier::new();
        let (socket, _rx) = notifier.register("u1".into());
        let result = notifier
            .request(&socket, "get_capabilities".into(), Value::Null, Duration::from_millis(50))
            .await;
        assert!(result.is_none());
    }
}
