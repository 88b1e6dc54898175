use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use flychat_types::events::{OnlineUser, ServerEvent};

/// Why an event did not reach a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("user is offline")]
    Offline,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("connection is closed")]
    Closed,
}

/// Sending side of one live connection. Clones share the same queue and
/// close signal; identity is the connection id, never the user.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle with a bounded outbound queue. The receiver belongs
    /// to the connection's writer task.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            conn_id: Uuid::new_v4(),
            tx,
            closed: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Non-blocking enqueue. A full queue drops the event.
    pub fn try_deliver(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Waits for queue space. Only for replies on the caller's own
    /// connection, where back-pressure lands on the caller itself.
    pub async fn send(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.tx.send(event).await.map_err(|_| DeliveryError::Closed)
    }

    /// Asks the connection to shut down. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called on any clone.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.conn_id == other.conn_id
    }
}

impl Eq for ConnectionHandle {}

struct Session {
    username: String,
    handle: ConnectionHandle,
}

/// Who is reachable right now, and through which connection.
///
/// All mutations take the write lock and broadcast the resulting user list
/// before releasing it, so every connection sees presence snapshots in the
/// order the mutations happened. Broadcasting never awaits a peer.
#[derive(Default)]
pub struct PresenceRegistry {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handle` to the user, replacing any previous binding. Returns
    /// the replaced handle so the caller can close it.
    pub async fn register(
        &self,
        user_id: Uuid,
        username: String,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let mut sessions = self.sessions.write().await;
        let previous = sessions
            .insert(user_id, Session { username, handle })
            .map(|session| session.handle);
        debug!(
            "{} registered ({} online, replaced: {})",
            user_id,
            sessions.len(),
            previous.is_some()
        );
        broadcast_user_list(&sessions);
        previous
    }

    /// Removes the binding only if `handle` is still the one registered.
    /// A disconnect that lost the race against a reconnect is a no-op.
    pub async fn unregister(&self, user_id: Uuid, handle: &ConnectionHandle) -> bool {
        let mut sessions = self.sessions.write().await;
        let is_current = sessions
            .get(&user_id)
            .is_some_and(|session| session.handle == *handle);

        if !is_current {
            debug!("{} stale unregister for connection {} ignored", user_id, handle.conn_id());
            return false;
        }

        sessions.remove(&user_id);
        broadcast_user_list(&sessions);
        true
    }

    pub async fn lookup(&self, user_id: Uuid) -> Option<ConnectionHandle> {
        self.sessions
            .read()
            .await
            .get(&user_id)
            .map(|session| session.handle.clone())
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&user_id)
    }

    /// Snapshot of everyone online, sorted by username.
    pub async fn list_online(&self) -> Vec<OnlineUser> {
        user_list(&*self.sessions.read().await)
    }

    /// Enqueues an event for one user without waiting.
    pub async fn deliver(&self, user_id: Uuid, event: ServerEvent) -> Result<(), DeliveryError> {
        match self.lookup(user_id).await {
            Some(handle) => handle.try_deliver(event),
            None => Err(DeliveryError::Offline),
        }
    }

    /// Best-effort [`deliver`](Self::deliver): failures are logged and
    /// swallowed so an unreachable peer never fails the caller. Returns
    /// whether the event was enqueued.
    pub async fn notify(&self, user_id: Uuid, event: ServerEvent) -> bool {
        let kind = event.kind();
        match self.deliver(user_id, event).await {
            Ok(()) => true,
            Err(DeliveryError::Offline) => false,
            Err(e) => {
                warn!("Dropped {} for {}: {}", kind, user_id, e);
                false
            }
        }
    }

    /// Delivers to every online user except `exclude`. Returns how many
    /// connections accepted the event.
    pub async fn broadcast_except(&self, exclude: Uuid, event: &ServerEvent) -> usize {
        let sessions = self.sessions.read().await;
        let mut delivered = 0;
        for (&user_id, session) in sessions.iter() {
            if user_id == exclude {
                continue;
            }
            match session.handle.try_deliver(event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Dropped {} for {}: {}", event.kind(), user_id, e),
            }
        }
        delivered
    }
}

fn user_list(sessions: &HashMap<Uuid, Session>) -> Vec<OnlineUser> {
    let mut users: Vec<OnlineUser> = sessions
        .iter()
        .map(|(id, session)| OnlineUser {
            id: *id,
            username: session.username.clone(),
        })
        .collect();
    users.sort_by(|a, b| a.username.cmp(&b.username).then(a.id.cmp(&b.id)));
    users
}

fn broadcast_user_list(sessions: &HashMap<Uuid, Session>) {
    let event = ServerEvent::UpdateUserList(user_list(sessions));
    for (user_id, session) in sessions.iter() {
        if let Err(e) = session.handle.try_deliver(event.clone()) {
            warn!("Presence update dropped for {}: {}", user_id, e);
        }
    }
}
