use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flychat_db::Store;
use flychat_types::events::{ClientEvent, ServerEvent};

use crate::auth::{AuthService, Identity};
use crate::error::{ChatError, ChatResult, blocking};
use crate::friends::FriendRequestCoordinator;
use crate::history::HistoryService;
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::router::MessageRouter;

/// Largest accepted avatar, in bytes.
pub const MAX_AVATAR_BYTES: usize = 512 * 1024;

/// Lifecycle of one gateway connection. The transport holds it until the
/// credential is verified; a [`Session`] starts out Active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Upgraded, no credential seen yet
    Connecting,
    /// Credential verified, not yet bound in the registry
    Authenticated,
    /// Bound and dispatching
    Active,
    Closed,
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// How long an unauthenticated socket may wait before `identify`
    pub auth_timeout: Duration,
    /// Per-connection outbound queue depth
    pub outbound_capacity: usize,
    pub heartbeat_interval: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            outbound_capacity: 256,
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// One authenticated, registered connection.
#[derive(Debug)]
pub struct Session {
    identity: Identity,
    handle: ConnectionHandle,
    state: SessionState,
}

impl Session {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }
}

/// Authenticates connections, binds them to the presence registry and
/// dispatches their inbound events. Cheap to clone.
#[derive(Clone)]
pub struct SessionGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    store: Arc<dyn Store>,
    auth: Arc<dyn AuthService>,
    registry: Arc<PresenceRegistry>,
    router: MessageRouter,
    friends: FriendRequestCoordinator,
    history: HistoryService,
    settings: GatewaySettings,
}

impl SessionGateway {
    pub fn new(store: Arc<dyn Store>, auth: Arc<dyn AuthService>, settings: GatewaySettings) -> Self {
        let registry = Arc::new(PresenceRegistry::new());
        Self {
            inner: Arc::new(GatewayInner {
                router: MessageRouter::new(store.clone(), registry.clone()),
                friends: FriendRequestCoordinator::new(store.clone(), registry.clone()),
                history: HistoryService::new(store.clone()),
                store,
                auth,
                registry,
                settings,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn auth(&self) -> &dyn AuthService {
        self.inner.auth.as_ref()
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.inner.registry
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn friends(&self) -> &FriendRequestCoordinator {
        &self.inner.friends
    }

    pub fn history(&self) -> &HistoryService {
        &self.inner.history
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.inner.settings
    }

    /// Resolves a bearer credential to a live account.
    pub async fn authenticate(&self, token: &str) -> ChatResult<Identity> {
        let user_id = self.inner.auth.verify(token)?;
        let user = blocking(&self.inner.store, move |s| s.user_by_id(user_id))
            .await?
            .ok_or_else(|| ChatError::authentication("account no longer exists"))?;
        Ok(Identity {
            user_id: user.id,
            username: user.username,
        })
    }

    /// Binds a new connection for `identity`, closing any connection it
    /// replaces. `ready` is the first event on the returned queue.
    pub async fn open(&self, identity: Identity) -> (Session, mpsc::Receiver<ServerEvent>) {
        let (handle, rx) = ConnectionHandle::new(self.inner.settings.outbound_capacity);

        // Queue is empty, so this cannot be refused
        let _ = handle.try_deliver(ServerEvent::Ready {
            user_id: identity.user_id,
            username: identity.username.clone(),
        });

        let previous = self
            .inner
            .registry
            .register(identity.user_id, identity.username.clone(), handle.clone())
            .await;
        if let Some(previous) = previous {
            info!(
                "{} ({}) reconnected, closing connection {}",
                identity.username,
                identity.user_id,
                previous.conn_id()
            );
            previous.close();
        }

        debug!("{} connection {} active", identity.username, handle.conn_id());
        let session = Session {
            identity,
            handle,
            state: SessionState::Active,
        };
        (session, rx)
    }

    /// Handles one inbound event. Returns the direct reply for the caller's
    /// own connection, if the event has one. Failures become `error` replies.
    pub async fn dispatch(&self, session: &Session, event: ClientEvent) -> Option<ServerEvent> {
        if session.state != SessionState::Active {
            return None;
        }

        let kind = event.kind();
        let identity = &session.identity;
        match self.handle_event(identity, event).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("{} ({}) {} failed: {}", identity.username, identity.user_id, kind, e);
                Some(ServerEvent::error(e.user_message()))
            }
        }
    }

    async fn handle_event(&self, identity: &Identity, event: ClientEvent) -> ChatResult<Option<ServerEvent>> {
        match event {
            ClientEvent::Identify { .. } => Err(ChatError::validation("connection is already identified")),

            ClientEvent::SendMessage { to, content } => {
                // Echo and fan-out go through the registry
                self.inner.router.route(identity, to, &content).await?;
                Ok(None)
            }

            ClientEvent::LoadMessages { chat_id, page, limit } => {
                let page = self
                    .inner
                    .history
                    .page(chat_id, page, limit, identity.user_id)
                    .await?;
                Ok(Some(ServerEvent::HistoryMessages(page)))
            }

            ClientEvent::SendFriendRequest { user_id } => {
                let request = self.inner.friends.send_request(identity, user_id).await?;
                Ok(Some(ServerEvent::FriendRequestSent {
                    id: request.id,
                    to: request.to_id,
                }))
            }

            ClientEvent::RespondToFriendRequest { request_id, accept } => {
                let request = self.inner.friends.respond(request_id, identity, accept).await?;
                Ok(Some(ServerEvent::FriendRequestResolved {
                    id: request.id,
                    status: request.status,
                }))
            }

            ClientEvent::UpdateAvatar { avatar } => {
                let avatar = self.update_avatar(identity.user_id, avatar).await?;
                Ok(Some(ServerEvent::AvatarUpdated { avatar }))
            }
        }
    }

    async fn update_avatar(&self, user_id: Uuid, avatar: String) -> ChatResult<String> {
        if avatar.trim().is_empty() {
            return Err(ChatError::validation("avatar cannot be empty"));
        }
        if avatar.len() > MAX_AVATAR_BYTES {
            return Err(ChatError::validation(format!(
                "avatar cannot exceed {} KiB",
                MAX_AVATAR_BYTES / 1024
            )));
        }

        let stored = avatar.clone();
        let updated = blocking(&self.inner.store, move |s| s.update_avatar(user_id, &stored)).await?;
        if !updated {
            return Err(ChatError::NotFound("user"));
        }
        Ok(avatar)
    }

    /// Unbinds the session (only if it is still the bound one) and shuts its
    /// connection down. Idempotent.
    pub async fn close(&self, session: &mut Session) {
        if session.state == SessionState::Closed {
            return;
        }
        session.state = SessionState::Closed;
        self.inner
            .registry
            .unregister(session.identity.user_id, &session.handle)
            .await;
        session.handle.close();
        debug!("{} connection {} closed", session.identity.username, session.handle.conn_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flychat_db::MemoryStore;
    use flychat_types::models::{ChatTarget, FriendRequestStatus, User};

    use crate::auth::JwtAuthService;

    fn gateway() -> (Arc<MemoryStore>, SessionGateway) {
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(JwtAuthService::new("test-secret", chrono::Duration::days(1)));
        let gateway = SessionGateway::new(store.clone(), auth, GatewaySettings::default());
        (store, gateway)
    }

    fn add_user(store: &MemoryStore, name: &str) -> Identity {
        let user = User {
            id: Uuid::new_v4(),
            username: name.into(),
            password_hash: String::new(),
            avatar: String::new(),
            created_at: Utc::now(),
        };
        store.insert_user(&user).unwrap();
        Identity {
            user_id: user.id,
            username: user.username,
        }
    }

    #[tokio::test]
    async fn authenticate_requires_valid_token_and_live_account() {
        let (store, gateway) = gateway();
        let alice = add_user(&store, "alice");

        let token = gateway.auth().issue(alice.user_id, "alice").unwrap();
        assert_eq!(gateway.authenticate(&token).await.unwrap(), alice);

        let ghost = gateway.auth().issue(Uuid::new_v4(), "ghost").unwrap();
        assert!(matches!(
            gateway.authenticate(&ghost).await,
            Err(ChatError::Authentication(_))
        ));
        assert!(gateway.authenticate("garbage").await.is_err());
    }

    #[tokio::test]
    async fn open_sends_ready_first_and_replaces_previous_connection() {
        let (store, gateway) = gateway();
        let alice = add_user(&store, "alice");

        let (mut first, mut rx1) = gateway.open(alice.clone()).await;
        assert_eq!(
            rx1.recv().await,
            Some(ServerEvent::Ready {
                user_id: alice.user_id,
                username: "alice".into()
            })
        );
        assert!(matches!(rx1.recv().await, Some(ServerEvent::UpdateUserList(_))));

        let (mut second, _rx2) = gateway.open(alice.clone()).await;
        assert!(first.handle().is_closed());
        assert!(!second.handle().is_closed());

        // The replaced session's disconnect must not unbind the new one
        gateway.close(&mut first).await;
        assert_eq!(gateway.registry().lookup(alice.user_id).await.as_ref(), Some(second.handle()));

        gateway.close(&mut second).await;
        assert_eq!(second.state(), SessionState::Closed);
        assert!(!gateway.registry().is_online(alice.user_id).await);
    }

    #[tokio::test]
    async fn dispatch_replies_and_reports_errors() {
        let (store, gateway) = gateway();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");
        let (session, _rx) = gateway.open(alice.clone()).await;

        let reply = gateway
            .dispatch(
                &session,
                ClientEvent::SendMessage {
                    to: ChatTarget::Group,
                    content: "hi".into(),
                },
            )
            .await;
        assert_eq!(reply, None);

        let reply = gateway
            .dispatch(
                &session,
                ClientEvent::LoadMessages {
                    chat_id: ChatTarget::Group,
                    page: 1,
                    limit: 20,
                },
            )
            .await;
        match reply {
            Some(ServerEvent::HistoryMessages(page)) => {
                assert_eq!(page.messages.len(), 1);
                assert!(page.messages[0].is_self);
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        let reply = gateway
            .dispatch(&session, ClientEvent::SendFriendRequest { user_id: bob.user_id })
            .await;
        let Some(ServerEvent::FriendRequestSent { id, to }) = reply else {
            panic!("unexpected reply: {:?}", reply);
        };
        assert_eq!(to, bob.user_id);

        let reply = gateway
            .dispatch(
                &session,
                ClientEvent::RespondToFriendRequest {
                    request_id: id,
                    accept: true,
                },
            )
            .await;
        assert!(matches!(reply, Some(ServerEvent::Error { .. })));

        let (bob_session, _rx_b) = gateway.open(bob).await;
        let reply = gateway
            .dispatch(
                &bob_session,
                ClientEvent::RespondToFriendRequest {
                    request_id: id,
                    accept: false,
                },
            )
            .await;
        assert_eq!(
            reply,
            Some(ServerEvent::FriendRequestResolved {
                id,
                status: FriendRequestStatus::Rejected
            })
        );

        let reply = gateway
            .dispatch(&session, ClientEvent::Identify { token: "x".into() })
            .await;
        assert!(matches!(reply, Some(ServerEvent::Error { .. })));
    }

    #[tokio::test]
    async fn avatar_updates_are_bounded() {
        let (store, gateway) = gateway();
        let alice = add_user(&store, "alice");
        let (session, _rx) = gateway.open(alice.clone()).await;

        let reply = gateway
            .dispatch(
                &session,
                ClientEvent::UpdateAvatar {
                    avatar: "data:image/png;base64,AAAA".into(),
                },
            )
            .await;
        assert!(matches!(reply, Some(ServerEvent::AvatarUpdated { .. })));
        assert_eq!(
            store.user_by_id(alice.user_id).unwrap().unwrap().avatar,
            "data:image/png;base64,AAAA"
        );

        let huge = "a".repeat(MAX_AVATAR_BYTES + 1);
        let reply = gateway
            .dispatch(&session, ClientEvent::UpdateAvatar { avatar: huge })
            .await;
        assert!(matches!(reply, Some(ServerEvent::Error { .. })));
    }

    #[tokio::test]
    async fn closed_sessions_do_not_dispatch() {
        let (store, gateway) = gateway();
        let alice = add_user(&store, "alice");
        let (mut session, _rx) = gateway.open(alice).await;
        gateway.close(&mut session).await;

        let reply = gateway
            .dispatch(
                &session,
                ClientEvent::SendMessage {
                    to: ChatTarget::Group,
                    content: "late".into(),
                },
            )
            .await;
        assert_eq!(reply, None);
        assert!(store.group_messages(0, 10).unwrap().is_empty());
    }
}
