use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error};

use flychat_db::Store;
use flychat_types::events::{MessagePayload, ServerEvent};
use flychat_types::models::{ChatTarget, Message, NewMessage};

use crate::auth::Identity;
use crate::error::{ChatError, ChatResult, blocking};
use crate::presence::PresenceRegistry;

/// Longest accepted message body, in characters.
pub const MAX_CONTENT_CHARS: usize = 4000;

/// Validates, persists and fans out chat messages.
pub struct MessageRouter {
    store: Arc<dyn Store>,
    registry: Arc<PresenceRegistry>,
    /// Last timestamp handed out. Held across the insert so that id order
    /// and timestamp order agree.
    sequencer: Mutex<DateTime<Utc>>,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn Store>, registry: Arc<PresenceRegistry>) -> Self {
        Self {
            store,
            registry,
            sequencer: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Persists the message, then delivers it: an echo to the sender and
    /// either a broadcast (group) or a direct push to an online receiver.
    /// Nothing is delivered if persisting fails.
    pub async fn route(&self, sender: &Identity, to: ChatTarget, content: &str) -> ChatResult<Message> {
        if content.trim().is_empty() {
            return Err(ChatError::validation("message content cannot be empty"));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(ChatError::validation(format!(
                "message content cannot exceed {} characters",
                MAX_CONTENT_CHARS
            )));
        }

        if let ChatTarget::User(receiver_id) = to {
            let exists = blocking(&self.store, move |s| s.user_by_id(receiver_id)).await?;
            if exists.is_none() {
                return Err(ChatError::NotFound("recipient"));
            }
        }

        let message = self
            .persist(sender, to, content.to_string())
            .await
            .inspect_err(|e| error!("Failed to persist message from {}: {}", sender.user_id, e))?;
        debug!("{} -> {} message {}", sender.username, to, message.id);

        self.fan_out(sender, &message).await;
        Ok(message)
    }

    async fn persist(&self, sender: &Identity, to: ChatTarget, content: String) -> ChatResult<Message> {
        let mut last = self.sequencer.lock().await;

        // Server clock at storage precision, clamped so it never goes backwards
        let created_at = Utc::now().trunc_subsecs(6).max(*last);

        let new_message = NewMessage {
            sender_id: sender.user_id,
            receiver_id: to.user_id(),
            content,
            created_at,
        };
        let message = blocking(&self.store, move |s| s.insert_message(new_message)).await?;
        *last = created_at;
        Ok(message)
    }

    async fn fan_out(&self, sender: &Identity, message: &Message) {
        let echo = ServerEvent::NewMessage(MessagePayload::new(message, &sender.username, sender.user_id));
        self.registry.notify(sender.user_id, echo).await;

        let mut outbound = MessagePayload::new(message, &sender.username, sender.user_id);
        outbound.is_self = false;
        let outbound = ServerEvent::NewMessage(outbound);

        match message.target() {
            ChatTarget::Group => {
                let delivered = self.registry.broadcast_except(sender.user_id, &outbound).await;
                debug!("Group message {} delivered to {} connections", message.id, delivered);
            }
            ChatTarget::User(receiver_id) => {
                // Offline receivers pick it up from history
                if receiver_id != sender.user_id {
                    self.registry.notify(receiver_id, outbound).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flychat_db::MemoryStore;
    use flychat_types::models::User;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::presence::ConnectionHandle;

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

    async fn connect(registry: &PresenceRegistry, who: &Identity) -> mpsc::Receiver<ServerEvent> {
        let (handle, rx) = ConnectionHandle::new(32);
        registry.register(who.user_id, who.username.clone(), handle).await;
        rx
    }

    fn messages(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<MessagePayload> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::NewMessage(payload) = event {
                out.push(payload);
            }
        }
        out
    }

    fn setup() -> (Arc<MemoryStore>, Arc<PresenceRegistry>, MessageRouter) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(PresenceRegistry::new());
        let router = MessageRouter::new(store.clone(), registry.clone());
        (store, registry, router)
    }

    #[tokio::test]
    async fn blank_content_is_rejected_and_not_stored() {
        let (store, _registry, router) = setup();
        let alice = add_user(&store, "alice");

        let err = router.route(&alice, ChatTarget::Group, "   \n").await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let too_long = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(router.route(&alice, ChatTarget::Group, &too_long).await.is_err());
        assert!(store.group_messages(0, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn ids_and_timestamps_increase() {
        let (store, _registry, router) = setup();
        let alice = add_user(&store, "alice");

        let mut previous: Option<Message> = None;
        for i in 0..20 {
            let message = router.route(&alice, ChatTarget::Group, &format!("m{}", i)).await.unwrap();
            assert!(!message.is_read);
            if let Some(prev) = previous {
                assert!(message.id > prev.id);
                assert!(message.created_at >= prev.created_at);
            }
            previous = Some(message);
        }
    }

    #[tokio::test]
    async fn private_message_reaches_only_sender_and_receiver() {
        let (store, registry, router) = setup();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");
        let carol = add_user(&store, "carol");
        let mut rx_a = connect(&registry, &alice).await;
        let mut rx_b = connect(&registry, &bob).await;
        let mut rx_c = connect(&registry, &carol).await;

        let message = router.route(&alice, ChatTarget::User(bob.user_id), "psst").await.unwrap();
        assert_eq!(message.receiver_id, Some(bob.user_id));
        assert!(!message.is_group);

        let echo = messages(&mut rx_a);
        assert_eq!(echo.len(), 1);
        assert!(echo[0].is_self);

        let received = messages(&mut rx_b);
        assert_eq!(received.len(), 1);
        assert!(!received[0].is_self);
        assert_eq!(received[0].from_username, "alice");
        assert_eq!(received[0].to, ChatTarget::User(bob.user_id));

        assert!(messages(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn private_message_to_offline_user_is_still_stored() {
        let (store, registry, router) = setup();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");
        let _rx_a = connect(&registry, &alice).await;

        router.route(&alice, ChatTarget::User(bob.user_id), "later").await.unwrap();
        let stored = store.private_messages(alice.user_id, bob.user_id, 0, 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "later");
    }

    #[tokio::test]
    async fn unknown_recipient_is_not_found() {
        let (store, _registry, router) = setup();
        let alice = add_user(&store, "alice");

        let err = router
            .route(&alice, ChatTarget::User(Uuid::new_v4()), "hello?")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }
}
