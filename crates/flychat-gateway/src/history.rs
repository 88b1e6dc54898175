use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use flychat_db::Store;
use flychat_types::events::{HistoryPage, MessagePayload};
use flychat_types::models::{ChatTarget, Message};

use crate::error::{ChatError, ChatResult, blocking};

/// Largest page a client may ask for.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Paged, read-tracking access to stored conversations.
pub struct HistoryService {
    store: Arc<dyn Store>,
}

impl HistoryService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Page `page` (1-based, newest page first) of a conversation as seen by
    /// `requester`. Messages within the page are oldest first. Loading a
    /// private page marks the requester's incoming messages on it as read.
    pub async fn page(
        &self,
        chat: ChatTarget,
        page: u32,
        page_size: u32,
        requester: Uuid,
    ) -> ChatResult<HistoryPage> {
        if page < 1 {
            return Err(ChatError::validation("page must be at least 1"));
        }
        if page_size < 1 {
            return Err(ChatError::validation("page size must be at least 1"));
        }
        let size = page_size.min(MAX_PAGE_SIZE);
        let offset = (page as u64 - 1) * size as u64;

        let (mut messages, names) = blocking(&self.store, move |s| {
            // One extra row tells us whether an older page exists
            let messages = match chat {
                ChatTarget::Group => s.group_messages(offset, size + 1)?,
                ChatTarget::User(peer) => s.private_messages(requester, peer, offset, size + 1)?,
            };

            if !chat.is_group() {
                let incoming: Vec<i64> = messages
                    .iter()
                    .take(size as usize)
                    .filter(|m| m.receiver_id == Some(requester) && !m.is_read)
                    .map(|m| m.id)
                    .collect();
                if !incoming.is_empty() {
                    let changed = s.mark_read(&incoming, requester)?;
                    debug!("{} read {} messages", requester, changed);
                }
            }

            let names = usernames(s, messages.iter().map(|m| m.sender_id))?;
            Ok((messages, names))
        })
        .await?;

        let has_more = messages.len() > size as usize;
        messages.truncate(size as usize);

        let payloads = messages
            .iter()
            .rev()
            .map(|message| to_payload(message, &names, requester))
            .collect();

        Ok(HistoryPage {
            chat_id: chat,
            messages: payloads,
            page,
            has_more,
        })
    }

    /// Unread private messages addressed to `user`, keyed by sender.
    pub async fn unread_counts(&self, user: Uuid) -> ChatResult<HashMap<Uuid, u64>> {
        let counts = blocking(&self.store, move |s| s.unread_counts(user)).await?;
        Ok(counts.into_iter().collect())
    }
}

fn to_payload(message: &Message, names: &HashMap<Uuid, String>, viewer: Uuid) -> MessagePayload {
    let username = names.get(&message.sender_id).map(String::as_str).unwrap_or("unknown");
    let mut payload = MessagePayload::new(message, username, viewer);
    // Marked read by this very load
    if message.receiver_id == Some(viewer) {
        payload.is_read = true;
    }
    payload
}

fn usernames(
    store: &dyn Store,
    ids: impl Iterator<Item = Uuid>,
) -> anyhow::Result<HashMap<Uuid, String>> {
    let mut names = HashMap::new();
    for id in ids {
        if names.contains_key(&id) {
            continue;
        }
        if let Some(user) = store.user_by_id(id)? {
            names.insert(id, user.username);
        }
    }
    Ok(names)
}
