//! In-process [`Store`] used by tests and by `FLYCHAT_STORE=memory` runs.
//! Everything lives behind one mutex, so each method is trivially atomic.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use flychat_types::models::{FriendRequest, FriendRequestStatus, Friendship, Message, NewMessage, User};

use crate::store::Store;

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    messages: Vec<Message>,
    friend_requests: Vec<FriendRequest>,
    friendships: Vec<Friendship>,
    last_message_id: i64,
    last_request_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tables) -> T,
    {
        let mut tables = self
            .tables
            .lock()
            .map_err(|e| anyhow!("memory store lock poisoned: {}", e))?;
        Ok(f(&mut tables))
    }
}

/// Newest first, same tie-break as the SQL store.
fn newest_first(mut messages: Vec<Message>, offset: u64, limit: u32) -> Vec<Message> {
    messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    messages
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect()
}

impl Store for MemoryStore {
    fn insert_user(&self, user: &User) -> Result<bool> {
        self.with_tables(|t| {
            if t.users.iter().any(|u| u.username == user.username || u.id == user.id) {
                return false;
            }
            t.users.push(user.clone());
            true
        })
    }

    fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        self.with_tables(|t| t.users.iter().find(|u| u.id == id).cloned())
    }

    fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.with_tables(|t| t.users.iter().find(|u| u.username == username).cloned())
    }

    fn search_users(&self, keyword: &str, exclude: Uuid, limit: u32) -> Result<Vec<User>> {
        let needle = keyword.to_lowercase();
        self.with_tables(|t| {
            let mut found: Vec<User> = t
                .users
                .iter()
                .filter(|u| u.id != exclude && u.username.to_lowercase().contains(&needle))
                .cloned()
                .collect();
            found.sort_by(|a, b| a.username.cmp(&b.username));
            found.truncate(limit as usize);
            found
        })
    }

    fn update_avatar(&self, id: Uuid, avatar: &str) -> Result<bool> {
        self.with_tables(|t| match t.users.iter_mut().find(|u| u.id == id) {
            Some(user) => {
                user.avatar = avatar.to_string();
                true
            }
            None => false,
        })
    }

    fn insert_message(&self, message: NewMessage) -> Result<Message> {
        self.with_tables(|t| {
            t.last_message_id += 1;
            let stored = Message {
                id: t.last_message_id,
                sender_id: message.sender_id,
                receiver_id: message.receiver_id,
                is_group: message.is_group(),
                content: message.content,
                is_read: false,
                created_at: message.created_at,
            };
            t.messages.push(stored.clone());
            stored
        })
    }

    fn group_messages(&self, offset: u64, limit: u32) -> Result<Vec<Message>> {
        self.with_tables(|t| {
            let group = t.messages.iter().filter(|m| m.is_group).cloned().collect();
            newest_first(group, offset, limit)
        })
    }

    fn private_messages(&self, a: Uuid, b: Uuid, offset: u64, limit: u32) -> Result<Vec<Message>> {
        self.with_tables(|t| {
            let conversation = t
                .messages
                .iter()
                .filter(|m| {
                    !m.is_group
                        && ((m.sender_id == a && m.receiver_id == Some(b))
                            || (m.sender_id == b && m.receiver_id == Some(a)))
                })
                .cloned()
                .collect();
            newest_first(conversation, offset, limit)
        })
    }

    fn mark_read(&self, ids: &[i64], receiver: Uuid) -> Result<usize> {
        self.with_tables(|t| {
            let mut changed = 0;
            for message in t.messages.iter_mut() {
                if message.receiver_id == Some(receiver) && !message.is_read && ids.contains(&message.id) {
                    message.is_read = true;
                    changed += 1;
                }
            }
            changed
        })
    }

    fn unread_counts(&self, receiver: Uuid) -> Result<Vec<(Uuid, u64)>> {
        self.with_tables(|t| {
            let mut counts: HashMap<Uuid, u64> = HashMap::new();
            for message in &t.messages {
                if message.receiver_id == Some(receiver) && !message.is_read {
                    *counts.entry(message.sender_id).or_default() += 1;
                }
            }
            counts.into_iter().collect()
        })
    }

    fn insert_friend_request(
        &self,
        from: Uuid,
        to: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<Option<FriendRequest>> {
        self.with_tables(|t| {
            let duplicate = t.friend_requests.iter().any(|r| {
                r.from_id == from && r.to_id == to && r.status == FriendRequestStatus::Pending
            });
            if duplicate {
                return None;
            }
            t.last_request_id += 1;
            let request = FriendRequest {
                id: t.last_request_id,
                from_id: from,
                to_id: to,
                status: FriendRequestStatus::Pending,
                created_at,
            };
            t.friend_requests.push(request.clone());
            Some(request)
        })
    }

    fn friend_request(&self, id: i64) -> Result<Option<FriendRequest>> {
        self.with_tables(|t| t.friend_requests.iter().find(|r| r.id == id).cloned())
    }

    fn pending_request_between(&self, from: Uuid, to: Uuid) -> Result<Option<FriendRequest>> {
        self.with_tables(|t| {
            t.friend_requests
                .iter()
                .find(|r| r.from_id == from && r.to_id == to && r.status == FriendRequestStatus::Pending)
                .cloned()
        })
    }

    fn pending_requests_for(&self, to: Uuid) -> Result<Vec<FriendRequest>> {
        self.with_tables(|t| {
            t.friend_requests
                .iter()
                .filter(|r| r.to_id == to && r.status == FriendRequestStatus::Pending)
                .cloned()
                .collect()
        })
    }

    fn resolve_friend_request(&self, id: i64, status: FriendRequestStatus) -> Result<bool> {
        self.with_tables(|t| {
            match t
                .friend_requests
                .iter_mut()
                .find(|r| r.id == id && r.status == FriendRequestStatus::Pending)
            {
                Some(request) => {
                    request.status = status;
                    true
                }
                None => false,
            }
        })
    }

    fn dangling_acceptances(&self) -> Result<Vec<FriendRequest>> {
        self.with_tables(|t| {
            t.friend_requests
                .iter()
                .filter(|r| r.status == FriendRequestStatus::Accepted)
                .filter(|r| {
                    let pair = Friendship::new(r.from_id, r.to_id, r.created_at);
                    !t.friendships
                        .iter()
                        .any(|f| f.user_a == pair.user_a && f.user_b == pair.user_b)
                })
                .cloned()
                .collect()
        })
    }

    fn insert_friendship(&self, friendship: &Friendship) -> Result<bool> {
        self.with_tables(|t| {
            let exists = t
                .friendships
                .iter()
                .any(|f| f.user_a == friendship.user_a && f.user_b == friendship.user_b);
            if exists {
                return false;
            }
            t.friendships.push(friendship.clone());
            true
        })
    }

    fn friendship_exists(&self, a: Uuid, b: Uuid) -> Result<bool> {
        self.with_tables(|t| t.friendships.iter().any(|f| f.involves(a) && f.partner_of(a) == b))
    }

    fn friendships_of(&self, user: Uuid) -> Result<Vec<Friendship>> {
        self.with_tables(|t| t.friendships.iter().filter(|f| f.involves(user)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(from: Uuid, to: Option<Uuid>) -> NewMessage {
        NewMessage {
            sender_id: from,
            receiver_id: to,
            content: "hello".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn private_conversation_is_filtered_by_pair() {
        let store = MemoryStore::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let ab = store.insert_message(new_message(a, Some(b))).unwrap();
        let ba = store.insert_message(new_message(b, Some(a))).unwrap();
        store.insert_message(new_message(a, Some(c))).unwrap();
        store.insert_message(new_message(a, None)).unwrap();

        let page = store.private_messages(a, b, 0, 10).unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ba.id, ab.id]);
    }

    #[test]
    fn resolve_is_a_one_shot_transition() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let request = store.insert_friend_request(a, b, Utc::now()).unwrap().unwrap();
        assert!(store.insert_friend_request(a, b, Utc::now()).unwrap().is_none());
        assert!(store.resolve_friend_request(request.id, FriendRequestStatus::Accepted).unwrap());
        assert!(!store.resolve_friend_request(request.id, FriendRequestStatus::Rejected).unwrap());
        assert_eq!(store.dangling_acceptances().unwrap().len(), 1);

        assert!(store.insert_friendship(&Friendship::new(b, a, Utc::now())).unwrap());
        assert!(store.friendship_exists(a, b).unwrap());
        assert!(store.dangling_acceptances().unwrap().is_empty());
    }
}
