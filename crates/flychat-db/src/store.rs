use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use flychat_types::models::{FriendRequest, FriendRequestStatus, Friendship, Message, NewMessage, User};

/// Durable CRUD for users, messages, friend requests and friendships.
///
/// Every method is atomic on its own. Nothing here spans entities in a
/// transaction: callers that need several writes (accepting a request and
/// creating the friendship) must live with the window between them.
///
/// Conditional writes report "lost the race" through their return value
/// rather than an error, so callers can map it to a domain conflict.
pub trait Store: Send + Sync {
    // -- Users --

    /// Inserts `user`. Returns `false` if the username is already taken.
    fn insert_user(&self, user: &User) -> Result<bool>;

    fn user_by_id(&self, id: Uuid) -> Result<Option<User>>;

    fn user_by_username(&self, username: &str) -> Result<Option<User>>;

    /// Case-insensitive substring match on username, excluding `exclude`.
    fn search_users(&self, keyword: &str, exclude: Uuid, limit: u32) -> Result<Vec<User>>;

    /// Returns `false` if no such user exists.
    fn update_avatar(&self, id: Uuid, avatar: &str) -> Result<bool>;

    // -- Messages --

    /// Persists a message and assigns it the next id. Ids are strictly
    /// increasing in insertion order.
    fn insert_message(&self, message: NewMessage) -> Result<Message>;

    /// Group messages, newest first.
    fn group_messages(&self, offset: u64, limit: u32) -> Result<Vec<Message>>;

    /// Private messages exchanged between `a` and `b` in either direction,
    /// newest first.
    fn private_messages(&self, a: Uuid, b: Uuid, offset: u64, limit: u32) -> Result<Vec<Message>>;

    /// Flips `is_read` on those of `ids` addressed to `receiver` that are
    /// still unread. Returns how many changed.
    fn mark_read(&self, ids: &[i64], receiver: Uuid) -> Result<usize>;

    /// Unread private messages addressed to `receiver`, grouped by sender.
    fn unread_counts(&self, receiver: Uuid) -> Result<Vec<(Uuid, u64)>>;

    // -- Friend requests --

    /// Creates a pending request. Returns `None` if a pending request from
    /// `from` to `to` already exists.
    fn insert_friend_request(
        &self,
        from: Uuid,
        to: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<Option<FriendRequest>>;

    fn friend_request(&self, id: i64) -> Result<Option<FriendRequest>>;

    fn pending_request_between(&self, from: Uuid, to: Uuid) -> Result<Option<FriendRequest>>;

    /// Pending requests addressed to `to`, oldest first.
    fn pending_requests_for(&self, to: Uuid) -> Result<Vec<FriendRequest>>;

    /// Moves a pending request to `status`. Returns `false` if the request
    /// was not pending any more.
    fn resolve_friend_request(&self, id: i64, status: FriendRequestStatus) -> Result<bool>;

    /// Accepted requests whose friendship was never written.
    fn dangling_acceptances(&self) -> Result<Vec<FriendRequest>>;

    // -- Friendships --

    /// Returns `false` if the pair are already friends.
    fn insert_friendship(&self, friendship: &Friendship) -> Result<bool>;

    fn friendship_exists(&self, a: Uuid, b: Uuid) -> Result<bool>;

    /// Friendships involving `user`, oldest first.
    fn friendships_of(&self, user: Uuid) -> Result<Vec<Friendship>>;
}
