//! End-to-end flows through the gateway with an in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use flychat_db::{MemoryStore, Store};
use flychat_gateway::{ChatError, Conflict, GatewaySettings, Identity, JwtAuthService, SessionGateway};
use flychat_types::events::{ClientEvent, ServerEvent};
use flychat_types::models::{
    ChatTarget, FriendRequest, FriendRequestStatus, Friendship, Message, NewMessage, User,
};

fn gateway_over(store: Arc<dyn Store>) -> SessionGateway {
    let auth = Arc::new(JwtAuthService::new("scenario-secret", chrono::Duration::hours(1)));
    SessionGateway::new(store, auth, GatewaySettings::default())
}

fn add_user(store: &dyn Store, name: &str) -> Identity {
    let user = User {
        id: Uuid::new_v4(),
        username: name.into(),
        password_hash: String::new(),
        avatar: String::new(),
        created_at: Utc::now(),
    };
    assert!(store.insert_user(&user).unwrap());
    Identity {
        user_id: user.id,
        username: user.username,
    }
}

fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if !matches!(event, ServerEvent::UpdateUserList(_) | ServerEvent::Ready { .. }) {
            events.push(event);
        }
    }
    events
}

#[tokio::test]
async fn group_hello_reaches_online_users_and_history() {
    let store = Arc::new(MemoryStore::new());
    let gateway = gateway_over(store.clone());
    let a = add_user(&*store, "alice");
    let b = add_user(&*store, "bob");
    let c = add_user(&*store, "carol");

    let (session_a, mut rx_a) = gateway.open(a.clone()).await;
    let (_session_b, mut rx_b) = gateway.open(b.clone()).await;

    let reply = gateway
        .dispatch(
            &session_a,
            ClientEvent::SendMessage {
                to: ChatTarget::Group,
                content: "hi".into(),
            },
        )
        .await;
    assert_eq!(reply, None);

    match drain(&mut rx_a).as_slice() {
        [ServerEvent::NewMessage(m)] => {
            assert!(m.is_self);
            assert_eq!(m.content, "hi");
        }
        other => panic!("sender saw {:?}", other),
    }
    match drain(&mut rx_b).as_slice() {
        [ServerEvent::NewMessage(m)] => {
            assert!(!m.is_self);
            assert_eq!(m.from, a.user_id);
            assert_eq!(m.from_username, "alice");
            assert_eq!(m.to, ChatTarget::Group);
        }
        other => panic!("peer saw {:?}", other),
    }

    // Carol was offline; she finds it in history
    let (session_c, _rx_c) = gateway.open(c).await;
    let reply = gateway
        .dispatch(
            &session_c,
            ClientEvent::LoadMessages {
                chat_id: ChatTarget::Group,
                page: 1,
                limit: 20,
            },
        )
        .await;
    let Some(ServerEvent::HistoryMessages(page)) = reply else {
        panic!("unexpected reply {:?}", reply);
    };
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].content, "hi");
    assert!(!page.has_more);
}

#[tokio::test]
async fn offline_friend_request_then_reject() {
    let store = Arc::new(MemoryStore::new());
    let gateway = gateway_over(store.clone());
    let a = add_user(&*store, "alice");
    let b = add_user(&*store, "bob");

    let (session_a, mut rx_a) = gateway.open(a.clone()).await;
    let reply = gateway
        .dispatch(&session_a, ClientEvent::SendFriendRequest { user_id: b.user_id })
        .await;
    let Some(ServerEvent::FriendRequestSent { id, to }) = reply else {
        panic!("unexpected reply {:?}", reply);
    };
    assert_eq!(to, b.user_id);

    // Bob comes online later and sees it as pending
    let (session_b, mut rx_b) = gateway.open(b.clone()).await;
    assert!(drain(&mut rx_b).is_empty());
    let pending = gateway.friends().pending_requests_for(b.user_id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].from_username, "alice");

    let reply = gateway
        .dispatch(
            &session_b,
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

    assert!(gateway.friends().friends_of(a.user_id).await.unwrap().is_empty());
    assert!(gateway.friends().pending_requests_for(b.user_id).await.unwrap().is_empty());
    assert!(drain(&mut rx_a).is_empty());
}

#[tokio::test]
async fn paging_reconstructs_a_private_conversation() {
    let store = Arc::new(MemoryStore::new());
    let gateway = gateway_over(store.clone());
    let a = add_user(&*store, "alice");
    let b = add_user(&*store, "bob");

    for i in 0..23 {
        let (from, to) = if i % 2 == 0 { (&a, &b) } else { (&b, &a) };
        gateway
            .router()
            .route(from, ChatTarget::User(to.user_id), &format!("#{}", i))
            .await
            .unwrap();
    }

    let mut ids = Vec::new();
    let mut page_number = 1;
    loop {
        let page = gateway
            .history()
            .page(ChatTarget::User(b.user_id), page_number, 5, a.user_id)
            .await
            .unwrap();
        let mut batch: Vec<i64> = page.messages.iter().map(|m| m.id).collect();
        batch.append(&mut ids);
        ids = batch;
        if !page.has_more {
            break;
        }
        page_number += 1;
    }

    assert_eq!(ids.len(), 23);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn reading_twice_marks_nothing_new() {
    let store = Arc::new(MemoryStore::new());
    let gateway = gateway_over(store.clone());
    let a = add_user(&*store, "alice");
    let b = add_user(&*store, "bob");
    gateway
        .router()
        .route(&a, ChatTarget::User(b.user_id), "ping")
        .await
        .unwrap();

    let history = gateway.history();
    let first = history.page(ChatTarget::User(a.user_id), 1, 20, b.user_id).await.unwrap();
    let second = history.page(ChatTarget::User(a.user_id), 1, 20, b.user_id).await.unwrap();
    assert_eq!(first.messages, second.messages);
    assert!(history.unread_counts(b.user_id).await.unwrap().is_empty());

    let stored = store.private_messages(a.user_id, b.user_id, 0, 10).unwrap();
    assert!(stored[0].is_read);
    assert_eq!(store.mark_read(&[stored[0].id], b.user_id).unwrap(), 0);
}

#[tokio::test]
async fn reconnect_replaces_the_session() {
    let store = Arc::new(MemoryStore::new());
    let gateway = gateway_over(store.clone());
    let a = add_user(&*store, "alice");

    let (mut old, _rx_old) = gateway.open(a.clone()).await;
    let (new, mut rx_new) = gateway.open(a.clone()).await;
    assert!(old.handle().is_closed());

    gateway.close(&mut old).await;
    assert!(gateway.registry().is_online(a.user_id).await);

    gateway
        .router()
        .route(&a, ChatTarget::Group, "still here")
        .await
        .unwrap();
    assert_eq!(drain(&mut rx_new).len(), 1);
    assert_eq!(gateway.registry().lookup(a.user_id).await.as_ref(), Some(new.handle()));
}

/// Holds one store call on the blocking pool until the test releases it.
struct Gate {
    armed: AtomicBool,
    entered: Notify,
    release: Mutex<Option<std_mpsc::Receiver<()>>>,
}

impl Gate {
    fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            release: Mutex::new(None),
        }
    }

    /// Arms the gate for the next call and returns its release switch.
    fn arm(&self) -> std_mpsc::Sender<()> {
        let (tx, rx) = std_mpsc::channel();
        *self.release.lock().unwrap() = Some(rx);
        self.armed.store(true, Ordering::SeqCst);
        tx
    }

    fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            if let Some(rx) = self.release.lock().unwrap().take() {
                let _ = rx.recv();
            }
        }
    }
}

/// Delegates to a [`MemoryStore`] but can be told to fail specific writes or
/// to hold them mid-flight.
struct FlakyStore {
    inner: MemoryStore,
    fail_friendships: AtomicBool,
    fail_messages: AtomicBool,
    /// Held before the friendship is written.
    hold_friendship: Gate,
    /// Held after a friend request is written.
    hold_request: Gate,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_friendships: AtomicBool::new(false),
            fail_messages: AtomicBool::new(false),
            hold_friendship: Gate::new(),
            hold_request: Gate::new(),
        }
    }
}

impl Store for FlakyStore {
    fn insert_user(&self, user: &User) -> Result<bool> {
        self.inner.insert_user(user)
    }
    fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        self.inner.user_by_id(id)
    }
    fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.inner.user_by_username(username)
    }
    fn search_users(&self, keyword: &str, exclude: Uuid, limit: u32) -> Result<Vec<User>> {
        self.inner.search_users(keyword, exclude, limit)
    }
    fn update_avatar(&self, id: Uuid, avatar: &str) -> Result<bool> {
        self.inner.update_avatar(id, avatar)
    }
    fn insert_message(&self, message: NewMessage) -> Result<Message> {
        if self.fail_messages.load(Ordering::SeqCst) {
            bail!("disk I/O error");
        }
        self.inner.insert_message(message)
    }
    fn group_messages(&self, offset: u64, limit: u32) -> Result<Vec<Message>> {
        self.inner.group_messages(offset, limit)
    }
    fn private_messages(&self, a: Uuid, b: Uuid, offset: u64, limit: u32) -> Result<Vec<Message>> {
        self.inner.private_messages(a, b, offset, limit)
    }
    fn mark_read(&self, ids: &[i64], receiver: Uuid) -> Result<usize> {
        self.inner.mark_read(ids, receiver)
    }
    fn unread_counts(&self, receiver: Uuid) -> Result<Vec<(Uuid, u64)>> {
        self.inner.unread_counts(receiver)
    }
    fn insert_friend_request(
        &self,
        from: Uuid,
        to: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<Option<FriendRequest>> {
        let inserted = self.inner.insert_friend_request(from, to, created_at)?;
        self.hold_request.pass();
        Ok(inserted)
    }
    fn friend_request(&self, id: i64) -> Result<Option<FriendRequest>> {
        self.inner.friend_request(id)
    }
    fn pending_request_between(&self, from: Uuid, to: Uuid) -> Result<Option<FriendRequest>> {
        self.inner.pending_request_between(from, to)
    }
    fn pending_requests_for(&self, to: Uuid) -> Result<Vec<FriendRequest>> {
        self.inner.pending_requests_for(to)
    }
    fn resolve_friend_request(&self, id: i64, status: FriendRequestStatus) -> Result<bool> {
        self.inner.resolve_friend_request(id, status)
    }
    fn dangling_acceptances(&self) -> Result<Vec<FriendRequest>> {
        self.inner.dangling_acceptances()
    }
    fn insert_friendship(&self, friendship: &Friendship) -> Result<bool> {
        if self.fail_friendships.load(Ordering::SeqCst) {
            bail!("disk I/O error");
        }
        self.hold_friendship.pass();
        self.inner.insert_friendship(friendship)
    }
    fn friendship_exists(&self, a: Uuid, b: Uuid) -> Result<bool> {
        self.inner.friendship_exists(a, b)
    }
    fn friendships_of(&self, user: Uuid) -> Result<Vec<Friendship>> {
        self.inner.friendships_of(user)
    }
}

#[tokio::test]
async fn failed_friendship_write_is_detectable() {
    let store = Arc::new(FlakyStore::new());
    let gateway = gateway_over(store.clone());
    let a = add_user(&*store, "alice");
    let b = add_user(&*store, "bob");

    let request = gateway.friends().send_request(&a, b.user_id).await.unwrap();
    store.fail_friendships.store(true, Ordering::SeqCst);

    let err = gateway.friends().respond(request.id, &b, true).await.unwrap_err();
    assert!(matches!(err, ChatError::Persistence(_)));

    // The status flip landed, the friendship did not
    assert_eq!(
        store.friend_request(request.id).unwrap().unwrap().status,
        FriendRequestStatus::Accepted
    );
    let dangling = gateway.friends().dangling_acceptances().await.unwrap();
    assert_eq!(dangling.len(), 1);
    assert_eq!(dangling[0].id, request.id);
}

#[tokio::test]
async fn failed_message_write_delivers_nothing() {
    let store = Arc::new(FlakyStore::new());
    let gateway = gateway_over(store.clone());
    let a = add_user(&*store, "alice");
    let b = add_user(&*store, "bob");
    let (session_a, mut rx_a) = gateway.open(a).await;
    let (_session_b, mut rx_b) = gateway.open(b).await;

    store.fail_messages.store(true, Ordering::SeqCst);
    let reply = gateway
        .dispatch(
            &session_a,
            ClientEvent::SendMessage {
                to: ChatTarget::Group,
                content: "lost".into(),
            },
        )
        .await;

    match reply {
        Some(ServerEvent::Error { message }) => assert!(!message.contains("disk")),
        other => panic!("unexpected reply {:?}", other),
    }
    assert!(drain(&mut rx_a).is_empty());
    assert!(drain(&mut rx_b).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_sent_during_acceptance_is_settled_with_it() {
    let store = Arc::new(FlakyStore::new());
    let gateway = gateway_over(store.clone());
    let a = add_user(&*store, "alice");
    let b = add_user(&*store, "bob");

    let first = gateway.friends().send_request(&a, b.user_id).await.unwrap();

    // Bob's acceptance stops between the status flip and the friendship write
    let release = store.hold_friendship.arm();
    let accept = tokio::spawn({
        let gateway = gateway.clone();
        let b = b.clone();
        async move { gateway.friends().respond(first.id, &b, true).await }
    });
    store.hold_friendship.entered.notified().await;

    // The first request is no longer pending, so alice may ask again
    let resent = gateway.friends().send_request(&a, b.user_id).await.unwrap();
    assert_eq!(resent.status, FriendRequestStatus::Pending);

    release.send(()).unwrap();
    accept.await.unwrap().unwrap();

    assert!(store.friendship_exists(a.user_id, b.user_id).unwrap());
    assert_eq!(store.pending_request_between(a.user_id, b.user_id).unwrap(), None);
    assert_eq!(store.pending_request_between(b.user_id, a.user_id).unwrap(), None);
    assert_eq!(
        store.friend_request(resent.id).unwrap().unwrap().status,
        FriendRequestStatus::Accepted
    );
    assert!(gateway.friends().pending_requests_for(b.user_id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_that_loses_to_a_friendship_is_withdrawn() {
    let store = Arc::new(FlakyStore::new());
    let gateway = gateway_over(store.clone());
    let a = add_user(&*store, "alice");
    let b = add_user(&*store, "bob");

    let first = gateway.friends().send_request(&b, a.user_id).await.unwrap();

    // Alice's request is written but not yet checked against friendships
    let release = store.hold_request.arm();
    let send = tokio::spawn({
        let gateway = gateway.clone();
        let a = a.clone();
        let to = b.user_id;
        async move { gateway.friends().send_request(&a, to).await }
    });
    store.hold_request.entered.notified().await;

    // Bob's crossing request is accepted and the friendship lands first
    gateway.friends().respond(first.id, &a, true).await.unwrap();
    assert!(store.friendship_exists(a.user_id, b.user_id).unwrap());

    release.send(()).unwrap();
    let err = send.await.unwrap().unwrap_err();
    assert!(matches!(err, ChatError::Conflict(Conflict::AlreadyFriends)));
    assert_eq!(store.pending_request_between(a.user_id, b.user_id).unwrap(), None);
}
