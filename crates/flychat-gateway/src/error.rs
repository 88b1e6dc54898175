use std::sync::Arc;

use thiserror::Error;

use flychat_db::Store;

/// State-machine and uniqueness violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Conflict {
    #[error("you are already friends with this user")]
    AlreadyFriends,
    #[error("a friend request to this user is already pending")]
    DuplicatePending,
    #[error("this friend request has already been handled")]
    AlreadyResolved,
    #[error("you cannot send a friend request to yourself")]
    SelfRequest,
    #[error("username is already taken")]
    UsernameTaken,
}

/// Every way a chat operation can fail. The display text is what the user
/// sees, except for persistence failures (see [`ChatError::user_message`]).
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Conflict(#[from] Conflict),

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("storage failure: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    /// Single human-readable line for the client. Storage details stay in
    /// the server log.
    pub fn user_message(&self) -> String {
        match self {
            Self::Persistence(_) => "internal server error, please try again".to_string(),
            other => other.to_string(),
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Runs a store call on the blocking pool. rusqlite is synchronous, so store
/// work never runs on a runtime worker thread.
pub async fn blocking<T, F>(store: &Arc<dyn Store>, f: F) -> ChatResult<T>
where
    F: FnOnce(&dyn Store) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| ChatError::Persistence(anyhow::anyhow!("store task failed: {}", e)))?
        .map_err(ChatError::Persistence)
}
