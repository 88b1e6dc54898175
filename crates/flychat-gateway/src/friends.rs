//! Friend request state machine.
//!
//! Per ordered pair a request goes `pending -> accepted | rejected` exactly
//! once. Accepting is a two-step saga: the status update and the friendship
//! insert are separate store writes. A crash in between leaves an accepted
//! request without a friendship; [`FriendRequestCoordinator::dangling_acceptances`]
//! reports those, nothing repairs them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use flychat_db::Store;
use flychat_types::api::FriendInfo;
use flychat_types::events::{FriendSummary, PendingRequest, ServerEvent};
use flychat_types::models::{FriendRequest, FriendRequestStatus, Friendship};

use crate::auth::Identity;
use crate::error::{ChatError, ChatResult, Conflict, blocking};
use crate::presence::PresenceRegistry;

pub struct FriendRequestCoordinator {
    store: Arc<dyn Store>,
    registry: Arc<PresenceRegistry>,
}

impl FriendRequestCoordinator {
    pub fn new(store: Arc<dyn Store>, registry: Arc<PresenceRegistry>) -> Self {
        Self { store, registry }
    }

    pub async fn send_request(&self, from: &Identity, to: Uuid) -> ChatResult<FriendRequest> {
        if from.user_id == to {
            return Err(Conflict::SelfRequest.into());
        }

        let from_id = from.user_id;
        let request = blocking(&self.store, move |s| {
            if s.user_by_id(to)?.is_none() {
                return Ok(Err(ChatError::NotFound("user")));
            }
            if s.friendship_exists(from_id, to)? {
                return Ok(Err(Conflict::AlreadyFriends.into()));
            }
            // Conditional insert: a concurrent duplicate loses here, not above
            let Some(request) = s.insert_friend_request(from_id, to, Utc::now().trunc_subsecs(6))? else {
                return Ok(Err(Conflict::DuplicatePending.into()));
            };
            // An acceptance may have written the friendship since the check
            if s.friendship_exists(from_id, to)? {
                s.resolve_friend_request(request.id, FriendRequestStatus::Accepted)?;
                return Ok(Err(Conflict::AlreadyFriends.into()));
            }
            Ok(Ok(request))
        })
        .await??;

        info!("{} sent friend request {} to {}", from.username, request.id, to);

        self.registry
            .notify(
                to,
                ServerEvent::FriendRequest(PendingRequest {
                    id: request.id,
                    from: from.user_id,
                    from_username: from.username.clone(),
                    created_at: request.created_at,
                }),
            )
            .await;

        Ok(request)
    }

    /// Accepts or rejects a pending request addressed to `responder`.
    /// Returns the request in its new terminal state.
    pub async fn respond(
        &self,
        request_id: i64,
        responder: &Identity,
        accept: bool,
    ) -> ChatResult<FriendRequest> {
        let request = blocking(&self.store, move |s| s.friend_request(request_id))
            .await?
            .ok_or(ChatError::NotFound("friend request"))?;

        if request.to_id != responder.user_id {
            return Err(ChatError::Forbidden("you cannot respond to this friend request"));
        }
        if request.status.is_terminal() {
            return Err(Conflict::AlreadyResolved.into());
        }

        let status = if accept {
            FriendRequestStatus::Accepted
        } else {
            FriendRequestStatus::Rejected
        };

        // Only one responder can win the pending -> terminal transition
        let won = blocking(&self.store, move |s| s.resolve_friend_request(request_id, status)).await?;
        if !won {
            return Err(Conflict::AlreadyResolved.into());
        }

        let resolved = FriendRequest { status, ..request };
        info!(
            "{} {} friend request {} from {}",
            responder.username,
            status.as_str(),
            resolved.id,
            resolved.from_id
        );

        if accept {
            self.complete_acceptance(&resolved, responder).await?;
        }

        Ok(resolved)
    }

    /// Second half of the accept saga.
    async fn complete_acceptance(&self, request: &FriendRequest, responder: &Identity) -> ChatResult<()> {
        let friendship = Friendship::new(request.from_id, request.to_id, Utc::now().trunc_subsecs(6));
        let (requester, accepter) = (request.from_id, request.to_id);
        let request_id = request.id;

        blocking(&self.store, move |s| {
            if !s.insert_friendship(&friendship)? {
                warn!("Friendship {} <-> {} already existed", requester, accepter);
            }
            // No pending request may outlive the friendship, in either
            // direction. A fresh requester -> accepter one can appear while
            // this acceptance is in flight.
            for (from, to) in [(accepter, requester), (requester, accepter)] {
                if let Some(pending) = s.pending_request_between(from, to)? {
                    s.resolve_friend_request(pending.id, FriendRequestStatus::Accepted)?;
                }
            }
            Ok(())
        })
        .await
        .inspect_err(|e| {
            error!(
                "Friend request {} accepted but friendship was not recorded: {}",
                request_id, e
            )
        })?;

        self.registry
            .notify(
                requester,
                ServerEvent::FriendRequestAccepted {
                    friend: FriendSummary {
                        id: responder.user_id,
                        username: responder.username.clone(),
                    },
                },
            )
            .await;

        Ok(())
    }

    /// Pending requests addressed to `user_id`, with sender usernames.
    pub async fn pending_requests_for(&self, user_id: Uuid) -> ChatResult<Vec<PendingRequest>> {
        blocking(&self.store, move |s| {
            let requests = s.pending_requests_for(user_id)?;
            let mut names: HashMap<Uuid, String> = HashMap::new();
            let mut pending = Vec::with_capacity(requests.len());
            for request in requests {
                let from_username = match names.get(&request.from_id) {
                    Some(name) => name.clone(),
                    None => {
                        let name = s
                            .user_by_id(request.from_id)?
                            .map(|u| u.username)
                            .unwrap_or_else(|| "unknown".to_string());
                        names.insert(request.from_id, name.clone());
                        name
                    }
                };
                pending.push(PendingRequest {
                    id: request.id,
                    from: request.from_id,
                    from_username,
                    created_at: request.created_at,
                });
            }
            Ok(pending)
        })
        .await
    }

    /// Friends of `user_id` with profile data and live presence.
    pub async fn friends_of(&self, user_id: Uuid) -> ChatResult<Vec<FriendInfo>> {
        let partners = blocking(&self.store, move |s| {
            let mut partners = Vec::new();
            for friendship in s.friendships_of(user_id)? {
                let partner = friendship.partner_of(user_id);
                match s.user_by_id(partner)? {
                    Some(user) => partners.push((user, friendship.created_at)),
                    None => warn!("Friendship of {} points at missing user {}", user_id, partner),
                }
            }
            Ok(partners)
        })
        .await?;

        let mut friends = Vec::with_capacity(partners.len());
        for (user, since) in partners {
            friends.push(FriendInfo {
                online: self.registry.is_online(user.id).await,
                id: user.id,
                username: user.username,
                avatar: user.avatar,
                since,
            });
        }
        Ok(friends)
    }

    /// Accepted requests that never got their friendship written.
    pub async fn dangling_acceptances(&self) -> ChatResult<Vec<FriendRequest>> {
        blocking(&self.store, |s| s.dangling_acceptances()).await
    }
}
