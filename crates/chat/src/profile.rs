//! Seams to the identity and profile services that live outside this crate.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use duet_storage::UserId;

use crate::error::ChatResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: UserId,
    pub username: String,
}

/// Reports who is signed in. `None` means unauthenticated.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn current_user(&self) -> Option<UserId>;
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    /// Name shown next to messages. `Ok(None)` when the user has no profile.
    async fn display_name(&self, user_id: &UserId) -> ChatResult<Option<String>>;
    async fn list_users(&self) -> ChatResult<Vec<UserProfile>>;
}

/// Authenticator with a settable signed-in user.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    current: RwLock<Option<UserId>>,
}

impl StaticAuthenticator {
    pub fn signed_in(user_id: UserId) -> Self {
        Self {
            current: RwLock::new(Some(user_id)),
        }
    }

    pub fn sign_out(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn sign_in(&self, user_id: UserId) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(user_id);
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn current_user(&self) -> Option<UserId> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// In-memory profile table.
#[derive(Debug, Default)]
pub struct StaticProfiles {
    profiles: RwLock<BTreeMap<UserId, UserProfile>>,
}

impl StaticProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, user_id: UserId, username: impl Into<String>) -> Self {
        self.upsert(user_id, username);
        self
    }

    pub fn upsert(&self, user_id: UserId, username: impl Into<String>) {
        let profile = UserProfile {
            user_id: user_id.clone(),
            username: username.into(),
        };
        self.profiles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id, profile);
    }
}

#[async_trait]
impl ProfileDirectory for StaticProfiles {
    async fn display_name(&self, user_id: &UserId) -> ChatResult<Option<String>> {
        Ok(self
            .profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .map(|profile| profile.username.clone()))
    }

    async fn list_users(&self) -> ChatResult<Vec<UserProfile>> {
        Ok(self
            .profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }
}
