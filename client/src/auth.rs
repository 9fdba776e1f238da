//! Authentication state consumed by the sync layer.
//!
//! The sync layer only needs to know *who* is signed in and when that changes.
//! Credentials and sign-in flows live elsewhere.

use codex_sync_engine::UserId;
use tokio::sync::watch;

/// Source of the current authenticated user.
pub trait AuthState: Send + Sync {
    fn current_user_id(&self) -> Option<UserId>;

    /// A feed that changes whenever the user signs in or out.
    fn changes(&self) -> watch::Receiver<Option<UserId>>;
}

/// In-process session holder.
#[derive(Debug)]
pub struct SessionAuth {
    user: watch::Sender<Option<UserId>>,
}

impl SessionAuth {
    /// A signed-out session.
    pub fn new() -> Self {
        let (user, _) = watch::channel(None);
        Self { user }
    }

    /// A session already signed in as `user_id`.
    pub fn signed_in(user_id: impl Into<UserId>) -> Self {
        let session = Self::new();
        session.sign_in(user_id);
        session
    }

    pub fn sign_in(&self, user_id: impl Into<UserId>) {
        let user_id = user_id.into();
        tracing::info!(user_id = %user_id, "Signed in");
        self.user.send_replace(Some(user_id));
    }

    pub fn sign_out(&self) {
        if self.user.send_replace(None).is_some() {
            tracing::info!("Signed out");
        }
    }
}

impl Default for SessionAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthState for SessionAuth {
    fn current_user_id(&self) -> Option<UserId> {
        self.user.borrow().clone()
    }

    fn changes(&self) -> watch::Receiver<Option<UserId>> {
        self.user.subscribe()
    }
}
