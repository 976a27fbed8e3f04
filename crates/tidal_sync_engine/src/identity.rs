//! Identity of the signed-in user.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The user whose credentials the watch stream carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    uid: Option<String>,
}

impl User {
    /// Creates an authenticated user.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    /// The unauthenticated user.
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    /// Returns the user id, if authenticated.
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// Returns true if the user is authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => f.write_str(uid),
            None => f.write_str("<anonymous>"),
        }
    }
}

/// Callback invoked with the current user.
pub type UserListener = Box<dyn Fn(User) + Send + Sync>;

/// Source of user identity.
///
/// The first call of the listener delivers the initial user; later calls
/// report changes.
pub trait IdentityProvider: Send + Sync {
    /// Registers the listener, replacing any previous one.
    fn set_change_listener(&self, listener: UserListener);
}

/// An identity provider whose user is set by hand.
///
/// If a user is already known when the listener is registered, it is
/// delivered immediately.
#[derive(Default)]
pub struct StaticIdentity {
    state: Mutex<StaticIdentityState>,
}

#[derive(Default)]
struct StaticIdentityState {
    user: Option<User>,
    listener: Option<std::sync::Arc<dyn Fn(User) + Send + Sync>>,
}

impl StaticIdentity {
    /// Creates a provider with a known user.
    pub fn new(user: User) -> Self {
        Self {
            state: Mutex::new(StaticIdentityState {
                user: Some(user),
                listener: None,
            }),
        }
    }

    /// Creates a provider that has not resolved a user yet.
    pub fn pending() -> Self {
        Self::default()
    }

    /// Returns the current user, if resolved.
    pub fn user(&self) -> Option<User> {
        self.state.lock().user.clone()
    }

    /// Sets the user and notifies the listener.
    pub fn set_user(&self, user: User) {
        let listener = {
            let mut state = self.state.lock();
            state.user = Some(user.clone());
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener(user);
        }
    }
}

impl fmt::Debug for StaticIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticIdentity")
            .field("user", &self.user())
            .finish_non_exhaustive()
    }
}

impl IdentityProvider for StaticIdentity {
    fn set_change_listener(&self, listener: UserListener) {
        let listener: std::sync::Arc<dyn Fn(User) + Send + Sync> = listener.into();
        let user = {
            let mut state = self.state.lock();
            state.listener = Some(std::sync::Arc::clone(&listener));
            state.user.clone()
        };
        if let Some(user) = user {
            listener(user);
        }
    }
}
