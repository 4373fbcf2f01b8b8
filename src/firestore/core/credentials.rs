use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;

/// Identity whose pending writes and overlays live in their own namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Storage namespace for this user. Unauthenticated users share the empty key.
    pub fn storage_key(&self) -> &str {
        self.uid.as_deref().unwrap_or("")
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "User({uid})"),
            None => write!(f, "User(anonymous)"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub user: User,
}

pub type UserChangeListener = Arc<dyn Fn(User) + Send + Sync>;

#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// Returns the current token, or `None` when no credentials are available.
    async fn get_token(&self, force_refresh: bool) -> FirestoreResult<Option<Token>>;

    fn invalidate_token(&self);

    /// Registers the change listener. Providers call it once with the
    /// current user and again on every change.
    fn set_change_listener(&self, listener: UserChangeListener);

    fn remove_change_listener(&self);
}

pub type CredentialsProviderArc = Arc<dyn CredentialsProvider>;

/// Provider for clients without authentication.
#[derive(Default, Clone)]
pub struct EmptyCredentialsProvider;

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self, _force_refresh: bool) -> FirestoreResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, listener: UserChangeListener) {
        listener(User::unauthenticated());
    }

    fn remove_change_listener(&self) {}
}

/// Provider whose user can be switched at runtime. Used by embedders that
/// manage sign-in themselves and by tests.
#[derive(Default)]
pub struct StaticCredentialsProvider {
    state: StdMutex<StaticCredentialsState>,
}

#[derive(Default)]
struct StaticCredentialsState {
    user: User,
    token: Option<String>,
    listener: Option<UserChangeListener>,
}

impl StaticCredentialsProvider {
    pub fn new(user: User, token: Option<String>) -> Self {
        Self {
            state: StdMutex::new(StaticCredentialsState {
                user,
                token,
                listener: None,
            }),
        }
    }

    pub fn set_user(&self, user: User, token: Option<String>) {
        let listener = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.user == user && state.token == token {
                return;
            }
            state.user = user.clone();
            state.token = token;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener(user);
        }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self, _force_refresh: bool) -> FirestoreResult<Option<Token>> {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(state.token.clone().map(|value| Token {
            value,
            user: state.user.clone(),
        }))
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, listener: UserChangeListener) {
        let user = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.listener = Some(listener.clone());
            state.user.clone()
        };
        listener(user);
    }

    fn remove_change_listener(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.listener = None;
    }
}
