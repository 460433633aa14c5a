use arc_swap::ArcSwap;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::watch;
use tracing::debug;

use crate::Result;

/// Authenticated principal whose mutation queue is active.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: Some(uid.into()) }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Storage prefix of the user's mutation queue.
    pub(crate) fn key(&self) -> String {
        self.uid.clone().unwrap_or_default()
    }
}

/// Bearer credential attached to outbound requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub user: User,
}

impl Token {
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

/// Source of credentials for the watch, write and unary calls.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// Current credential, or `None` when requests go out unauthenticated.
    async fn get_token(
        &self,
        force_refresh: bool,
    ) -> Result<Option<Token>>;

    /// Drops any cached credential; the next `get_token` fetches a new one.
    fn invalidate_token(&self);

    /// User changes. The receiver starts at the current user.
    fn subscribe(&self) -> watch::Receiver<User>;
}

/// Provider for clients that never authenticate.
pub struct EmptyCredentialsProvider {
    user_tx: watch::Sender<User>,
}

impl EmptyCredentialsProvider {
    pub fn new() -> Self {
        let (user_tx, _) = watch::channel(User::unauthenticated());
        Self { user_tx }
    }
}

impl Default for EmptyCredentialsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(
        &self,
        _force_refresh: bool,
    ) -> Result<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn subscribe(&self) -> watch::Receiver<User> {
        self.user_tx.subscribe()
    }
}

/// Provider holding a fixed token that the embedder swaps on sign-in.
pub struct StaticCredentialsProvider {
    token: ArcSwap<Option<Token>>,
    user_tx: watch::Sender<User>,
}

impl StaticCredentialsProvider {
    pub fn new(
        user: User,
        token: impl Into<String>,
    ) -> Self {
        let (user_tx, _) = watch::channel(user.clone());
        Self {
            token: ArcSwap::from_pointee(Some(Token {
                value: token.into(),
                user,
            })),
            user_tx,
        }
    }

    /// Switches to `user`. Subscribers are notified only when the user
    /// actually changes.
    pub fn set_user(
        &self,
        user: User,
        token: impl Into<String>,
    ) {
        self.token.store(std::sync::Arc::new(Some(Token {
            value: token.into(),
            user: user.clone(),
        })));
        self.user_tx.send_if_modified(|current| {
            if *current == user {
                return false;
            }
            debug!("[Credentials] user changed to {:?}", user.uid());
            *current = user;
            true
        });
    }

    pub fn sign_out(&self) {
        self.token.store(std::sync::Arc::new(None));
        self.user_tx.send_if_modified(|current| {
            if !current.is_authenticated() {
                return false;
            }
            *current = User::unauthenticated();
            true
        });
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(
        &self,
        _force_refresh: bool,
    ) -> Result<Option<Token>> {
        Ok(self.token.load_full().as_ref().clone())
    }

    fn invalidate_token(&self) {
        debug!("[Credentials] token invalidated");
    }

    fn subscribe(&self) -> watch::Receiver<User> {
        self.user_tx.subscribe()
    }
}
