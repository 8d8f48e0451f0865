//! Authentication hook.
//!
//! relaymq doesn't store credentials. Instead it calls an
//! [`Authenticator`] once per CONNECT with whatever username and password
//! the client sent, and accepts or rejects the connection on the answer.
//! A rejected client gets CONNACK "bad user name or password" and never
//! touches session state.

use std::future::Future;

/// Decides whether a CONNECT may proceed.
///
/// `Send + Sync + 'static` because one authenticator is shared by every
/// connection task for the lifetime of the broker.
///
/// # Example
///
/// ```rust
/// use relaymq_session::Authenticator;
///
/// /// Accepts a single hard-coded account.
/// struct SingleUser;
///
/// impl Authenticator for SingleUser {
///     async fn authenticate(&self, username: Option<&str>, password: Option<&[u8]>) -> bool {
///         username == Some("admin") && password == Some(b"hunter2".as_slice())
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Returns `true` to accept the connection.
    fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> impl Future<Output = bool> + Send;
}

/// Accepts every client. The default when no authenticator is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    async fn authenticate(&self, _username: Option<&str>, _password: Option<&[u8]>) -> bool {
        true
    }
}
