//! Chat sessions.
//!
//! A [`ChatSession`] is the server-side representative of one connected
//! user. It walks `Connecting → Joining → Active → Leaving → Closed`:
//! [`ChatSession::start`] runs the join protocol, [`ChatSession::run`] pumps
//! the peer's messages into the channel and then always runs the leave
//! protocol, whatever ended the receive loop.

use parley_protocol::{codec, unix_timestamp, username_taken_notice, Envelope, RETRY_NOTICE};
use parley_transport::{PeerSink, PeerStream, SharedSink, TransportError};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::keys::{validate_channel_name, validate_user_name};
use crate::registry::PeerKey;
use crate::relay::{Relay, UsernamePolicy};
use crate::store::PresenceStore;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport handle only, no protocol state yet.
    Connecting,
    /// Join protocol completed, receive loop not yet running.
    Joining,
    /// Receive loop running.
    Active,
    /// Leave protocol in progress.
    Leaving,
    /// Terminal.
    Closed,
}

/// Why a session's receive loop ended.
#[derive(Debug)]
pub enum SessionExit {
    /// The peer closed the connection in an orderly way.
    Closed,
    /// The transport failed.
    Failed(TransportError),
}

/// One connected user in one channel.
pub struct ChatSession {
    relay: Arc<Relay>,
    user: String,
    channel: String,
    peer: SharedSink,
    key: Option<PeerKey>,
    state: SessionState,
}

impl ChatSession {
    /// Create a session for a freshly accepted connection.
    #[must_use]
    pub fn new(
        relay: Arc<Relay>,
        user: impl Into<String>,
        channel: impl Into<String>,
        peer: SharedSink,
    ) -> Self {
        Self {
            relay,
            user: user.into(),
            channel: channel.into(),
            peer,
            key: None,
            state: SessionState::Connecting,
        }
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get the username.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Get the channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Get the registry key, once joined.
    #[must_use]
    pub fn key(&self) -> Option<&PeerKey> {
        self.key.as_ref()
    }

    /// Run the join protocol.
    ///
    /// On success the connection is registered, the peer has been welcomed
    /// and the channel has been told about the new member. On failure the
    /// session is `Closed` and its connection has been closed.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is invalid, the relay is shutting down,
    /// the presence store fails, or the username is taken under
    /// [`UsernamePolicy::Reject`].
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Connecting {
            return Err(SessionError::InvalidState(self.state));
        }

        if let Err(reason) = validate_user_name(&self.user).and(validate_channel_name(&self.channel)) {
            warn!(user = %self.user, channel = %self.channel, reason, "Rejected session");
            self.reject(reason).await;
            return Err(SessionError::InvalidName(reason));
        }

        if self.relay.is_shutting_down() {
            self.reject(RETRY_NOTICE).await;
            return Err(SessionError::ShuttingDown);
        }

        let store = Arc::clone(self.relay.store());

        match store.channel_exists(&self.channel).await {
            Ok(true) => debug!(channel = %self.channel, "Channel exists"),
            Ok(false) => {
                if let Err(e) = store.create_channel(&self.channel).await {
                    error!(channel = %self.channel, error = %e, "Failed to create channel");
                    self.abort().await;
                    return Err(e.into());
                }
                info!(channel = %self.channel, "Created channel");
            }
            Err(e) => {
                error!(channel = %self.channel, error = %e, "Unable to determine whether channel exists");
                self.abort().await;
                return Err(e.into());
            }
        }

        if let Err(e) = self.relay.ensure_subscriber(&self.channel).await {
            if self.relay.is_shutting_down() {
                self.reject(RETRY_NOTICE).await;
                return Err(SessionError::ShuttingDown);
            }
            error!(channel = %self.channel, error = %e, "Failed to subscribe to channel");
            self.abort().await;
            return Err(e.into());
        }

        let taken = match store.user_exists(&self.user).await {
            Ok(taken) => taken,
            Err(e) => {
                error!(user = %self.user, error = %e, "Unable to determine whether user exists");
                self.reject(RETRY_NOTICE).await;
                return Err(e.into());
            }
        };

        if taken {
            match self.relay.config().username_policy {
                UsernamePolicy::Allow => {
                    debug!(user = %self.user, "Username already active, admitting another connection");
                }
                UsernamePolicy::Reject => {
                    info!(user = %self.user, "Username already taken");
                    self.reject(&username_taken_notice(&self.user)).await;
                    return Err(SessionError::UsernameTaken(self.user.clone()));
                }
            }
        } else if let Err(e) = store.create_user(&self.user).await {
            error!(user = %self.user, error = %e, "Failed to add user to active chat users");
            self.reject(RETRY_NOTICE).await;
            return Err(e.into());
        }

        let key = PeerKey::new(&self.channel, &self.user);
        self.relay.sessions().register(key.clone(), Arc::clone(&self.peer));

        // Shutdown may have drained the registry while we were joining.
        if self.relay.is_shutting_down() {
            self.relay.sessions().deregister(&key);
            if let Err(e) = store.remove_user(&self.user).await {
                debug!(user = %self.user, error = %e, "Failed to remove user");
            }
            self.reject(RETRY_NOTICE).await;
            return Err(SessionError::ShuttingDown);
        }
        self.key = Some(key);

        match store.user_in_channel(&self.channel, &self.user).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = store.join_channel(&self.channel, &self.user).await {
                    warn!(user = %self.user, channel = %self.channel, error = %e, "Failed to join channel");
                }
            }
            Err(e) => {
                warn!(user = %self.user, channel = %self.channel, error = %e, "Unable to determine channel membership");
            }
        }

        self.notify(&Envelope::welcome(&self.channel, &self.user)).await;
        self.relay
            .publish(&Envelope::joined(&self.channel, &self.user))
            .await;

        self.state = SessionState::Joining;
        Ok(())
    }

    /// Pump the peer's messages into the channel until the connection ends,
    /// then run the leave protocol.
    ///
    /// Each inbound payload is republished as a `text` envelope authored by
    /// this user. The leave protocol runs on every exit path.
    pub async fn run<S: PeerStream>(mut self, mut stream: S) -> SessionExit {
        if self.state != SessionState::Joining {
            warn!(user = %self.user, state = ?self.state, "Session not joined, not running");
            return SessionExit::Closed;
        }

        self.state = SessionState::Active;
        info!(user = %self.user, channel = %self.channel, "User joined");

        let exit = loop {
            match stream.recv().await {
                Ok(Some(payload)) => self.forward(&payload).await,
                Ok(None) => {
                    info!(user = %self.user, "Connection closed by user");
                    break SessionExit::Closed;
                }
                Err(e) => {
                    warn!(user = %self.user, error = %e, "Connection failed");
                    break SessionExit::Failed(e);
                }
            }
        };

        self.disconnect().await;
        exit
    }

    /// Run the leave protocol.
    ///
    /// Removes the user from the active-users set, announces the departure,
    /// closes the connection and drops this session's registry entry. Does
    /// nothing once the session is closed.
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Leaving;

        leave(&self.relay, &self.channel, &self.user, &self.peer).await;
        if let Some(key) = self.key.take() {
            self.relay.sessions().deregister(&key);
        }

        self.state = SessionState::Closed;
        debug!(user = %self.user, channel = %self.channel, "Session closed");
    }

    async fn forward(&self, payload: &[u8]) {
        let inbound = codec::decode_lenient(payload);
        if inbound.is_empty() {
            debug!(user = %self.user, "Undecodable message, forwarding empty text");
        }

        let envelope = inbound.into_text(&self.channel, &self.user, unix_timestamp());
        self.relay.publish(&envelope).await;
    }

    async fn notify(&self, envelope: &Envelope) {
        match codec::encode(envelope) {
            Ok(text) => self.notify_text(&text).await,
            Err(e) => warn!(user = %self.user, error = %e, "Could not encode envelope"),
        }
    }

    async fn notify_text(&self, text: &str) {
        if let Err(e) = self.peer.send_text(text).await {
            warn!(user = %self.user, error = %e, "Failed to write message");
        }
    }

    /// Tell the peer why it is being turned away, then close.
    async fn reject(&mut self, notice: &str) {
        self.notify_text(notice).await;
        self.abort().await;
    }

    async fn abort(&mut self) {
        if let Err(e) = self.peer.close().await {
            debug!(user = %self.user, error = %e, "Failed to close connection");
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        // Still registered here means the leave protocol never ran, e.g. the
        // owning task was cancelled.
        let Some(key) = self.key.take() else {
            return;
        };
        self.relay.sessions().deregister(&key);

        let relay = Arc::clone(&self.relay);
        let channel = self.channel.clone();
        let user = self.user.clone();
        let peer = Arc::clone(&self.peer);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { leave(&relay, &channel, &user, &peer).await });
            }
            Err(_) => warn!(peer = %key, "No runtime to release dropped session"),
        }
    }
}

/// Store and transport side of the leave protocol.
async fn leave(relay: &Relay, channel: &str, user: &str, peer: &SharedSink) {
    match relay.store().remove_user(user).await {
        Ok(()) => debug!(user = %user, "Removed user from presence store"),
        Err(e) => warn!(user = %user, error = %e, "Failed to remove user"),
    }

    relay.publish(&Envelope::left(channel, user)).await;

    if let Err(e) = peer.close().await {
        debug!(user = %user, error = %e, "Failed to close connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::keys::{CHANNELS_KEY, USERS_KEY};
    use crate::relay::RelayConfig;
    use crate::store::{MemoryStore, Subscription};
    use async_trait::async_trait;
    use parley_protocol::MessageKind;
    use parley_transport::memory;
    use tokio::sync::Notify;

    /// A [`MemoryStore`] that can fail or stall lookups and adds on one key.
    ///
    /// A stalled lookup resumes when the store is closed; closing does not
    /// close the inner store.
    #[derive(Default)]
    struct ScriptedStore {
        inner: MemoryStore,
        failing_lookup: Option<&'static str>,
        failing_add: Option<&'static str>,
        stalled_lookup: Option<&'static str>,
        stalled: Notify,
        released: Notify,
    }

    #[async_trait]
    impl PresenceStore for ScriptedStore {
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            if self.failing_lookup == Some(key) {
                return Err(StoreError::Unavailable("lookup refused".into()));
            }
            if self.stalled_lookup == Some(key) {
                self.stalled.notify_one();
                self.released.notified().await;
            }
            self.inner.is_member(key, member).await
        }

        async fn add_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
            if self.failing_add == Some(key) {
                return Err(StoreError::Unavailable("add refused".into()));
            }
            self.inner.add_member(key, member).await
        }

        async fn remove_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
            self.inner.remove_member(key, member).await
        }

        async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
            self.inner.subscribe(channel).await
        }

        async fn close(&self) -> Result<(), StoreError> {
            self.released.notify_one();
            Ok(())
        }
    }

    fn relay_with(store: &Arc<MemoryStore>, policy: UsernamePolicy) -> Arc<Relay> {
        let config = RelayConfig {
            username_policy: policy,
            ..RelayConfig::default()
        };
        Arc::new(Relay::with_config(store.clone(), config))
    }

    #[tokio::test]
    async fn test_start_joins_channel() {
        let store = Arc::new(MemoryStore::new());
        let relay = relay_with(&store, UsernamePolicy::Allow);
        let (sink, _stream, mut client) = memory::pair();

        let mut session = ChatSession::new(Arc::clone(&relay), "alice", "lobby", sink);
        session.start().await.unwrap();

        assert_eq!(session.state(), SessionState::Joining);
        assert!(store.channel_exists("lobby").await.unwrap());
        assert!(store.user_exists("alice").await.unwrap());
        assert!(store.user_in_channel("lobby", "alice").await.unwrap());
        assert!(relay.sessions().contains(session.key().unwrap()));
        assert!(relay.subscribers().is_running("lobby").await);

        let welcome = codec::decode(client.drain()[0].as_bytes()).unwrap();
        assert_eq!(welcome, Envelope::welcome("lobby", "alice"));
        assert_eq!(relay.stats().snapshot().published, 1);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let relay = relay_with(&store, UsernamePolicy::Allow);
        let (sink, _stream, _client) = memory::pair();

        let mut session = ChatSession::new(relay, "alice", "lobby", sink);
        session.start().await.unwrap();
        assert!(matches!(
            session.start().await,
            Err(SessionError::InvalidState(SessionState::Joining))
        ));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_invalid_names() {
        let store = Arc::new(MemoryStore::new());
        let relay = relay_with(&store, UsernamePolicy::Allow);
        let (sink, _stream, client) = memory::pair();

        let mut session = ChatSession::new(Arc::clone(&relay), "alice", USERS_KEY, sink);
        assert!(matches!(
            session.start().await,
            Err(SessionError::InvalidName(_))
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!client.is_open());
        assert!(!store.channel_exists(USERS_KEY).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_down_at_join() {
        let store = Arc::new(MemoryStore::new());
        let relay = relay_with(&store, UsernamePolicy::Allow);
        store.set_available(false);
        let (sink, _stream, mut client) = memory::pair();

        let mut session = ChatSession::new(Arc::clone(&relay), "alice", "lobby", sink);
        assert!(matches!(session.start().await, Err(SessionError::Store(_))));

        assert_eq!(session.state(), SessionState::Closed);
        assert!(client.drain().is_empty());
        assert!(!client.is_open());
        assert!(relay.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_user_lookup_failure_sends_retry_notice() {
        let store = Arc::new(ScriptedStore {
            failing_lookup: Some(USERS_KEY),
            ..ScriptedStore::default()
        });
        let relay = Arc::new(Relay::new(store.clone()));
        let (sink, _stream, mut client) = memory::pair();

        let mut session = ChatSession::new(Arc::clone(&relay), "alice", "lobby", sink);
        assert!(matches!(session.start().await, Err(SessionError::Store(_))));

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(client.drain(), vec![RETRY_NOTICE.to_string()]);
        assert!(!client.is_open());
        assert!(relay.sessions().is_empty());
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_user_create_failure_sends_retry_notice() {
        let store = Arc::new(ScriptedStore {
            failing_add: Some(USERS_KEY),
            ..ScriptedStore::default()
        });
        let relay = Arc::new(Relay::new(store.clone()));
        let (sink, _stream, mut client) = memory::pair();

        let mut session = ChatSession::new(Arc::clone(&relay), "alice", "lobby", sink);
        assert!(matches!(session.start().await, Err(SessionError::Store(_))));

        assert_eq!(client.drain(), vec![RETRY_NOTICE.to_string()]);
        assert!(!client.is_open());
        assert!(relay.sessions().is_empty());
        assert!(!store.inner.user_exists("alice").await.unwrap());
        assert_eq!(relay.stats().snapshot().published, 0);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_after_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let relay = relay_with(&store, UsernamePolicy::Allow);
        relay.shutdown().await;
        let (sink, _stream, mut client) = memory::pair();

        let mut session = ChatSession::new(Arc::clone(&relay), "alice", "lobby", sink);
        assert!(matches!(
            session.start().await,
            Err(SessionError::ShuttingDown)
        ));

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(client.drain(), vec![RETRY_NOTICE.to_string()]);
        assert!(!client.is_open());
        assert!(relay.sessions().is_empty());
    }

    /// Start a session that stalls on `key`, shut the relay down while it
    /// waits, and return what the join reported.
    async fn shutdown_while_joining(
        key: &'static str,
    ) -> (Arc<ScriptedStore>, Arc<Relay>, Result<(), SessionError>, memory::MemoryClient) {
        let store = Arc::new(ScriptedStore {
            stalled_lookup: Some(key),
            ..ScriptedStore::default()
        });
        let relay = Arc::new(Relay::new(store.clone()));
        let (sink, _stream, client) = memory::pair();

        let mut session = ChatSession::new(Arc::clone(&relay), "alice", "lobby", sink);
        let join = tokio::spawn(async move { session.start().await });

        store.stalled.notified().await;
        relay.shutdown().await;
        let result = join.await.unwrap();

        (store, relay, result, client)
    }

    #[tokio::test]
    async fn test_shutdown_during_channel_lookup() {
        let (_store, relay, result, mut client) = shutdown_while_joining(CHANNELS_KEY).await;

        assert!(matches!(result, Err(SessionError::ShuttingDown)));
        assert!(relay.sessions().is_empty());
        assert!(relay.subscribers().is_empty().await);
        assert_eq!(client.drain(), vec![RETRY_NOTICE.to_string()]);
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_shutdown_during_user_lookup() {
        let (store, relay, result, mut client) = shutdown_while_joining(USERS_KEY).await;

        assert!(matches!(result, Err(SessionError::ShuttingDown)));
        assert!(relay.sessions().is_empty());
        assert!(relay.subscribers().is_empty().await);
        assert!(!store.inner.user_exists("alice").await.unwrap());
        assert_eq!(relay.stats().snapshot().published, 0);
        assert_eq!(client.drain(), vec![RETRY_NOTICE.to_string()]);
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_reject_policy() {
        let store = Arc::new(MemoryStore::new());
        let relay = relay_with(&store, UsernamePolicy::Reject);
        store.create_user("alice").await.unwrap();
        let (sink, _stream, mut client) = memory::pair();

        let mut session = ChatSession::new(Arc::clone(&relay), "alice", "lobby", sink);
        assert!(matches!(
            session.start().await,
            Err(SessionError::UsernameTaken(ref user)) if user == "alice"
        ));

        assert_eq!(client.drain(), vec![username_taken_notice("alice")]);
        assert!(!client.is_open());
        assert!(relay.sessions().is_empty());
        assert!(!store.user_in_channel("lobby", "alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_allow_policy_admits_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let relay = relay_with(&store, UsernamePolicy::Allow);
        store.create_user("alice").await.unwrap();
        let (sink, _stream, _client) = memory::pair();

        let mut session = ChatSession::new(Arc::clone(&relay), "alice", "lobby", sink);
        session.start().await.unwrap();
        assert_eq!(relay.sessions().len(), 1);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_run_publishes_text_and_leaves() {
        let store = Arc::new(MemoryStore::new());
        let relay = relay_with(&store, UsernamePolicy::Allow);
        let mut tap = store.subscribe("lobby").await.unwrap();
        let (sink, stream, client) = memory::pair();

        let mut session = ChatSession::new(Arc::clone(&relay), "alice", "lobby", sink);
        session.start().await.unwrap();

        client.send(r#"{"From":"mallory","Channel":"elsewhere","Content":"hi","Type":"left"}"#);
        client.close();
        let exit = session.run(stream).await;
        assert!(matches!(exit, SessionExit::Closed));

        let mut kinds = Vec::new();
        for _ in 0..3 {
            let payload = futures_util::StreamExt::next(&mut tap).await.unwrap();
            kinds.push(codec::decode(payload.as_bytes()).unwrap());
        }

        assert_eq!(kinds[0].kind, MessageKind::Joined);
        assert_eq!(kinds[1].kind, MessageKind::Text);
        assert_eq!(kinds[1].from, "alice");
        assert_eq!(kinds[1].channel, "lobby");
        assert_eq!(kinds[1].content, "hi");
        assert!(kinds[1].timestamp.is_some());
        assert_eq!(kinds[2], Envelope::left("lobby", "alice"));

        assert!(relay.sessions().is_empty());
        assert!(!store.user_exists("alice").await.unwrap());
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_transport_error_still_cleans_up() {
        let store = Arc::new(MemoryStore::new());
        let relay = relay_with(&store, UsernamePolicy::Allow);
        let (sink, stream, client) = memory::pair();

        let mut session = ChatSession::new(Arc::clone(&relay), "alice", "lobby", sink);
        session.start().await.unwrap();

        client.fail("connection reset");
        let exit = session.run(stream).await;

        assert!(matches!(exit, SessionExit::Failed(_)));
        assert!(relay.sessions().is_empty());
        assert!(!store.user_exists("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_session_releases_presence() {
        let store = Arc::new(MemoryStore::new());
        let relay = relay_with(&store, UsernamePolicy::Allow);
        let (sink, _stream, _client) = memory::pair();

        let mut session = ChatSession::new(Arc::clone(&relay), "alice", "lobby", sink);
        session.start().await.unwrap();
        drop(session);

        assert!(relay.sessions().is_empty());
        for _ in 0..100 {
            if !store.members(USERS_KEY).contains(&"alice".to_string()) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!store.user_exists("alice").await.unwrap());
    }
}
