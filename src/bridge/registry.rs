//! Session Registry
//!
//! Makes live connections addressable by session id. Every map operation
//! runs inside one critical section, so `remove_and_cleanup` is atomic with
//! respect to a concurrent `get`: a lookup sees either the whole entry or
//! nothing, never a half torn-down one.
//!
//! The registry is an injected instance owned by the server, not process
//! state. It only holds lookup references; the controller that created a
//! record owns its lifetime and releases it through `remove_and_cleanup`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::sender::SafeSender;
use super::session::RemoteShellSession;

/// Mutable per-client state, guarded by the record's lock
#[derive(Default)]
struct ClientState {
    session: Option<Arc<RemoteShellSession>>,
    connected: bool,
    /// Keystrokes not yet flushed (line-buffered input only)
    command_buffer: String,
}

/// Result of appending to the command buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferedLine {
    /// No line terminator yet
    Pending,
    /// A complete line, buffer now empty
    Line(String),
    /// The complete line was the exit sentinel
    Exit,
}

/// One connected peer
///
/// The state lock is a short, synchronous critical section and is never
/// held across an await; peer writes go through the separate
/// [`SafeSender`] lock.
pub struct ClientRecord {
    id: String,
    sender: SafeSender,
    state: parking_lot::Mutex<ClientState>,
}

impl ClientRecord {
    pub fn new(id: String, sender: SafeSender) -> Self {
        Self {
            id,
            sender,
            state: parking_lot::Mutex::new(ClientState {
                connected: true,
                ..Default::default()
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> &SafeSender {
        &self.sender
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn session(&self) -> Option<Arc<RemoteShellSession>> {
        self.state.lock().session.clone()
    }

    /// Bind the established shell; a record carries at most one
    ///
    /// Returns false if a session was already attached.
    pub fn attach(&self, session: Arc<RemoteShellSession>) -> bool {
        let mut state = self.state.lock();
        if state.session.is_some() {
            return false;
        }
        state.session = Some(session);
        true
    }

    /// Append a fragment and report whether a line is ready
    pub fn buffer_input(&self, fragment: &str) -> BufferedLine {
        let mut state = self.state.lock();
        state.command_buffer.push_str(fragment);

        if !state.command_buffer.ends_with(['\n', '\r']) {
            return BufferedLine::Pending;
        }

        let line = std::mem::take(&mut state.command_buffer);
        if line.trim_end_matches(['\r', '\n']) == "exit" {
            BufferedLine::Exit
        } else {
            BufferedLine::Line(line)
        }
    }

    fn take_for_cleanup(&self) -> Option<Arc<RemoteShellSession>> {
        let mut state = self.state.lock();
        state.connected = false;
        state.command_buffer.clear();
        state.session.take()
    }
}

/// Concurrency-safe map from session id to client record
#[derive(Default)]
pub struct SessionRegistry {
    clients: Mutex<HashMap<String, Arc<ClientRecord>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ClientRecord>> {
        self.clients.lock().await.get(id).cloned()
    }

    /// Insert or replace
    pub async fn put(&self, id: String, client: Arc<ClientRecord>) {
        self.clients.lock().await.insert(id, client);
    }

    /// Insert only if the id is free; returns false when it is taken
    pub async fn try_put(&self, id: String, client: Arc<ClientRecord>) -> bool {
        let mut clients = self.clients.lock().await;
        if clients.contains_key(&id) {
            return false;
        }
        clients.insert(id, client);
        true
    }

    /// Drop the entry, then close its shell (if attached) and peer channel
    ///
    /// Detaching and removal happen inside one critical section; the
    /// closes run after the lock is released, so a peer that is slow to
    /// take its close frame never stalls other lookups. Removing an absent
    /// id is a no-op.
    pub async fn remove_and_cleanup(&self, id: &str) {
        let (client, session, remaining) = {
            let mut clients = self.clients.lock().await;
            let Some(client) = clients.remove(id) else {
                debug!("Cleanup for unknown session {} skipped", id);
                return;
            };
            let session = client.take_for_cleanup();
            (client, session, clients.len())
        };

        if let Some(session) = session {
            session.close().await;
        }
        client.sender().close().await;

        info!("Session {} removed from registry, {} remaining", id, remaining);
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ServerMessage;
    use crate::bridge::testutil::{next_frame, ws_pair, ws_pair_with_capacity};
    use std::time::Duration;
    use crate::ssh::ShellIo;
    use futures_util::StreamExt;
    use tokio_tungstenite::tungstenite::Message;

    fn record(id: &str) -> Arc<ClientRecord> {
        Arc::new(ClientRecord::new(id.to_string(), SafeSender::detached()))
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.get("a").await.is_none());

        registry.put("a".to_string(), record("a")).await;
        assert_eq!(registry.get("a").await.unwrap().id(), "a");
        assert_eq!(registry.len().await, 1);

        registry.remove_and_cleanup("a").await;
        assert!(registry.get("a").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_and_cleanup_is_idempotent() {
        let registry = SessionRegistry::new();
        let client = record("a");
        registry.put("a".to_string(), client.clone()).await;
        registry.put("b".to_string(), record("b")).await;

        registry.remove_and_cleanup("a").await;
        registry.remove_and_cleanup("a").await;
        registry.remove_and_cleanup("never-registered").await;

        assert!(!client.is_connected());
        assert!(registry.get("a").await.is_none());
        assert!(registry.get("b").await.is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_try_put_refuses_taken_id() {
        let registry = SessionRegistry::new();
        assert!(registry.try_put("key".to_string(), record("first")).await);
        assert!(!registry.try_put("key".to_string(), record("second")).await);
        assert_eq!(registry.get("key").await.unwrap().id(), "first");
    }

    #[tokio::test]
    async fn test_cleanup_closes_session_and_peer() {
        let (server, mut client_ws) = ws_pair().await;
        let (sink, _stream) = server.split();
        let sender = SafeSender::new(sink);

        let (io, endpoint) = ShellIo::pair();
        let session = Arc::new(RemoteShellSession::new("s".to_string(), io, sender.clone()));
        let client = Arc::new(ClientRecord::new("s".to_string(), sender.clone()));
        assert!(client.attach(session.clone()));

        let registry = SessionRegistry::new();
        registry.put("s".to_string(), client.clone()).await;
        registry.remove_and_cleanup("s").await;

        assert!(session.is_terminated());
        assert!(endpoint.closed.is_cancelled());
        assert!(sender.is_closed().await);
        assert!(client.session().is_none());
        assert!(matches!(next_frame(&mut client_ws).await, Some(Message::Close(_))));
    }

    #[tokio::test]
    async fn test_concurrent_get_never_sees_partial_entry() {
        let registry = Arc::new(SessionRegistry::new());
        let client = record("x");
        let (io, _endpoint) = ShellIo::pair();
        let session = Arc::new(RemoteShellSession::new(
            "x".to_string(),
            io,
            SafeSender::detached(),
        ));
        client.attach(session);
        registry.put("x".to_string(), client).await;

        let reader = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    if let Some(found) = registry.get("x").await {
                        // Either fully live or already gone from the map
                        assert!(found.is_connected());
                        assert!(found.session().is_some());
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        registry.remove_and_cleanup("x").await;
        reader.await.unwrap();
    }

    #[test]
    fn test_command_buffer_flushes_on_terminator() {
        let client = record("c");
        assert_eq!(client.buffer_input("l"), BufferedLine::Pending);
        assert_eq!(client.buffer_input("s"), BufferedLine::Pending);
        assert_eq!(
            client.buffer_input("\n"),
            BufferedLine::Line("ls\n".to_string())
        );
        // Cleared after the flush
        assert_eq!(client.buffer_input("pwd\r"), BufferedLine::Line("pwd\r".to_string()));
    }

    #[test]
    fn test_command_buffer_detects_exit() {
        let client = record("c");
        assert_eq!(client.buffer_input("exit\r"), BufferedLine::Exit);
        assert_eq!(client.buffer_input("exi"), BufferedLine::Pending);
        assert_eq!(client.buffer_input("t\n"), BufferedLine::Exit);
        assert_eq!(
            client.buffer_input("exit now\n"),
            BufferedLine::Line("exit now\n".to_string())
        );
    }

    #[test]
    fn test_only_one_session_attaches() {
        let client = record("c");
        let (io1, _e1) = ShellIo::pair();
        let (io2, _e2) = ShellIo::pair();
        let first = Arc::new(RemoteShellSession::new("1".into(), io1, SafeSender::detached()));
        let second = Arc::new(RemoteShellSession::new("2".into(), io2, SafeSender::detached()));

        assert!(client.attach(first));
        assert!(!client.attach(second));
        assert_eq!(client.session().unwrap().id(), "1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_does_not_block_other_sessions() {
        // The slow peer never reads; its pipe is already full
        let (server, _slow_client) = ws_pair_with_capacity(1024).await;
        let (sink, _stream) = server.split();
        let sender = SafeSender::new(sink);
        assert!(sender
            .send_message(&ServerMessage::output("x".repeat(64 * 1024)))
            .await
            .is_err());

        let registry = Arc::new(SessionRegistry::new());
        let slow = Arc::new(ClientRecord::new("slow".to_string(), sender.clone()));
        registry.put("slow".to_string(), slow).await;
        registry.put("other".to_string(), record("other")).await;

        let cleanup = tokio::spawn({
            let registry = registry.clone();
            async move { registry.remove_and_cleanup("slow").await }
        });
        tokio::task::yield_now().await;

        let other = tokio::time::timeout(Duration::from_secs(1), registry.get("other"))
            .await
            .expect("registry lookups must not wait on a slow peer");
        assert!(other.is_some());
        assert!(
            tokio::time::timeout(Duration::from_secs(1), registry.try_put("new".to_string(), record("new")))
                .await
                .unwrap()
        );

        tokio::time::timeout(Duration::from_secs(30), cleanup)
            .await
            .expect("cleanup must finish")
            .unwrap();
        assert!(registry.get("slow").await.is_none());
        assert!(sender.is_closed().await);
    }
}
