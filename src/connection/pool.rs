//! Connection free list and the pooled client.
//!
//! The pool is a double-ended free list. Checkout pops the most recently
//! used end, so a busy gateway keeps reusing a warm connection and idle
//! ones age out at the far end; an empty list opens a fresh connection
//! through the [`Connector`]. Checkout transfers exclusive ownership, so
//! a connection is never shared between tasks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::codec::Value;
use crate::config::GatewayConfig;
use crate::dispatch;
use crate::error::Result;
use crate::finalizer::ReleaseSender;
use crate::object::BoxFuture;
use crate::protocol::{
    release_command, response_is_success, Frame, ObjectId, TagShapes, TaggedValue,
};
use crate::session::SessionState;

use super::Connection;

/// Opens outbound connections on demand.
pub trait Connector: Send + Sync + 'static {
    /// Open and prepare one connection, authentication included.
    fn connect(&self) -> BoxFuture<'static, Result<Connection>>;
}

/// Connector dialing the configured peer address.
pub struct TcpConnector {
    config: Arc<GatewayConfig>,
    shapes: Arc<TagShapes>,
}

impl TcpConnector {
    pub fn new(config: Arc<GatewayConfig>, shapes: Arc<TagShapes>) -> Self {
        Self { config, shapes }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Connection>> {
        let config = self.config.clone();
        let shapes = self.shapes.clone();
        Box::pin(async move {
            let mut conn = Connection::open(&config, shapes).await?;
            match &config.auth_token {
                Some(token) => dispatch::authenticate(&mut conn, token).await?,
                // Born authenticated when the peer requires no token, so
                // callbacks dispatched on this connection are served.
                None => conn.set_authenticated(true),
            }
            Ok(conn)
        })
    }
}

/// Free list of idle connections.
pub struct ConnectionPool {
    idle: Mutex<VecDeque<Connection>>,
    connector: Arc<dyn Connector>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            connector,
        }
    }

    /// Take an idle connection, most recently used first, or open a new
    /// one. The lock is never held across the connect.
    pub async fn checkout(&self) -> Result<Connection> {
        if let Some(conn) = self.idle.lock().unwrap().pop_back() {
            return Ok(conn);
        }
        self.connector.connect().await
    }

    /// Return a connection to the free list. Dead connections are
    /// dropped here, never reused.
    pub fn check_in(&self, conn: Connection) {
        if conn.is_dead() {
            debug!("Discarding dead connection {}", conn.id());
            return;
        }
        self.idle.lock().unwrap().push_back(conn);
    }

    /// Drop every idle connection.
    pub fn close_all(&self) {
        self.idle.lock().unwrap().clear();
    }

    /// Number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

/// Client placing each call on a connection checked out of the pool.
pub struct PooledClient {
    pool: ConnectionPool,
    session: Arc<SessionState>,
}

impl PooledClient {
    pub fn new(connector: Arc<dyn Connector>, session: Arc<SessionState>) -> Self {
        Self {
            pool: ConnectionPool::new(connector),
            session,
        }
    }

    /// Send one command and await its response.
    ///
    /// On a network failure the command is re-sent verbatim over one
    /// fresh connection, provided the failed connection was initiated
    /// locally and this is the first retry. Failures to open a
    /// connection are never retried; neither are errors the peer
    /// reported, which arrive as a response, not a network failure.
    pub async fn call(&self, values: Vec<TaggedValue>) -> Result<Frame> {
        let mut retried = false;
        loop {
            let mut conn = self.pool.checkout().await?;
            match dispatch::exchange(&mut conn, &values, &self.session).await {
                Ok(frame) => {
                    self.pool.check_in(conn);
                    return Ok(frame);
                }
                Err(e) => {
                    let retry = !retried && conn.initiated_locally() && e.is_network();
                    self.pool.check_in(conn);
                    if retry {
                        warn!("Retrying command on a fresh connection: {}", e);
                        retried = true;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Call `member` on the peer object `target`.
    pub async fn invoke(&self, target: ObjectId, member: &str, args: &[Value]) -> Result<Value> {
        let values = self.session.encode_call(target, member, args)?;
        let frame = self.call(values).await?;
        self.session.interpret(&frame, target, member)
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    /// Number of idle pooled connections.
    pub fn idle_count(&self) -> usize {
        self.pool.idle_count()
    }

    /// Drop all idle connections.
    pub fn close(&self) {
        self.pool.close_all();
    }
}

impl ReleaseSender for PooledClient {
    fn send_release(self: Arc<Self>, id: ObjectId) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let frame = self.call(release_command(id)).await?;
            if !response_is_success(&frame) {
                warn!("Peer did not acknowledge release of {}", id);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::finalizer::{FinalizeHandle, FinalizerTable};
    use crate::protocol::{
        encode_values, success_response, CommandCode, FrameKind, FrameScanner, TaggedValue,
        DEFAULT_MAX_VALUE_SIZE,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    fn test_session() -> Arc<SessionState> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(SessionState::new(
            Codec::standard(),
            None,
            None,
            true,
            FinalizeHandle::new(tx),
            FinalizerTable::new(),
        ))
    }

    fn test_conn<S: super::super::Duplex + 'static>(stream: S, local: bool) -> Connection {
        Connection::from_stream(
            stream,
            local,
            Arc::new(TagShapes::new()),
            DEFAULT_MAX_VALUE_SIZE,
            None,
        )
    }

    /// Hands out prepared connections and counts how many were taken.
    struct MockConnector {
        prepared: Mutex<VecDeque<Connection>>,
        connects: AtomicUsize,
    }

    impl MockConnector {
        fn new(conns: Vec<Connection>) -> Arc<Self> {
            Arc::new(Self {
                prepared: Mutex::new(conns.into()),
                connects: AtomicUsize::new(0),
            })
        }
    }

    impl Connector for MockConnector {
        fn connect(&self) -> BoxFuture<'static, Result<Connection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let conn = self.prepared.lock().unwrap().pop_front();
            Box::pin(async move {
                conn.ok_or(crate::error::ObjwireError::ConnectionClosed)
            })
        }
    }

    #[tokio::test]
    async fn test_checkout_prefers_most_recent() {
        let pool = ConnectionPool::new(MockConnector::new(Vec::new()) as Arc<dyn Connector>);

        let (a, _keep_a) = tokio::io::duplex(16);
        let (b, _keep_b) = tokio::io::duplex(16);
        let older = test_conn(a, true);
        let newer = test_conn(b, true);
        let (older_id, newer_id) = (older.id(), newer.id());

        pool.check_in(older);
        pool.check_in(newer);
        assert_eq!(pool.idle_count(), 2);

        assert_eq!(pool.checkout().await.unwrap().id(), newer_id);
        assert_eq!(pool.checkout().await.unwrap().id(), older_id);
    }

    #[tokio::test]
    async fn test_dead_connections_not_pooled() {
        let pool = ConnectionPool::new(MockConnector::new(Vec::new()) as Arc<dyn Connector>);

        let (a, _keep) = tokio::io::duplex(16);
        let mut conn = test_conn(a, true);
        conn.mark_dead();
        pool.check_in(conn);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_network_failure_retries_once_on_fresh_connection() {
        // First connection: peer half dropped, so the write fails.
        let (a1, b1) = tokio::io::duplex(64 * 1024);
        drop(b1);
        let broken = test_conn(a1, true);

        // Second connection: response already buffered on the peer half.
        let (a2, mut b2) = tokio::io::duplex(64 * 1024);
        b2.write_all(&encode_values(&success_response(TaggedValue::null())))
            .await
            .unwrap();
        let working = test_conn(a2, true);

        let connector = MockConnector::new(vec![broken, working]);
        let client = PooledClient::new(connector.clone() as Arc<dyn Connector>, test_session());

        let frame = client
            .call(release_command(ObjectId::new(1)))
            .await
            .unwrap();
        assert!(response_is_success(&frame));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retry_on_remote_initiated_connection() {
        let (a1, b1) = tokio::io::duplex(64 * 1024);
        drop(b1);
        let broken = test_conn(a1, false);

        let connector = MockConnector::new(vec![broken]);
        let client = PooledClient::new(connector.clone() as Arc<dyn Connector>, test_session());

        let err = client
            .call(release_command(ObjectId::new(1)))
            .await
            .unwrap_err();
        assert!(err.is_network());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_without_token_is_born_authenticated() {
        // A peer that requires no token must accept commands on this
        // connection immediately, nested callbacks included.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Arc::new(GatewayConfig {
            address: Some(listener.local_addr().unwrap().to_string()),
            ..GatewayConfig::default()
        });

        let connector = TcpConnector::new(config, Arc::new(TagShapes::new()));
        let conn = connector.connect().await.unwrap();

        assert!(conn.is_authenticated());
        assert!(conn.initiated_locally());
    }

    #[tokio::test]
    async fn test_release_sender_emits_release_command() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        b.write_all(&encode_values(&success_response(TaggedValue::null())))
            .await
            .unwrap();
        let conn = test_conn(a, true);

        let connector = MockConnector::new(vec![conn]);
        let client = Arc::new(PooledClient::new(
            connector as Arc<dyn Connector>,
            test_session(),
        ));

        client.clone().send_release(ObjectId::new(12)).await.unwrap();

        // The peer half now holds the released command.
        let mut scanner = FrameScanner::new(Arc::new(TagShapes::new()));
        let mut buf = [0u8; 256];
        let n = tokio::io::AsyncReadExt::read(&mut b, &mut buf).await.unwrap();
        let frames = scanner.push(&buf[..n]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].kind().unwrap(),
            FrameKind::Command(CommandCode::Release.as_i32())
        );
        assert_eq!(
            frames[0].arguments()[0].as_object_id().unwrap(),
            ObjectId::new(12)
        );
    }
}
