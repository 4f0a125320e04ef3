//! Gateway builder and lifecycle.
//!
//! The [`GatewayBuilder`] provides a fluent API for configuring the
//! bridge. [`GatewayBuilder::start`] assembles the pieces:
//! 1. Build the codec (extensions included)
//! 2. Spawn the finalizer worker
//! 3. Create the session state and the mode's client
//! 4. Bind the callback listener, if configured
//!
//! A started [`Gateway`] hands out [`RemoteObject`] handles for the
//! peer's entry point, invokes members on them, exposes local objects
//! and tears the whole session down in order on [`Gateway::shutdown`].
//!
//! # Example
//!
//! ```ignore
//! use objwire::{Gateway, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::builder()
//!         .address("127.0.0.1:25333")
//!         .listen("127.0.0.1:0")
//!         .start()
//!         .await?;
//!
//!     let entry = gateway.entry_point();
//!     let sum = gateway
//!         .invoke(&entry, "add", &[Value::from(1), Value::from(2)])
//!         .await?;
//!     assert_eq!(sum.as_i64(), Some(3));
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::{Codec, Extension, Value};
use crate::config::{GatewayConfig, Mode, TlsClient};
use crate::connection::{
    spawn_listener, CallbackListener, Connection, Connector, PooledClient, TcpConnector,
};
use crate::dispatch;
use crate::error::{ObjwireError, Result};
use crate::finalizer::{spawn_finalizer, ReleaseSender};
use crate::object::{BoxFuture, LocalProxy, ProxyObject, RemoteObject};
use crate::protocol::{
    release_command, response_is_success, shutdown_command, ConnectionId, Frame, ObjectId,
    TaggedValue, ENTRY_POINT_OBJECT_ID, SERVER_OBJECT_ID,
};
use crate::registry::ObjectRegistry;
use crate::session::SessionState;

/// Builder for configuring and starting a [`Gateway`].
pub struct GatewayBuilder {
    config: GatewayConfig,
    extensions: Vec<Extension>,
    error_tags: Vec<i16>,
    entry_point: Option<Arc<dyn ProxyObject>>,
}

impl GatewayBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            extensions: Vec::new(),
            error_tags: Vec::new(),
            entry_point: None,
        }
    }

    /// Address of the peer to call into, `host:port`.
    ///
    /// Without an address the gateway can only serve inbound calls.
    pub fn address(mut self, addr: &str) -> Self {
        self.config.address = Some(addr.to_string());
        self
    }

    /// Timeout for establishing outbound connections.
    ///
    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Timeout for reading a single frame; a connection that exceeds it
    /// is marked dead.
    ///
    /// Default: none
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    /// Wrap outbound connections in TLS.
    pub fn tls(mut self, tls: TlsClient) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Token presented on outbound connections and required from
    /// inbound ones.
    pub fn auth_token(mut self, token: &str) -> Self {
        self.config.auth_token = Some(token.to_string());
        self
    }

    /// Whether dropped remote handles enqueue RELEASE commands.
    ///
    /// Default: true
    pub fn memory_management(mut self, enabled: bool) -> Self {
        self.config.memory_management = enabled;
        self
    }

    /// Detach the finalizer worker instead of joining it on shutdown.
    /// Queued releases become best-effort.
    ///
    /// Default: false
    pub fn daemonize_finalizer(mut self, daemonize: bool) -> Self {
        self.config.daemonize_finalizer = daemonize;
        self
    }

    /// Connection strategy for outbound calls.
    ///
    /// Default: [`Mode::Pooled`]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Bind address for the callback listener, `host:port` (port 0
    /// picks a free port).
    ///
    /// Default: no listener
    pub fn listen(mut self, bind: &str) -> Self {
        self.config.listen = Some(bind.to_string());
        self
    }

    /// Object the peer reaches through the entry-point sentinel.
    pub fn expose_entry_point(mut self, obj: Arc<dyn ProxyObject>) -> Self {
        self.entry_point = Some(obj);
        self
    }

    /// Register a protocol extension claiming one negative tag.
    pub fn extension(mut self, extension: Extension) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Treat an extension tag as an error outcome when interpreting
    /// responses.
    pub fn error_tag(mut self, tag: i16) -> Self {
        self.error_tags.push(tag);
        self
    }

    /// Maximum payload size accepted for a single wire value.
    ///
    /// Default: 1 GB
    pub fn max_value_size(mut self, size: usize) -> Self {
        self.config.max_value_size = size;
        self
    }

    /// Assemble and start the gateway.
    pub async fn start(self) -> Result<Gateway> {
        let codec = Codec::with_extensions(self.extensions, &self.error_tags)?;
        let shapes = codec.shapes();
        let config = Arc::new(self.config);

        let (finalize_queue, finalizer_task) = spawn_finalizer();
        let session = Arc::new(SessionState::new(
            codec,
            self.entry_point,
            config.auth_token.clone(),
            config.memory_management,
            finalize_queue,
            crate::finalizer::FinalizerTable::new(),
        ));

        let connector: Arc<dyn Connector> =
            Arc::new(TcpConnector::new(config.clone(), shapes.clone()));

        let client = match config.mode {
            Mode::Pooled => {
                let pooled = Arc::new(PooledClient::new(connector.clone(), session.clone()));
                session.set_owner(Arc::downgrade(&pooled) as Weak<dyn ReleaseSender>);
                ModeClient::Pooled(pooled)
            }
            Mode::TaskAffine => {
                let affine = Arc::new(AffineClient::new(Caller::new(
                    connector.clone(),
                    session.clone(),
                )));
                session.set_owner(Arc::downgrade(&affine) as Weak<dyn ReleaseSender>);
                ModeClient::Affine(affine)
            }
        };

        let listener = match &config.listen {
            Some(bind) => {
                Some(spawn_listener(bind, session.clone(), shapes, config.max_value_size).await?)
            }
            None => None,
        };

        debug!("Gateway started in {:?} mode", config.mode);
        Ok(Gateway {
            config,
            session,
            client,
            connector,
            listener,
            finalizer_task,
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The client the configured mode routes outbound calls through.
enum ModeClient {
    Pooled(Arc<PooledClient>),
    Affine(Arc<AffineClient>),
}

/// A running object bridge endpoint.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    session: Arc<SessionState>,
    client: ModeClient,
    connector: Arc<dyn Connector>,
    listener: Option<CallbackListener>,
    finalizer_task: JoinHandle<()>,
}

impl Gateway {
    /// Create a gateway builder.
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Handle for the peer's configured entry point.
    pub fn entry_point(&self) -> RemoteObject {
        RemoteObject::sentinel(ENTRY_POINT_OBJECT_ID)
    }

    /// Handle for the peer process itself.
    pub fn server(&self) -> RemoteObject {
        RemoteObject::sentinel(SERVER_OBJECT_ID)
    }

    /// Call `member` on a peer object.
    pub async fn invoke(
        &self,
        target: &RemoteObject,
        member: &str,
        args: &[Value],
    ) -> Result<Value> {
        match &self.client {
            ModeClient::Pooled(client) => client.invoke(target.id(), member, args).await,
            ModeClient::Affine(client) => client.invoke(target.id(), member, args).await,
        }
    }

    /// A caller owning its own dedicated connection.
    ///
    /// The connection opens on the first call and is reused for every
    /// call after that; reentrant callbacks arrive over it while a call
    /// awaits its response.
    pub fn caller(&self) -> Caller {
        Caller::new(self.connector.clone(), self.session.clone())
    }

    /// Expose a local object to the peer, allocating its reference id.
    pub fn expose(&self, obj: Arc<dyn ProxyObject>) -> LocalProxy {
        let proxy = LocalProxy::new(obj);
        proxy.ensure_id(self.session.registry());
        proxy
    }

    /// Registry of local objects the peer can reach.
    pub fn registry(&self) -> &ObjectRegistry {
        self.session.registry()
    }

    /// Bound address of the callback listener, if one is running.
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(CallbackListener::addr)
    }

    /// Tear the session down in order: stop the finalizer, notify the
    /// peer, close pooled sockets, stop the callback listener.
    pub async fn shutdown(self) {
        // No handle dropped from here on may notify the peer.
        self.session.finalizers.sweep(true);
        self.session.finalize_queue.stop();
        if self.config.daemonize_finalizer {
            drop(self.finalizer_task);
        } else if let Err(e) = self.finalizer_task.await {
            warn!("Finalizer worker ended abnormally: {}", e);
        }

        if self.config.address.is_some() {
            let result = match &self.client {
                ModeClient::Pooled(client) => client.call(shutdown_command()).await,
                ModeClient::Affine(client) => client.call(shutdown_command()).await,
            };
            match result {
                Ok(frame) if response_is_success(&frame) => {
                    debug!("Peer acknowledged shutdown");
                }
                Ok(_) => warn!("Peer rejected the shutdown command"),
                Err(e) => warn!("Shutdown notification failed: {}", e),
            }
        }

        if let ModeClient::Pooled(client) = &self.client {
            client.close();
        }
        if let Some(listener) = self.listener {
            listener.shutdown().await;
        }
        debug!("Gateway shut down");
    }
}

/// Task-affine caller owning exactly one connection for its lifetime.
///
/// Calls are strictly sequential on the owned connection; a peer
/// callback issued while one of this caller's calls awaits its response
/// is dispatched on the same connection before the response unwinds.
pub struct Caller {
    conn: Option<Connection>,
    session: Arc<SessionState>,
    connector: Arc<dyn Connector>,
}

impl Caller {
    fn new(connector: Arc<dyn Connector>, session: Arc<SessionState>) -> Self {
        Self {
            conn: None,
            session,
            connector,
        }
    }

    async fn active_conn(&mut self) -> Result<&mut Connection> {
        if self.conn.as_ref().map_or(true, Connection::is_dead) {
            let fresh = self.connector.connect().await?;
            return Ok(self.conn.insert(fresh));
        }
        match self.conn.as_mut() {
            Some(conn) => Ok(conn),
            None => Err(ObjwireError::ConnectionClosed),
        }
    }

    /// Send one command and await its response, same retry rule as the
    /// pooled client: one re-send on a fresh connection after a network
    /// failure, never after a failure to connect.
    pub async fn call_values(&mut self, values: &[TaggedValue]) -> Result<Frame> {
        let mut retried = false;
        loop {
            let session = self.session.clone();
            let conn = self.active_conn().await?;
            match dispatch::exchange(conn, values, &session).await {
                Ok(frame) => return Ok(frame),
                Err(e) => {
                    let retry = !retried && conn.initiated_locally() && e.is_network();
                    // The stream position is unreliable after any failed
                    // exchange; the connection is not reused.
                    self.conn = None;
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

    /// Call `member` on a peer object over the owned connection.
    pub async fn invoke(
        &mut self,
        target: &RemoteObject,
        member: &str,
        args: &[Value],
    ) -> Result<Value> {
        self.invoke_id(target.id(), member, args).await
    }

    async fn invoke_id(&mut self, target: ObjectId, member: &str, args: &[Value]) -> Result<Value> {
        let values = self.session.encode_call(target, member, args)?;
        let frame = self.call_values(&values).await?;
        self.session.interpret(&frame, target, member)
    }

    /// Id of the owned connection, once one is open.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.conn.as_ref().map(Connection::id)
    }

    /// Close the owned connection. The next call opens a fresh one.
    pub fn close(&mut self) {
        self.conn = None;
    }
}

/// Shared caller serializing a whole gateway's calls onto one
/// connection.
struct AffineClient {
    caller: Mutex<Caller>,
}

impl AffineClient {
    fn new(caller: Caller) -> Self {
        Self {
            caller: Mutex::new(caller),
        }
    }

    async fn call(&self, values: Vec<TaggedValue>) -> Result<Frame> {
        self.caller.lock().await.call_values(&values).await
    }

    async fn invoke(&self, target: ObjectId, member: &str, args: &[Value]) -> Result<Value> {
        self.caller.lock().await.invoke_id(target, member, args).await
    }
}

impl ReleaseSender for AffineClient {
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
    use crate::protocol::{encode_values, FrameScanner, TagShapes, DEFAULT_MAX_VALUE_SIZE};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct Nothing;

    impl ProxyObject for Nothing {
        fn invoke<'a>(
            &'a self,
            _member: &'a str,
            _args: Vec<Value>,
            _ctx: crate::dispatch::CallContext<'a>,
        ) -> BoxFuture<'a, Result<Value>> {
            Box::pin(async { Ok(Value::Null) })
        }
    }

    #[tokio::test]
    async fn test_default_gateway_starts_and_shuts_down() {
        let gateway = Gateway::builder().start().await.unwrap();

        assert!(gateway.listener_addr().is_none());
        assert_eq!(gateway.entry_point().id(), ENTRY_POINT_OBJECT_ID);
        assert_eq!(gateway.server().id(), SERVER_OBJECT_ID);

        // No peer address configured, so shutdown must not try to
        // notify anyone; it still joins the finalizer and returns.
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_expose_allocates_ids_eagerly() {
        let gateway = Gateway::builder().start().await.unwrap();

        let first = gateway.expose(Arc::new(Nothing));
        let second = gateway.expose(Arc::new(Nothing));

        assert!(first.id().is_some());
        assert_ne!(first.id(), second.id());
        assert_eq!(gateway.registry().size(), 2);

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_caller_connects_lazily() {
        let gateway = Gateway::builder()
            .address("127.0.0.1:1")
            .connect_timeout(Duration::from_millis(200))
            .start()
            .await
            .unwrap();

        let caller = gateway.caller();
        assert!(caller.connection_id().is_none());

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_gateway_listener_serves_release() {
        let gateway = Gateway::builder().listen("127.0.0.1:0").start().await.unwrap();
        let addr = gateway.listener_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&encode_values(&release_command(ObjectId::new(3))))
            .await
            .unwrap();

        let mut scanner = FrameScanner::new(Arc::new(TagShapes::new()));
        let mut buf = [0u8; 256];
        let frame = loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "gateway closed before responding");
            if let Some(frame) = scanner.push(&buf[..n]).unwrap().pop() {
                break frame;
            }
        };
        assert!(response_is_success(&frame));

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_with_unreachable_peer_still_completes() {
        // Reserved port, nothing listens; the shutdown notification
        // fails and is logged, not raised.
        let gateway = Gateway::builder()
            .address("127.0.0.1:1")
            .connect_timeout(Duration::from_millis(200))
            .start()
            .await
            .unwrap();
        gateway.shutdown().await;
    }

    #[test]
    fn test_builder_defaults() {
        let builder = GatewayBuilder::default();
        assert!(builder.config.address.is_none());
        assert!(builder.config.memory_management);
        assert_eq!(builder.config.mode, Mode::Pooled);
        assert_eq!(builder.config.max_value_size, DEFAULT_MAX_VALUE_SIZE);
    }
}
