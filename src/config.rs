//! Gateway configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;

use crate::protocol::DEFAULT_MAX_VALUE_SIZE;

/// How outbound calls map onto connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Free list of interchangeable connections; every call checks one
    /// out and returns it afterwards.
    #[default]
    Pooled,
    /// Each [`Caller`] owns one connection for its whole lifetime, so
    /// nested callbacks arrive on the connection that placed the call.
    ///
    /// [`Caller`]: crate::gateway::Caller
    TaskAffine,
}

/// Client-side TLS settings for outbound connections.
#[derive(Clone)]
pub struct TlsClient {
    /// rustls client configuration (trust roots, versions).
    pub config: Arc<ClientConfig>,
    /// Name the peer's certificate must verify against.
    pub server_name: ServerName<'static>,
}

impl fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClient")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Configuration for a gateway.
///
/// Built through [`GatewayBuilder`]; the defaults here are what an
/// unconfigured builder produces.
///
/// [`GatewayBuilder`]: crate::GatewayBuilder
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Peer address for outbound calls (`host:port`). `None` makes the
    /// gateway callback-only: serving inbound calls works, placing
    /// outbound ones fails.
    pub address: Option<String>,
    /// Time limit for establishing one connection, TLS included.
    pub connect_timeout: Duration,
    /// Time limit for each read while awaiting a response on an
    /// outbound connection. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// TLS for outbound connections. Inbound callback connections are
    /// accepted in the clear.
    pub tls: Option<TlsClient>,
    /// Shared secret a connection must present before its first command.
    pub auth_token: Option<String>,
    /// Track remote handles and release them on drop.
    pub memory_management: bool,
    /// Detach the finalizer worker at shutdown instead of joining it.
    pub daemonize_finalizer: bool,
    /// Connection handling mode.
    pub mode: Mode,
    /// Bind address for the callback listener. `None` disables serving.
    pub listen: Option<String>,
    /// Upper bound for a single length-prefixed payload.
    pub max_value_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: None,
            tls: None,
            auth_token: None,
            memory_management: true,
            daemonize_finalizer: false,
            mode: Mode::Pooled,
            listen: None,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
        }
    }
}
