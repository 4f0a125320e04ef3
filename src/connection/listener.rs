//! Callback listener - accepts connections the peer opens into us.
//!
//! Every accepted connection gets its own serve task running the
//! dispatcher loop. The accept loop itself runs until shut down; serve
//! tasks end on their own when their connection closes.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dispatch;
use crate::error::Result;
use crate::protocol::TagShapes;
use crate::session::SessionState;

use super::Connection;

/// Handle to the running callback listener.
pub struct CallbackListener {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl CallbackListener {
    /// Address the listener is bound on (useful with port 0).
    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept loop to exit. Serve tasks
    /// for already-accepted connections finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

/// Bind `bind` and serve inbound calls against the session's registry.
pub async fn spawn_listener(
    bind: &str,
    session: Arc<SessionState>,
    shapes: Arc<TagShapes>,
    max_value_size: usize,
) -> Result<CallbackListener> {
    let listener = TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    debug!("Callback listener bound on {}", local_addr);

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("Callback listener on {} shutting down", local_addr);
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set NODELAY for {}: {}", peer, e);
                    }
                    debug!("Accepted callback connection from {}", peer);

                    let mut conn = Connection::from_stream(
                        stream,
                        false,
                        shapes.clone(),
                        max_value_size,
                        None,
                    );
                    // Born authenticated when no token is required.
                    conn.set_authenticated(session.auth_token.is_none());

                    let session = session.clone();
                    tokio::spawn(dispatch::serve(conn, session));
                }
            }
        }
    });

    Ok(CallbackListener {
        local_addr,
        shutdown_tx,
        task,
    })
}
