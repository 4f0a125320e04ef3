//! Command dispatcher - per-connection serve loop and reentrant calls.
//!
//! Both directions of traffic meet here. [`serve`] runs on connections
//! the peer opened into us and answers inbound commands until EOF.
//! [`exchange`] runs on the caller side: it writes one command and reads
//! until the matching response arrives, dispatching any inbound command
//! that shows up first. That is what makes calls reentrant: while we
//! await the peer's answer, the peer may call back into our objects over
//! the very same connection, and those nested calls complete before the
//! original response is read.
//!
//! Inbound dispatch hands the active connection to the invoked object
//! through [`CallContext`], so nested outbound calls use the connection
//! the inbound call arrived on, never a different one.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::Value;
use crate::connection::Connection;
use crate::error::{ObjwireError, Result};
use crate::object::RemoteObject;
use crate::protocol::{
    error_response, exception_response, lazy_command, response_is_success, success_response, tag,
    CommandCode, ConnectionId, Frame, FrameKind, ObjectId, TaggedValue, ENTRY_POINT_OBJECT_ID,
    SERVER_OBJECT_ID,
};
use crate::session::SessionState;

/// What the serve loop does after one inbound command.
enum Flow {
    Continue,
    Shutdown,
}

/// Context of an inbound invocation.
///
/// Borrows the connection the call arrived on for the duration of the
/// invocation, so callbacks to the peer travel over that connection.
pub struct CallContext<'a> {
    conn: &'a mut Connection,
    session: &'a Arc<SessionState>,
}

impl<'a> CallContext<'a> {
    /// Id of the connection the call arrived on.
    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Session state shared by all connections of this gateway.
    pub fn session(&self) -> &Arc<SessionState> {
        self.session
    }

    /// Call back to the peer over the connection of the current call.
    ///
    /// Never retried: the connection is borrowed from the call being
    /// dispatched, so a failure here fails that call too.
    pub async fn invoke(
        &mut self,
        target: &RemoteObject,
        member: &str,
        args: &[Value],
    ) -> Result<Value> {
        let values = self.session.encode_call(target.id(), member, args)?;
        let frame = exchange(self.conn, &values, self.session).await?;
        self.session.interpret(&frame, target.id(), member)
    }
}

/// Send one command and read until its response arrives, serving any
/// inbound commands that interleave.
pub(crate) async fn exchange(
    conn: &mut Connection,
    values: &[TaggedValue],
    session: &Arc<SessionState>,
) -> Result<Frame> {
    conn.write_values(values).await?;
    wait_for_response(conn, session).await
}

async fn wait_for_response(conn: &mut Connection, session: &Arc<SessionState>) -> Result<Frame> {
    loop {
        let frame = conn.read_frame().await?;
        match frame.kind()? {
            FrameKind::Return => return Ok(frame),
            FrameKind::Command(code) => {
                match dispatch_inbound(code, &frame, conn, session).await? {
                    Flow::Continue => continue,
                    Flow::Shutdown => {
                        conn.mark_dead();
                        return Err(ObjwireError::ConnectionClosed);
                    }
                }
            }
        }
    }
}

/// Serve inbound commands until the connection closes.
pub(crate) async fn serve(mut conn: Connection, session: Arc<SessionState>) {
    debug!("Serving connection {}", conn.id());
    loop {
        let frame = match conn.read_frame().await {
            Ok(frame) => frame,
            Err(ObjwireError::ConnectionClosed) => {
                debug!("Connection {} closed by peer", conn.id());
                break;
            }
            Err(e) => {
                warn!("Connection {} failed: {}", conn.id(), e);
                break;
            }
        };

        match frame.kind() {
            Ok(FrameKind::Command(code)) => {
                match dispatch_inbound(code, &frame, &mut conn, &session).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Shutdown) => {
                        debug!("Connection {} shut down by peer", conn.id());
                        break;
                    }
                    Err(e) => {
                        warn!("Dispatch failed on connection {}: {}", conn.id(), e);
                        break;
                    }
                }
            }
            Ok(FrameKind::Return) => {
                // A response with nothing awaiting it cannot be matched
                // to a call; drop it rather than kill the connection.
                warn!(
                    "Connection {} sent a response with no outstanding call",
                    conn.id()
                );
            }
            Err(e) => {
                warn!("Connection {} sent a malformed frame: {}", conn.id(), e);
                break;
            }
        }
    }
    debug!("Serve loop for connection {} finished", conn.id());
}

async fn dispatch_inbound(
    code: i32,
    frame: &Frame,
    conn: &mut Connection,
    session: &Arc<SessionState>,
) -> Result<Flow> {
    let command = CommandCode::from_i32(code);

    // Everything except AUTH itself requires authentication.
    if !conn.is_authenticated() && command != Some(CommandCode::Auth) {
        warn!("Connection {} sent a command before authenticating", conn.id());
        conn.write_values(&error_response()).await?;
        return Err(ObjwireError::AuthRejected);
    }

    match command {
        Some(CommandCode::Call) => {
            handle_call(frame, conn, session).await?;
            Ok(Flow::Continue)
        }
        Some(CommandCode::Release) => {
            handle_release(frame, conn, session).await?;
            Ok(Flow::Continue)
        }
        Some(CommandCode::Auth) => handle_auth(frame, conn, session).await,
        Some(CommandCode::Shutdown) => handle_shutdown(frame, conn).await,
        None => {
            // Unknown codes get an error response; the connection lives
            // on so one bad command cannot break an otherwise healthy
            // peer.
            warn!("Unknown command code {} on connection {}", code, conn.id());
            conn.write_values(&error_response()).await?;
            Ok(Flow::Continue)
        }
    }
}

fn parse_call(args: &[TaggedValue]) -> Result<(ObjectId, String)> {
    let target = args
        .first()
        .ok_or_else(|| ObjwireError::Protocol("Call missing its target".to_string()))?;
    if !tag::is_reference(target.tag()) {
        return Err(ObjwireError::Protocol(format!(
            "Call target must be a reference, got tag {}",
            target.tag()
        )));
    }
    let member = args
        .get(1)
        .ok_or_else(|| ObjwireError::Protocol("Call missing its member name".to_string()))?
        .as_str()?
        .to_string();
    Ok((target.as_object_id()?, member))
}

async fn handle_call(
    frame: &Frame,
    conn: &mut Connection,
    session: &Arc<SessionState>,
) -> Result<()> {
    let args = frame.arguments();
    let (target, member) = match parse_call(args) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Malformed call on connection {}: {}", conn.id(), e);
            return conn.write_values(&error_response()).await;
        }
    };

    let object = if target == ENTRY_POINT_OBJECT_ID {
        session.entry_point.clone()
    } else {
        session.registry.get(target).ok()
    };
    let Some(object) = object else {
        debug!(
            "Call to unknown object {} on connection {}",
            target,
            conn.id()
        );
        return conn.write_values(&error_response()).await;
    };

    let call_args = match session.decode_args(&args[2..]) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Undecodable arguments for {}.{}: {}", target, member, e);
            return conn.write_values(&error_response()).await;
        }
    };

    debug!(
        "Dispatching {}.{} on connection {}",
        target,
        member,
        conn.id()
    );
    let ctx = CallContext {
        conn: &mut *conn,
        session,
    };
    let outcome = object.invoke(&member, call_args, ctx).await;

    let response = match outcome {
        Ok(value) => match session.encode_value(&value) {
            Ok(encoded) => success_response(encoded),
            Err(e) => {
                warn!("Unencodable return value from {}.{}: {}", target, member, e);
                exception_response(&TaggedValue::string(&e.to_string()))
            }
        },
        Err(e) => {
            debug!("Invocation {}.{} raised: {}", target, member, e);
            exception_response(&TaggedValue::string(&e.to_string()))
        }
    };
    conn.write_values(&response).await
}

async fn handle_release(
    frame: &Frame,
    conn: &mut Connection,
    session: &Arc<SessionState>,
) -> Result<()> {
    let id = match frame.arguments().first().map(TaggedValue::as_object_id) {
        Some(Ok(id)) => id,
        _ => {
            warn!("Malformed release on connection {}", conn.id());
            return conn.write_values(&error_response()).await;
        }
    };

    // Idempotent: the peer may retry a release it never saw answered.
    if session.registry.remove(id) {
        debug!("Released object {}", id);
    } else {
        debug!("Release of unknown object {} ignored", id);
    }
    conn.write_values(&success_response(TaggedValue::null()))
        .await
}

async fn handle_auth(
    frame: &Frame,
    conn: &mut Connection,
    session: &Arc<SessionState>,
) -> Result<Flow> {
    let presented = frame.arguments().first().and_then(|v| v.as_str().ok());

    match (&session.auth_token, presented) {
        (Some(expected), Some(token)) if token == expected => {
            conn.set_authenticated(true);
            debug!("Connection {} authenticated", conn.id());
            conn.write_values(&success_response(TaggedValue::null()))
                .await?;
            Ok(Flow::Continue)
        }
        (None, _) => {
            // No token required; acknowledge so peers may always auth.
            conn.set_authenticated(true);
            conn.write_values(&success_response(TaggedValue::null()))
                .await?;
            Ok(Flow::Continue)
        }
        _ => {
            warn!("Connection {} failed authentication", conn.id());
            conn.write_values(&error_response()).await?;
            Err(ObjwireError::AuthRejected)
        }
    }
}

async fn handle_shutdown(frame: &Frame, conn: &mut Connection) -> Result<Flow> {
    match frame.arguments().first().map(TaggedValue::as_object_id) {
        Some(Ok(id)) if id == SERVER_OBJECT_ID => {
            conn.write_values(&success_response(TaggedValue::null()))
                .await?;
            Ok(Flow::Shutdown)
        }
        _ => {
            warn!("Shutdown with a bad target on connection {}", conn.id());
            conn.write_values(&error_response()).await?;
            Ok(Flow::Continue)
        }
    }
}

/// Present the auth token on a fresh outbound connection.
pub(crate) async fn authenticate(conn: &mut Connection, token: &str) -> Result<()> {
    conn.write_stream(lazy_command(
        CommandCode::Auth,
        std::iter::once(TaggedValue::string(token)),
    ))
    .await?;

    let frame = conn.read_frame().await?;
    if response_is_success(&frame) {
        conn.set_authenticated(true);
        Ok(())
    } else {
        Err(ObjwireError::AuthRejected)
    }
}
