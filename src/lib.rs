//! # objwire
//!
//! Bidirectional object bridge between two processes over TCP.
//!
//! Each side exposes live objects and invokes members on the other
//! side's objects through reference handles, over a tagged binary
//! protocol. Callbacks are reentrant: while a call awaits its response,
//! the peer may call back into local objects over the same connection.
//! Dropped remote handles are released on the owning side through a
//! background finalizer (distributed GC).
//!
//! ## Architecture
//!
//! - **Wire**: tagged values (`i16` tag + shape-dependent payload),
//!   END-delimited frames, Big Endian throughout
//! - **Codec**: pluggable encoder/decoder registries mapping [`Value`]
//!   to and from the wire, extensible via negative tags
//! - **Dispatch**: per-connection serve loop; inbound calls resolve in
//!   the local object registry and run with a [`CallContext`]
//! - **Lifecycle**: [`GatewayBuilder`] wires codec, finalizer, client
//!   and callback listener together
//!
//! ## Example
//!
//! ```ignore
//! use objwire::{Gateway, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::builder()
//!         .address("127.0.0.1:25333")
//!         .start()
//!         .await?;
//!
//!     let entry = gateway.entry_point();
//!     let greeting = gateway.invoke(&entry, "greet", &[]).await?;
//!     println!("{:?}", greeting);
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod finalizer;
pub mod object;
pub mod protocol;
pub mod registry;
pub mod session;

mod dispatch;
mod gateway;

pub use codec::{Codec, Extension, Value, ValueKind};
pub use config::{GatewayConfig, Mode, TlsClient};
pub use dispatch::CallContext;
pub use error::{ObjwireError, Result};
pub use gateway::{Caller, Gateway, GatewayBuilder};
pub use object::{BoxFuture, LocalProxy, ProxyObject, RemoteObject};
