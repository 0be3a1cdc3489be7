//! # gopi-rpc: service discovery and RPC for device processes
//!
//! This library lets a process advertise itself as a callable service,
//! discover other services on the local network, and connect to them as a
//! client. Lifecycle and discovery notifications flow over a small
//! publish/subscribe [`EventBus`].
//!
//! ## Key Concepts
//!
//! - **[`Discovery`]**: registers [`ServiceRecord`]s and browses for them through a
//!   pluggable [`DiscoveryBackend`] (multicast DNS via `mdns-sd`, or an
//!   in-process registry). Every observation becomes a
//!   `ServiceRecordChanged` event; a record with a zero TTL is a withdrawal.
//!
//! - **[`Server`]**: hosts [`Module`]s, each a table of typed handlers, and
//!   serves them until stopped. `stop(false)` drains in-flight calls,
//!   `stop(true)` abandons them.
//!
//! - **[`ClientConnection`]**: one session to a server. Lists the remote's
//!   services and builds typed [`ServiceProxy`] clients.
//!
//! - **[`ClientPool`]**: follows a discovery's events and connects to a known
//!   service that matches the requested [`TransportFlags`].
//!
//! ## Quickstart Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gopi_rpc::{
//!     ClientConnection, ClientPool, Discovery, Driver, Module, RpcConfig, Server,
//!     ServiceProxy, TransportFlags,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! struct Greeter(ClientConnection);
//!
//! impl ServiceProxy for Greeter {
//!     const SERVICE: &'static str = "helloworld";
//!     fn bind(conn: ClientConnection) -> Self {
//!         Greeter(conn)
//!     }
//! }
//!
//! # async fn run() -> gopi_rpc::Result<()> {
//! let config = RpcConfig::load("rpc.toml")?;
//! let discovery = Arc::new(Discovery::new(&config)?);
//!
//! // Serve a module and advertise it.
//! let server = Arc::new(Server::new(config.server.clone(), config.events.capacity)?);
//! server.register(Module::new("helloworld")?.method("say_hello", |name: String| async move {
//!     Ok(format!("Hello, {name}"))
//! })?)?;
//! let serving = tokio::spawn({
//!     let server = server.clone();
//!     async move { server.start().await }
//! });
//! # tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//! discovery.register(&server.service("gopi", ["v=1"])?).await?;
//!
//! // Browse and connect.
//! let pool = ClientPool::new(discovery.clone(), "gopi", config.client.clone()).await?;
//! let cancel = CancellationToken::new();
//! tokio::spawn({
//!     let discovery = discovery.clone();
//!     let cancel = cancel.clone();
//!     async move { discovery.browse(cancel, "gopi").await }
//! });
//! # tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//! let conn = pool.connect(TransportFlags::NONE).await?;
//! let greeter: Greeter = conn.new_service()?;
//! let reply: String = greeter.0.call("helloworld", "say_hello", "world").await?;
//!
//! cancel.cancel();
//! server.stop(false).await?;
//! # let _ = (serving, reply);
//! pool.close().await?;
//! discovery.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod events;
pub mod models;
pub mod module;
pub mod pool;
pub mod protocol;
pub mod server;
mod utils;

// Re-export public-facing components.
pub use client::{ClientConnection, ServiceProxy};
pub use config::{BackendKind, ClientConfig, DiscoveryConfig, EventsConfig, RpcConfig, ServerConfig};
pub use discovery::{Discovery, DiscoveryBackend, MdnsBackend, MemoryBackend, RecordStream};
pub use driver::Driver;
pub use error::{Result, RpcError};
pub use events::{EventBus, Publisher, SubscriberId, Subscription};
pub use models::{
    Event, EventType, ServiceRecord, ServiceType, TransportFlags, rpc_service_type,
    validate_service_name,
};
pub use module::Module;
pub use pool::{ClientPool, Endpoint};
pub use server::{Server, ServerState};
