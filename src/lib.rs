//! # trpc
//!
//! Minimal multiplexed RPC runtime over a single stream connection.
//!
//! A client opens a connection, announces its options (magic number, codec,
//! timeouts) in a one-line JSON handshake, and then issues any number of
//! concurrent calls. Each call is a header/body frame pair encoded with the
//! negotiated codec; responses are matched to calls by sequence number and
//! may arrive in any order.
//!
//! ## Architecture
//!
//! - **Handshake**: JSON option record terminated by `\n`
//! - **Frames**: length-prefixed header and body, MsgPack (default) or JSON
//! - **Client**: pending-call table plus one background receive task
//! - **Server**: per-connection read loop, bounded handler tasks, one writer
//!   task per connection
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use tokio::net::TcpListener;
//! use trpc::{Client, Options, Server, ServiceBuilder};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! struct Foo;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let foo = ServiceBuilder::new("Foo", Foo)
//!         .method("Sum", |_foo: Arc<Foo>, args: Args| async move {
//!             Ok::<_, String>(args.num1 + args.num2)
//!         })
//!         .build()?;
//!     let server = Server::builder().register(foo)?.build();
//!
//!     let listener = TcpListener::bind("127.0.0.1:0").await?;
//!     let addr = listener.local_addr()?;
//!     tokio::spawn(async move { server.accept(listener).await });
//!
//!     let client = Client::dial(addr, Options::default()).await?;
//!     let sum: i64 = client.call("Foo.Sum", &Args { num1: 2, num2: 3 }).await?;
//!     assert_eq!(sum, 5);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod http;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod writer;

mod client;
mod server;

pub use client::{completion_queue, AsyncCall, Call, Client, DEFAULT_COMPLETION_CAPACITY};
pub use codec::CodecType;
pub use error::{Result, RpcError};
pub use protocol::Options;
pub use server::{Server, ServerBuilder, DEFAULT_MAX_CONCURRENT_REQUESTS};
pub use service::{MethodType, Service, ServiceBuilder, ServiceRegistry};
