//! Tiller runtime - framed transport, connection mirror, and dispatcher.
//!
//! This crate is the runtime half of the RPC stack (the schema tooling
//! lives in `tiller-schema`):
//!
//! - **Transport**: length-prefixed JSON framing over any byte stream
//! - **Connection**: client-side request correlation and a local proxy
//!   tree mirroring the server's objects
//! - **Dispatcher**: server-side object tree, handler routing, and
//!   lifecycle notifications
//! - **Sessions**: named subtree roots multiplexed over one transport
//!
//! # Architecture
//!
//! ```text
//!  client process                      server process
//! ┌──────────────┐                  ┌────────────────────┐
//! │ proxies      │                  │ handlers           │
//! │ (RemoteObject│                  │ (HandlerRegistry)  │
//! │  + Channel)  │                  │                    │
//! ├──────────────┤   length-framed  ├────────────────────┤
//! │ Connection   │◄────JSON frames──►DispatcherConnection│
//! ├──────────────┤                  ├────────────────────┤
//! │ PipeTransport│                  │ PipeTransport      │
//! └──────────────┘                  └────────────────────┘
//! ```
//!
//! Both ends pump messages serially off their transport; handlers and
//! pending calls run as independent tasks so one slow command never stalls
//! decoding.

pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod remote_object;
pub mod session;
pub mod transport;

// Re-export key types at crate root
pub use channel::Channel;
pub use connection::{Connection, ConnectionLike, ObjectFactory, ObjectStore};
pub use dispatcher::{
    DispatcherConnection, Handler, HandlerCall, HandlerFuture, HandlerRegistry, MethodCatalog,
    ROOT_GUID,
};
pub use error::{Error, Result};
pub use remote_object::{DisposeReason, Parent, RemoteObject, RemoteObjectCore};
pub use session::Session;
pub use transport::{
    Endianness, FrameDecoder, MAX_FRAME_BYTES, PipeTransport, PipeTransportReceiver,
    PipeTransportSender, Transport, TransportParts, TransportReceiver, encode_frame, loopback,
};
