//! Wire types for the tiller RPC protocol.
//!
//! This crate contains the serde-serializable types that travel between the
//! client connection and the dispatcher over the framed byte stream. These
//! types represent the "protocol layer" - the shapes of data as they appear
//! on the wire.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization
//! - **1:1 with the wire**: Match the framed JSON messages exactly
//! - **Stable**: Changes only when the wire protocol changes
//!
//! The transport, connection, and dispatcher machinery lives in
//! `tiller-runtime`; generated per-interface types come out of
//! `tiller-schema`.

pub mod binary;
pub mod message;

pub use binary::Binary;
pub use message::*;
