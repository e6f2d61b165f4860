//! Wire transport for the store protocol.
//!
//! One physical binding: length-prefixed JSON frames over localhost TCP.
//! The protocol logic (correlation, phases, retry) never leaks into the
//! framing, so a different binding only has to replace this module.
//!
//! # Architecture
//!
//! - **Server**: accepts connections, dispatches decoded requests to a local
//!   store controller, long-polls phase fetches
//! - **Client**: reproduces the store controller surface, one connection per
//!   request
//! - **Protocol**: shared framing and message types used by both

pub mod client;
pub mod protocol;
pub mod server;

pub use client::StoreClient;
pub use protocol::{Reply, ReplyError, Request, RequestPackageReply};
pub use server::{StoreServer, StoreServerHandle};
