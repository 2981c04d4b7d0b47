//! Client library for the Parley chat relay.
//!
//! Connects over plain TCP, registers a user name, and exposes the
//! relay's operations as async methods, plus a receiver for chats the
//! relay pushes at any time.

mod client;

pub use client::{Client, ClientError, IncomingChat};
