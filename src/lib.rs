//! Voice conversation client.
//!
//! Streams microphone audio to a conversation server over a persistent
//! websocket and plays back the synthesized replies, with barge-in and
//! dual-path (immediate + final) responses. [`session::SessionHandle`] is the
//! entry point.

pub mod audio;
pub mod conversation;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod transport;
pub mod usage;
pub mod watchdog;
