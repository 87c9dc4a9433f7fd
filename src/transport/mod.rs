//! Transport layer implementations
//!
//! This module contains transport-level implementations for various protocols.

pub mod client_ws;
pub mod websocket;
pub mod ws_adapter;

// Re-exports
pub use client_ws::ClientWsStream;
pub use websocket::*;
pub use ws_adapter::AxumWsStream;
