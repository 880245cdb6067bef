//! The HTTP + WebSocket control plane.

pub mod dto;
pub mod http;
pub mod state;
pub mod ws;

pub use state::AppState;
