//! WebSocket transport: one connection per participant

pub mod handler;
pub mod protocol;
