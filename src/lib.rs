//! Arena match core: replicated state, sessions, entities, damage and the round loop

pub mod app;
pub mod config;
pub mod game;
pub mod http;
pub mod replication;
pub mod session;
pub mod util;
pub mod ws;
