//! Test harness: a raw-frame WebSocket client and a spawnable server.
#![allow(dead_code)]

pub mod client;
pub mod server;

pub use client::TestClient;
pub use server::TestServer;
