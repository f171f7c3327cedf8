//! Network Module
//!
//! HTTP transport for the replication protocol: an axum server exposing
//! the two replication paths plus a JSON status page, and a reqwest client
//! implementing `Transport`.

mod server;
mod client;

pub use server::{ReplicationServer, StatusResponse};
pub use client::HttpTransport;

/// Compare secrets without early exit
pub(crate) fn secrets_match(given: &str, expected: &str) -> bool {
    given.len() == expected.len()
        && given
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
