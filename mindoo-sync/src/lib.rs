//! # Mindoo Sync
//!
//! Anti-entropy sync protocol for MindooDB: a REST server over a hosted
//! tenant, a retrying client, and the challenge/response + JWT auth layer
//! between them.
//!
//! The server never sees plaintext documents: entries arrive and leave as
//! the originating client sealed them, and on egress each entry's
//! ciphertext is additionally wrapped to the caller's RSA key. Pushed
//! entries are accepted only when the directory trusts the author's
//! signing key.

#![deny(unsafe_code)]

pub mod auth;
pub mod client;
pub mod error;
pub mod server;
pub mod wire;

pub use auth::{ChallengeStore, DEFAULT_CHALLENGE_TTL, DEFAULT_TOKEN_TTL};
pub use client::{RemoteStore, SyncClient, SyncClientConfig};
pub use error::SyncError;
pub use server::{router, serve, AuthedUser, ServerConfig, ServerState};
pub use wire::{NetworkEncryptedEntry, NetworkSyncCapabilities};
