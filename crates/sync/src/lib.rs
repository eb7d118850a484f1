//! Packline Sync - Order ledger and conversation sync over a document store.
//!
//! Customers, account managers and staff share orders and chats through an
//! external document store. This crate is the client-side layer on top of it:
//! typed entities, validated writes, and live projections that stay in step
//! with the store's change streams.
//!
//! # Architecture
//!
//! Every backend is injected as a trait object:
//!
//! - [`store::DocumentStore`] - documents, queries, atomic batches and change
//!   subscriptions
//! - [`auth::AuthProvider`] - the signed-in identity
//! - [`blob::BlobStorage`] - attachment and media uploads
//! - [`services::PushSender`] - push platform delivery
//!
//! Each has an in-process implementation (`MemoryStore`, `MemoryAuth`,
//! `MemoryBlobStorage`, `RecordingPushSender`) used by the tests.
//!
//! # Modules
//!
//! - [`models`] - Users, orders, chats and their document encoding
//! - [`services`] - Order ledger, conversation registry, sync coordinator,
//!   user directory, notifications and search
//! - [`config`] - Environment configuration
//! - [`state`] - [`SyncState`], every service built from one [`SyncConfig`]
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - [`SyncError`] and [`SyncResult`]

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod auth;
pub mod blob;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod state;
pub mod store;
pub mod telemetry;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use services::{
    Actor, ConversationRegistry, NotificationDispatcher, OrderLedger, PushRelay, SyncCoordinator,
    UserDirectory,
};
pub use state::{Backends, SyncState};
pub use store::{DocumentStore, MemoryStore};
