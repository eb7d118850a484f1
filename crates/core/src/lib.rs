//! Packline Core - Shared domain types.
//!
//! This crate provides the types shared by every Packline component:
//! - `sync` - Order ledger, conversation registry and sync coordinator
//! - `integration-tests` - Scenario tests against the in-memory backends
//!
//! # Architecture
//!
//! The core crate contains only types and pure policy - no I/O, no store
//! access, no async runtime. This keeps it lightweight and allows it to be
//! used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for ids, emails, money, statuses, roles and
//!   customer references

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
