//! Core types for Packline.
//!
//! This module provides type-safe wrappers for common domain concepts.

pub mod customer;
pub mod email;
pub mod id;
pub mod money;
pub mod role;
pub mod status;

pub use customer::{CustomerKeys, CustomerRef};
pub use email::{Email, EmailError};
pub use id::*;
pub use money::Money;
pub use role::{Permission, UserRole};
pub use status::*;
