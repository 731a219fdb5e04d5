//! Quotagate - Multi-scope Rate Limiting Engine
//!
//! This crate decides whether a request may proceed by counting it against
//! fixed-window limits in four independent scopes: global, per user, per API
//! key and per client address. Routes declare their policies once at
//! startup; every request then resolves those policies against its
//! identities and is admitted or denied with accurate remaining quota and
//! reset times.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{QuotaError, Result};
