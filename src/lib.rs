//! Tollgate - Distributed Token-Bucket Rate Limiting
//!
//! This crate answers one question for a request pipeline: may this caller
//! proceed? Callers are partitioned by authenticated identity, falling back to
//! remote address, and each partition gets a token bucket kept in a shared
//! state store so that any number of stateless service instances enforce the
//! same quota.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
