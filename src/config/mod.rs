//! # Pagoda Configuration Module
//!
//! Centralizes every numeric constant of the on-disk format and the cache.
//! Interdependent values are documented and enforced through compile-time
//! assertions in [`constants`]; import from here rather than redefining
//! values locally.

pub mod constants;

pub use constants::*;
