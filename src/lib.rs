//! Turnstile - Distributed Admission Control
//!
//! This crate decides, per request, whether a caller may proceed within a
//! fixed-window quota. Counts are shared across processes through an atomic
//! counter store; when that store is unreachable, decisions degrade to an
//! in-process counter instead of failing.

pub mod config;
pub mod error;
pub mod ratelimit;
