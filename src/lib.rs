//! Ratewarden - Admission Control Engine
//!
//! This crate decides whether a unit of work may proceed under the
//! consumption-rate policies declared for its target. It resolves the
//! effective policies, derives one accounting key per policy and client,
//! charges tokens atomically against a pluggable token store, and can give
//! a charge back when the host decides the work should not count.

pub mod admission;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod telemetry;
