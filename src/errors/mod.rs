//! Error types for the resilience fabric.
//!
//! This module provides the typed rejection taxonomy surfaced by every
//! layer of the fabric, plus helpers for retryability classification.

mod error;

pub use error::{FabricError, FabricResult, ProviderFailure, RejectionReason};
