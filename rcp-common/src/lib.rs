//! # RCP Common Library
//!
//! Shared code for the response coding pipeline crates including:
//! - Status code table and response models (v1/v2/v3 coding triads)
//! - SQLite schema initialization and workspace settings
//! - Cache collaborator with pattern invalidation
//! - Event bus and job context (progress reporting, cooperative cancellation)
//! - Configuration loading

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod job;
pub mod models;
pub mod status;

pub use error::{DbContext, Error, Result};
pub use job::{JobContext, JobOutcome};
pub use models::{CodingTriad, CodingVersion, MatchingFlag, MatchingFlags, Response};
pub use status::StatusCode;
