//! Test Helper Utilities
//!
//! Shared seeding utilities for rcp-coding integration tests

#![allow(dead_code, unused_imports)]

pub mod db_utils;

pub use db_utils::{
    add_booklet, add_coding, add_response, add_response_with_id, add_unit, create_test_db,
    load, manual_response, set_triad, test_state, CodingSeed,
};
