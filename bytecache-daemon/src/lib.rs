//! bytecache daemon library
//!
//! This module exports the internal components of the daemon for testing purposes.

pub mod cache;
pub mod config;
pub mod repository;
pub mod scheduler;
