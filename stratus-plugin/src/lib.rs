//! Stratus plugin library
//!
//! The executor and its building blocks, exported for the binary and for
//! tests.

pub mod adapter;
pub mod api;
pub mod config;
pub mod executor;
pub mod hydrate;
pub mod registry;
pub mod rows;
