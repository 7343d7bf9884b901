//! Bot service deployer library
//!
//! Replaces the running bot container on a single host with a new image,
//! escalating teardown as needed and rolling back once on failure.

pub mod app;
pub mod authn;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod storage;
pub mod utils;
