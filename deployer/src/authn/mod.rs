//! Authentication

pub mod registry;
