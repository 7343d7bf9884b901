//! Deployment directory and configuration storage

pub mod layout;
pub mod settings;
pub mod snapshot;
