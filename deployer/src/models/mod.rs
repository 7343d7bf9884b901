//! Data models

pub mod container;
pub mod deployment;
pub mod image;
