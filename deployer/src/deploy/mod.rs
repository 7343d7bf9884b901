//! Deployment module

pub mod docker;
pub mod fsm;
pub mod health;
pub mod launcher;
pub mod rollback;
pub mod runtime;
pub mod terminator;
