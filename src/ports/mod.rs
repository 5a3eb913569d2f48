//! Ports (traits) decoupling the core from external collaborators.

pub mod http_client;
pub mod registry;
pub mod token_checker;
