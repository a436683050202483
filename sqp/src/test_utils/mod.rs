//! Doubles and fixtures shared by unit and integration tests.

pub mod channel;
pub mod client;
pub mod pipeline;
pub mod steps;
