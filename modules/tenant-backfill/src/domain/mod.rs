pub mod constraints;
pub mod engine;
pub mod error;
pub mod executor;
pub mod mapping;
pub mod partition;
pub mod preflight;
pub mod registry;
pub mod report;
pub mod snapshot;
pub mod sql;
pub mod stats;
pub mod validator;

#[cfg(test)]
mod constraints_test;
