pub mod attempts;
pub mod augmentation;
pub mod chat;
pub mod cli;
pub mod compose;
pub mod config;
pub mod doctor;
pub mod error;
pub mod eval;
pub mod evaluator;
pub mod finalize;
pub mod intent;
pub mod policy;
pub mod profiles;
pub mod provider;
pub mod reformulate;
pub mod request;
pub mod responders;
pub mod retrieval;
pub mod safety;
pub mod server;
pub mod telemetry;
pub mod tracker;
pub mod workflow;

#[cfg(test)]
mod tests;
