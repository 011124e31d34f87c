pub mod agents;
pub mod auth;
pub mod chat;
pub mod cli;
pub mod config;
pub mod doctor;
pub mod error;
pub mod llm;
pub mod planner;
pub mod plans;
pub mod profiles;
pub mod server;
pub mod session;
pub mod streaming;
pub mod telemetry;
pub mod tools;

#[cfg(test)]
mod tests;
