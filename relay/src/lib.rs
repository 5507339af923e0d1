//! Local relay between canvas boards and workspace processes.
//!
//! One process per machine wins the well-known port and serves the hub;
//! every other process connects to it as a workspace client. See
//! [`node`] for how a process moves between those roles.

pub mod client;
pub mod config;
pub mod discovery;
pub mod hub;
pub mod node;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;

#[cfg(test)]
mod test_support;
