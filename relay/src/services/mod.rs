//! Domain services used by the websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own board links, listener fan-out and persistence so
//! route handlers can stay focused on protocol translation.

pub mod connections;
pub mod snapshot;
pub mod workspace;
