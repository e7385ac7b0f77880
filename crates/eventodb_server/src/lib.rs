//! EventoDB's HTTP surface and binary.
//!
//! `POST /rpc` dispatches the positional JSON-RPC methods, `GET /subscribe`
//! streams SSE pokes, `POST /import` ingests NDJSON into an empty
//! namespace. The [`pubsub::Hub`] fans write events out to subscribers;
//! [`server::build_state`] wires a configured storage backend, migrations
//! and the default namespace together before the listener opens.

pub mod auth;
pub mod cli;
pub mod config;
pub mod import;
pub mod pubsub;
pub mod rpc;
pub mod server;
pub mod subscribe;
