//! Kiln - incremental build daemon
//!
//! Rules compute immutable [`value::Value`]s through a continuation-based
//! result algebra. Results are cached by an object id hash of rule name and
//! arguments, so unchanged inputs are never rebuilt. A per-project daemon
//! keeps the cache and target graph warm and serves clients over a Unix socket.

pub mod action;
pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod eval;
pub mod events;
pub mod ipc;
pub mod manifest;
pub mod plugins;
pub mod repo;
pub mod rule;
pub mod value;
