//! Shared data model and wire types for the flychat server crates.

pub mod api;
pub mod events;
pub mod models;
