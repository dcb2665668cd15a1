//! One-time download object store.
//!
//! A producer uploads a payload and gets back a single reference; the first
//! consumer to redeem it within the retention window receives the bytes and
//! the object is destroyed. Unredeemed objects are reclaimed by a background
//! sweep.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
