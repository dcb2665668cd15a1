//! Core data models for the one-time object store.
//!
//! `ObjectEntry` is the catalog record; `ObjectId` is both its key and the
//! reference handed to consumers.

pub mod object;
