//! Storage core: chunk store, catalog, lifecycle policy and the pipelines
//! built on top of them.

pub mod catalog;
pub mod chunk_store;
pub mod clock;
pub mod delivery;
pub mod ingest;
pub mod lifecycle;
pub mod storage_service;
pub mod sweeper;
