//! Upserts extracted DTC data into the normalized knowledge graph, scoring
//! and merging candidate entities before they land in the `knowledge_*`
//! tables the rest of the control plane reads from.

pub mod upserter;
pub mod vehicle_linker;

pub use upserter::{upsert_dtc_knowledge, UpsertStats};
pub use vehicle_linker::link_vehicles_for_document;
