//! CRDT integration using Loro for collaborative diagram editing.
//!
//! This module provides the replicated document that every peer in a room
//! holds a copy of.
//!
//! # Schema
//!
//! ```text
//! LoroDoc
//! ├── "nodes": LoroMap<NodeId, LoroMap>
//! │     └── { id, type, position: LoroMap{x, y}, data: LoroMap, measured?, parent_id?, extent?, style?, hidden? }
//! ├── "edges": LoroMap<EdgeId, LoroMap>
//! │     └── { id, type, source, target, source_handle?, target_handle?, marker_start?, marker_end?, style?, animated?, label?, data: LoroMap }
//! ├── "swimlanes" | "legends" | "banners" | "layers" | "styles" | "meta": LoroMap<field, value>
//! ```
//!
//! Position and data are nested maps so concurrent edits to different keys of
//! the same node merge instead of overwriting each other.

mod convert;
mod schema;

pub use convert::{
    edge_from_loro, edge_scalar_fields, entity_map, json_to_loro, loro_to_json, node_from_loro,
    node_scalar_fields, write_data_diff, write_edge, write_node, write_position, write_scalar,
};
pub use schema::{
    ContainerKey, CrdtDocument, DocumentEvent, ObserverId, Transaction, UpdateOrigin,
};

pub use loro::VersionVector;
