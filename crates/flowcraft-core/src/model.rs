//! Diagram data model shared by local stores and the replicated document.
//!
//! Nodes and edges live in [`DiagramState`] as `Rc`s. The binding engine treats
//! a changed `Rc` pointer as "this entity was updated", so every mutation helper
//! here replaces the `Rc` of the entity it touches and leaves the others alone.

use kurbo::{Point, Size};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::rc::Rc;

use crate::crdt::ContainerKey;

/// Ordered JSON object used for free-form entity data.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Node kind used when a remote entity carries none.
pub const DEFAULT_NODE_KIND: &str = "default";
/// Edge kind used when a remote entity carries none.
pub const DEFAULT_EDGE_KIND: &str = "default";

/// A node on the diagram canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub position: Point,
    #[serde(default)]
    pub data: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
}

impl DiagramNode {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, position: Point) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            position,
            data: JsonMap::new(),
            measured: None,
            parent_id: None,
            extent: None,
            style: None,
            hidden: false,
        }
    }

    /// Builder-style helper to set one data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// A connection between two nodes. Endpoints are not validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramEdge {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_start: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_end: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub animated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub data: JsonMap,
}

impl DiagramEdge {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: DEFAULT_EDGE_KIND.to_string(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            marker_start: None,
            marker_end: None,
            style: None,
            animated: false,
            label: None,
            data: JsonMap::new(),
        }
    }
}

/// Anything stored in an id-keyed document collection.
pub trait Entity: Clone + PartialEq {
    fn id(&self) -> &str;
}

impl Entity for DiagramNode {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for DiagramEdge {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Snapshot of the primary store: the node and edge collections.
#[derive(Debug, Clone, Default)]
pub struct DiagramState {
    pub nodes: Vec<Rc<DiagramNode>>,
    pub edges: Vec<Rc<DiagramEdge>>,
}

impl DiagramState {
    pub fn new(nodes: Vec<DiagramNode>, edges: Vec<DiagramEdge>) -> Self {
        Self {
            nodes: nodes.into_iter().map(Rc::new).collect(),
            edges: edges.into_iter().map(Rc::new).collect(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&DiagramNode> {
        self.nodes.iter().find(|n| n.id == id).map(Rc::as_ref)
    }

    pub fn edge(&self, id: &str) -> Option<&DiagramEdge> {
        self.edges.iter().find(|e| e.id == id).map(Rc::as_ref)
    }

    /// Insert a node, or replace the node with the same id.
    pub fn upsert_node(&mut self, node: DiagramNode) {
        upsert(&mut self.nodes, node);
    }

    /// Insert an edge, or replace the edge with the same id.
    pub fn upsert_edge(&mut self, edge: DiagramEdge) {
        upsert(&mut self.edges, edge);
    }

    /// Apply `f` to a copy of the node and store the copy under a fresh `Rc`.
    /// Returns false if no node has that id.
    pub fn update_node(&mut self, id: &str, f: impl FnOnce(&mut DiagramNode)) -> bool {
        update(&mut self.nodes, id, f)
    }

    pub fn update_edge(&mut self, id: &str, f: impl FnOnce(&mut DiagramEdge)) -> bool {
        update(&mut self.edges, id, f)
    }

    pub fn move_node(&mut self, id: &str, position: Point) -> bool {
        self.update_node(id, |node| node.position = position)
    }

    pub fn remove_node(&mut self, id: &str) -> Option<DiagramNode> {
        remove(&mut self.nodes, id)
    }

    pub fn remove_edge(&mut self, id: &str) -> Option<DiagramEdge> {
        remove(&mut self.edges, id)
    }
}

fn upsert<T: Entity>(items: &mut Vec<Rc<T>>, item: T) {
    match items.iter().position(|existing| existing.id() == item.id()) {
        Some(index) => items[index] = Rc::new(item),
        None => items.push(Rc::new(item)),
    }
}

fn update<T: Entity>(items: &mut [Rc<T>], id: &str, f: impl FnOnce(&mut T)) -> bool {
    match items.iter().position(|existing| existing.id() == id) {
        Some(index) => {
            let mut copy = T::clone(&items[index]);
            f(&mut copy);
            items[index] = Rc::new(copy);
            true
        }
        None => false,
    }
}

fn remove<T: Entity>(items: &mut Vec<Rc<T>>, id: &str) -> Option<T> {
    let index = items.iter().position(|existing| existing.id() == id)?;
    let removed = items.remove(index);
    Some(Rc::try_unwrap(removed).unwrap_or_else(|shared| T::clone(&shared)))
}

// --- Auxiliary documents ---

/// A small fixed-shape document replicated field by field into its own
/// container. Each top-level serialized field is one container entry.
pub trait AuxDocument: Clone + Default + PartialEq + Serialize + DeserializeOwned + 'static {
    const CONTAINER: ContainerKey;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneOrientation {
    #[default]
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lane {
    pub id: String,
    pub label: String,
    pub color: String,
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwimlaneSettings {
    pub enabled: bool,
    pub orientation: LaneOrientation,
    pub header_size: f64,
    pub lanes: Vec<Lane>,
}

impl Default for SwimlaneSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            orientation: LaneOrientation::Horizontal,
            header_size: 40.0,
            lanes: Vec::new(),
        }
    }
}

impl AuxDocument for SwimlaneSettings {
    const CONTAINER: ContainerKey = ContainerKey::Swimlanes;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegendItem {
    pub id: String,
    pub label: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegendSettings {
    pub visible: bool,
    pub title: String,
    pub position: Point,
    pub items: Vec<LegendItem>,
}

impl Default for LegendSettings {
    fn default() -> Self {
        Self {
            visible: false,
            title: "Legend".to_string(),
            position: Point::new(20.0, 20.0),
            items: Vec::new(),
        }
    }
}

impl AuxDocument for LegendSettings {
    const CONTAINER: ContainerKey = ContainerKey::Legends;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Banner {
    pub text: String,
    pub background: String,
    pub color: String,
    pub height: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BannerSettings {
    pub top: Option<Banner>,
    pub bottom: Option<Banner>,
}

impl AuxDocument for BannerSettings {
    const CONTAINER: ContainerKey = ContainerKey::Banners;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    pub name: String,
    pub visible: bool,
    pub locked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerSettings {
    pub layers: Vec<Layer>,
    pub active_layer: Option<String>,
}

impl AuxDocument for LayerSettings {
    const CONTAINER: ContainerKey = ContainerKey::Layers;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleSettings {
    pub active_style: String,
    pub dark_mode: bool,
}

impl Default for StyleSettings {
    fn default() -> Self {
        Self {
            active_style: "clean".to_string(),
            dark_mode: false,
        }
    }
}

impl AuxDocument for StyleSettings {
    const CONTAINER: ContainerKey = ContainerKey::Styles;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagramMeta {
    pub title: String,
    pub schema_version: u32,
}

impl Default for DiagramMeta {
    fn default() -> Self {
        Self {
            title: "Untitled diagram".to_string(),
            schema_version: 1,
        }
    }
}

impl AuxDocument for DiagramMeta {
    const CONTAINER: ContainerKey = ContainerKey::Meta;
}
