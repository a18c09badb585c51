//! Conversion between diagram entities and Loro values.

use kurbo::{Point, Size};
use loro::{Container, LoroMap, LoroMapValue, LoroValue, ValueOrContainer};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::DocumentResult;
use crate::model::{DEFAULT_EDGE_KIND, DEFAULT_NODE_KIND, DiagramEdge, DiagramNode, JsonMap};

// Common keys
const KEY_ID: &str = "id";
const KEY_TYPE: &str = "type";
const KEY_POSITION: &str = "position";
const KEY_DATA: &str = "data";
const KEY_STYLE: &str = "style";

// Point keys
const KEY_X: &str = "x";
const KEY_Y: &str = "y";

// Node keys
const KEY_MEASURED: &str = "measured";
const KEY_PARENT_ID: &str = "parent_id";
const KEY_EXTENT: &str = "extent";
const KEY_HIDDEN: &str = "hidden";

// Edge keys
const KEY_SOURCE: &str = "source";
const KEY_TARGET: &str = "target";
const KEY_SOURCE_HANDLE: &str = "source_handle";
const KEY_TARGET_HANDLE: &str = "target_handle";
const KEY_MARKER_START: &str = "marker_start";
const KEY_MARKER_END: &str = "marker_end";
const KEY_ANIMATED: &str = "animated";
const KEY_LABEL: &str = "label";

// Helper functions to extract values from LoroMapValue (derefs to HashMap<String, LoroValue>)
fn get_double(map: &LoroMapValue, key: &str) -> Option<f64> {
    match map.get(key)? {
        LoroValue::Double(d) => Some(*d),
        LoroValue::I64(i) => Some(*i as f64),
        _ => None,
    }
}

fn get_string(map: &LoroMapValue, key: &str) -> Option<String> {
    match map.get(key)? {
        LoroValue::String(s) => Some(s.to_string()),
        _ => None,
    }
}

fn get_bool(map: &LoroMapValue, key: &str) -> bool {
    matches!(map.get(key), Some(LoroValue::Bool(true)))
}

fn get_json(map: &LoroMapValue, key: &str) -> Option<Value> {
    match map.get(key)? {
        LoroValue::Null => None,
        value => Some(loro_to_json(value)),
    }
}

fn get_object(map: &LoroMapValue, key: &str) -> Option<JsonMap> {
    match get_json(map, key)? {
        Value::Object(object) => Some(object),
        _ => None,
    }
}

/// Convert a JSON value into a plain (non-container) Loro value.
pub fn json_to_loro(value: &Value) -> LoroValue {
    match value {
        Value::Null => LoroValue::Null,
        Value::Bool(b) => LoroValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => LoroValue::I64(i),
            None => LoroValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => LoroValue::from(s.as_str()),
        Value::Array(items) => {
            LoroValue::from(items.iter().map(json_to_loro).collect::<Vec<LoroValue>>())
        }
        Value::Object(object) => LoroValue::from(
            object
                .iter()
                .map(|(k, v)| (k.clone(), json_to_loro(v)))
                .collect::<HashMap<String, LoroValue>>(),
        ),
    }
}

/// Convert a Loro value back to JSON. Object keys come out sorted.
pub fn loro_to_json(value: &LoroValue) -> Value {
    match value {
        LoroValue::Null => Value::Null,
        LoroValue::Bool(b) => Value::Bool(*b),
        LoroValue::Double(d) => serde_json::Number::from_f64(*d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        LoroValue::I64(i) => Value::from(*i),
        LoroValue::String(s) => Value::String(s.to_string()),
        LoroValue::List(items) => Value::Array(items.iter().map(loro_to_json).collect()),
        LoroValue::Map(map) => {
            let mut entries: Vec<(&String, &LoroValue)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), loro_to_json(v)))
                    .collect(),
            )
        }
        _ => Value::Null,
    }
}

fn size_to_json(size: Size) -> Value {
    serde_json::json!({ "width": size.width, "height": size.height })
}

fn size_from_json(value: &Value) -> Option<Size> {
    Some(Size::new(value.get("width")?.as_f64()?, value.get("height")?.as_f64()?))
}

/// Get a nested map, creating it when missing or when a peer stored a plain value there.
fn child_map(parent: &LoroMap, key: &str) -> DocumentResult<LoroMap> {
    if let Some(ValueOrContainer::Container(Container::Map(map))) = parent.get(key) {
        return Ok(map);
    }
    Ok(parent.insert_container(key, LoroMap::new())?)
}

/// Existing entity map stored under `id`, if any.
pub fn entity_map(collection: &LoroMap, id: &str) -> Option<LoroMap> {
    match collection.get(id)? {
        ValueOrContainer::Container(Container::Map(map)) => Some(map),
        _ => None,
    }
}

/// Scalar fields of a node compared one by one on update. `None` means absent.
pub fn node_scalar_fields(node: &DiagramNode) -> Vec<(&'static str, Option<Value>)> {
    vec![
        (KEY_TYPE, Some(Value::String(node.kind.clone()))),
        (KEY_MEASURED, node.measured.map(size_to_json)),
        (KEY_PARENT_ID, node.parent_id.clone().map(Value::String)),
        (KEY_EXTENT, node.extent.clone().map(Value::String)),
        (KEY_STYLE, node.style.clone().map(Value::Object)),
        (KEY_HIDDEN, node.hidden.then_some(Value::Bool(true))),
    ]
}

/// Scalar fields of an edge compared one by one on update.
pub fn edge_scalar_fields(edge: &DiagramEdge) -> Vec<(&'static str, Option<Value>)> {
    vec![
        (KEY_TYPE, Some(Value::String(edge.kind.clone()))),
        (KEY_SOURCE, Some(Value::String(edge.source.clone()))),
        (KEY_TARGET, Some(Value::String(edge.target.clone()))),
        (KEY_SOURCE_HANDLE, edge.source_handle.clone().map(Value::String)),
        (KEY_TARGET_HANDLE, edge.target_handle.clone().map(Value::String)),
        (KEY_MARKER_START, edge.marker_start.clone()),
        (KEY_MARKER_END, edge.marker_end.clone()),
        (KEY_STYLE, edge.style.clone().map(Value::Object)),
        (KEY_ANIMATED, edge.animated.then_some(Value::Bool(true))),
        (KEY_LABEL, edge.label.clone().map(Value::String)),
    ]
}

/// Write or delete one scalar field.
pub fn write_scalar(map: &LoroMap, key: &str, value: Option<&Value>) -> DocumentResult<()> {
    match value {
        Some(value) => map.insert(key, json_to_loro(value))?,
        None => {
            if map.get(key).is_some() {
                map.delete(key)?;
            }
        }
    }
    Ok(())
}

/// Write a point into a nested position map.
pub fn write_position(entity: &LoroMap, position: Point) -> DocumentResult<()> {
    let map = child_map(entity, KEY_POSITION)?;
    map.insert(KEY_X, position.x)?;
    map.insert(KEY_Y, position.y)?;
    Ok(())
}

/// Key-level diff of a data bag: set changed/added keys, delete removed keys.
/// Returns the number of keys written or deleted.
pub fn write_data_diff(entity: &LoroMap, old: &JsonMap, new: &JsonMap) -> DocumentResult<usize> {
    let mut changes = 0;
    let data = child_map(entity, KEY_DATA)?;
    for (key, value) in new {
        if old.get(key) != Some(value) {
            data.insert(key, json_to_loro(value))?;
            changes += 1;
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            data.delete(key)?;
            changes += 1;
        }
    }
    Ok(changes)
}

fn write_data(entity: &LoroMap, data: &JsonMap) -> DocumentResult<()> {
    let map = entity.insert_container(KEY_DATA, LoroMap::new())?;
    for (key, value) in data {
        map.insert(key, json_to_loro(value))?;
    }
    Ok(())
}

/// Write a full node into the node collection under its id.
pub fn write_node(nodes: &LoroMap, node: &DiagramNode) -> DocumentResult<()> {
    let map = nodes.insert_container(&node.id, LoroMap::new())?;
    map.insert(KEY_ID, node.id.as_str())?;
    for (key, value) in node_scalar_fields(node) {
        if let Some(value) = value {
            map.insert(key, json_to_loro(&value))?;
        }
    }
    let position = map.insert_container(KEY_POSITION, LoroMap::new())?;
    position.insert(KEY_X, node.position.x)?;
    position.insert(KEY_Y, node.position.y)?;
    write_data(&map, &node.data)
}

/// Write a full edge into the edge collection under its id.
pub fn write_edge(edges: &LoroMap, edge: &DiagramEdge) -> DocumentResult<()> {
    let map = edges.insert_container(&edge.id, LoroMap::new())?;
    map.insert(KEY_ID, edge.id.as_str())?;
    for (key, value) in edge_scalar_fields(edge) {
        if let Some(value) = value {
            map.insert(key, json_to_loro(&value))?;
        }
    }
    write_data(&map, &edge.data)
}

fn point_from_loro(map: &LoroMapValue) -> Option<Point> {
    match map.get(KEY_POSITION)? {
        LoroValue::Map(position) => Some(Point::new(
            get_double(position, KEY_X).unwrap_or(0.0),
            get_double(position, KEY_Y).unwrap_or(0.0),
        )),
        _ => None,
    }
}

/// Convert a stored node back to a [`DiagramNode`]. Missing or malformed
/// fields are defaulted so a peer running another version still renders.
///
/// The id is always the container key; a stored `id` field is ignored.
pub fn node_from_loro(key: &str, value: &LoroValue) -> DiagramNode {
    let LoroValue::Map(map) = value else {
        log::warn!("Node {} is not a map, using defaults", key);
        return DiagramNode::new(key, DEFAULT_NODE_KIND, Point::ZERO);
    };

    let position = point_from_loro(map).unwrap_or_else(|| {
        log::debug!("Node {} has no position, defaulting to origin", key);
        Point::ZERO
    });

    DiagramNode {
        id: key.to_string(),
        kind: get_string(map, KEY_TYPE).unwrap_or_else(|| DEFAULT_NODE_KIND.to_string()),
        position,
        data: get_object(map, KEY_DATA).unwrap_or_default(),
        measured: get_json(map, KEY_MEASURED).and_then(|v| size_from_json(&v)),
        parent_id: get_string(map, KEY_PARENT_ID),
        extent: get_string(map, KEY_EXTENT),
        style: get_object(map, KEY_STYLE),
        hidden: get_bool(map, KEY_HIDDEN),
    }
}

/// Convert a stored edge back to a [`DiagramEdge`], defaulting missing fields.
/// Like nodes, the id comes from the container key.
pub fn edge_from_loro(key: &str, value: &LoroValue) -> DiagramEdge {
    let LoroValue::Map(map) = value else {
        log::warn!("Edge {} is not a map, using defaults", key);
        return DiagramEdge::new(key, "", "");
    };

    DiagramEdge {
        id: key.to_string(),
        kind: get_string(map, KEY_TYPE).unwrap_or_else(|| DEFAULT_EDGE_KIND.to_string()),
        source: get_string(map, KEY_SOURCE).unwrap_or_default(),
        target: get_string(map, KEY_TARGET).unwrap_or_default(),
        source_handle: get_string(map, KEY_SOURCE_HANDLE),
        target_handle: get_string(map, KEY_TARGET_HANDLE),
        marker_start: get_json(map, KEY_MARKER_START),
        marker_end: get_json(map, KEY_MARKER_END),
        style: get_object(map, KEY_STYLE),
        animated: get_bool(map, KEY_ANIMATED),
        label: get_string(map, KEY_LABEL),
        data: get_object(map, KEY_DATA).unwrap_or_default(),
    }
}
