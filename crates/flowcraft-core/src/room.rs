//! Room identifiers and shareable addresses.
//!
//! A room id is 128 random bits rendered as 32 lowercase hex characters. It
//! travels in a shareable address as `room=<id>` inside the fragment (the
//! form written by [`embed_room_id`]) or the query.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::error::CollabError;

/// Address parameter carrying the room id.
pub const ROOM_PARAM: &str = "room";

const ROOM_ID_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Fresh id from the OS random number generator.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ROOM_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Accepts exactly 32 hex characters (any case); stores them lowercase.
    pub fn parse(input: &str) -> Result<Self, CollabError> {
        let input = input.trim();
        if input.len() == ROOM_ID_BYTES * 2 && input.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(input.to_ascii_lowercase()))
        } else {
            Err(CollabError::InvalidRoomId(input.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = CollabError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

/// An address split into base, query and fragment.
struct Address<'a> {
    base: &'a str,
    query: Option<&'a str>,
    fragment: Option<&'a str>,
}

impl<'a> Address<'a> {
    fn split(address: &'a str) -> Self {
        let (rest, fragment) = match address.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment)),
            None => (address, None),
        };
        let (base, query) = match rest.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (rest, None),
        };
        Self {
            base,
            query,
            fragment,
        }
    }

    fn join(base: &str, query: Option<String>, fragment: Option<String>) -> String {
        let mut out = base.to_string();
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            out.push('?');
            out.push_str(&query);
        }
        if let Some(fragment) = fragment.filter(|f| !f.is_empty()) {
            out.push('#');
            out.push_str(&fragment);
        }
        out
    }
}

fn room_param(part: &str) -> Option<String> {
    form_urlencoded::parse(part.as_bytes())
        .find(|(key, _)| key == ROOM_PARAM)
        .map(|(_, value)| value.into_owned())
}

/// Re-encode `part` without the room parameter. Parts that are not
/// key=value lists (like `#section`) are kept untouched.
fn without_room(part: &str) -> String {
    if room_param(part).is_none() {
        return part.to_string();
    }
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in form_urlencoded::parse(part.as_bytes()) {
        if key != ROOM_PARAM {
            serializer.append_pair(&key, &value);
        }
    }
    serializer.finish()
}

/// Room id from a bare id or from an address with `room=<id>` in its
/// fragment or query. Anything else is no room.
pub fn extract_room_id(input: &str) -> Option<RoomId> {
    let input = input.trim();
    if let Ok(id) = RoomId::parse(input) {
        return Some(id);
    }
    let address = Address::split(input);
    [address.fragment, address.query]
        .into_iter()
        .flatten()
        .find_map(room_param)
        .and_then(|value| RoomId::parse(&value).ok())
}

/// `address` with its fragment set to carry `room`. Any previous room
/// parameter is removed first.
pub fn embed_room_id(address: &str, room: &RoomId) -> String {
    let cleared = clear_room_id(address);
    let parts = Address::split(&cleared);
    let fragment = form_urlencoded::Serializer::new(String::new())
        .append_pair(ROOM_PARAM, room.as_str())
        .finish();
    Address::join(parts.base, parts.query.map(str::to_string), Some(fragment))
}

/// `address` without any room parameter.
pub fn clear_room_id(address: &str) -> String {
    let parts = Address::split(address);
    Address::join(
        parts.base,
        parts.query.map(without_room),
        parts.fragment.map(without_room),
    )
}

/// Where the host shows the shareable address (a browser location bar, a
/// window title, a share dialog).
pub trait AddressBar {
    fn current(&self) -> String;
    fn replace(&self, address: String);
}

/// [`AddressBar`] held in memory. Cloning shares the same address.
#[derive(Debug, Clone, Default)]
pub struct MemoryAddressBar {
    address: Rc<RefCell<String>>,
}

impl MemoryAddressBar {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Rc::new(RefCell::new(address.into())),
        }
    }
}

impl AddressBar for MemoryAddressBar {
    fn current(&self) -> String {
        self.address.borrow().clone()
    }

    fn replace(&self, address: String) {
        *self.address.borrow_mut() = address;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_generate_format() {
        let a = RoomId::generate();
        let b = RoomId::generate();
        assert_eq!(a.as_str().len(), 32);
        assert!(
            a.as_str()
                .bytes()
                .all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c))
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse() {
        assert_eq!(RoomId::parse(ID).unwrap().as_str(), ID);
        assert_eq!(RoomId::parse(&ID.to_uppercase()).unwrap().as_str(), ID);
        assert!(RoomId::parse("abc").is_err());
        assert!(RoomId::parse(&"g".repeat(32)).is_err());
    }

    #[test]
    fn test_extract() {
        let id = RoomId::parse(ID).unwrap();
        assert_eq!(extract_room_id(ID), Some(id.clone()));
        assert_eq!(
            extract_room_id(&format!("https://app.example/edit#room={}", ID)),
            Some(id.clone())
        );
        assert_eq!(
            extract_room_id(&format!("https://app.example/?theme=dark&room={}", ID)),
            Some(id)
        );
        assert_eq!(extract_room_id("https://app.example/#room=short"), None);
        assert_eq!(extract_room_id("https://app.example/"), None);
        assert_eq!(extract_room_id(""), None);
    }

    #[test]
    fn test_embed_and_clear() {
        let id = RoomId::parse(ID).unwrap();
        let embedded = embed_room_id("https://app.example/edit?theme=dark", &id);
        assert_eq!(
            embedded,
            format!("https://app.example/edit?theme=dark#room={}", ID)
        );
        assert_eq!(extract_room_id(&embedded), Some(id.clone()));
        assert_eq!(clear_room_id(&embedded), "https://app.example/edit?theme=dark");

        let replaced = embed_room_id(&format!("https://x/?room={}", ID), &RoomId::generate());
        assert!(!replaced.contains(&format!("?room={}", ID)));
    }

    #[test]
    fn test_serde_validates() {
        let id: RoomId = serde_json::from_str(&format!("\"{}\"", ID)).unwrap();
        assert_eq!(id.as_str(), ID);
        assert!(serde_json::from_str::<RoomId>("\"nope\"").is_err());
    }
}
