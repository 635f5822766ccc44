//! Drawable elements and their reconciliation header.
//!
//! Wire shape (one JSON object per element):
//! ```text
//! {
//!   "id": "r1", "type": "rectangle",          ← header id + shape tag
//!   "version": 4, "versionNonce": 193847,     ← reconciliation axis
//!   "isDeleted": false, "updated": 1700000000000,
//!   "fileId": null,
//!   "x": 10, "y": 20, "width": 100, ...       ← shape payload (opaque)
//! }
//! ```
//!
//! The reconciler only ever looks at [`ElementHeader`]; the shape payload is
//! carried verbatim so that fields this server does not know about survive
//! a round trip through the room and through storage.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::SystemTime;
use uuid::Uuid;

/// Authoritative element set of a room or local scene, keyed by element id.
///
/// Insertion-ordered so the drawing keeps a stable z-order when persisted.
pub type ElementMap = IndexMap<String, Element>;

/// Open geometry/style payload of a shape.
pub type ShapeProps = Map<String, Value>;

/// Fields shared by every element variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementHeader {
    pub id: String,
    /// Increases on every edit.
    #[serde(default)]
    pub version: u64,
    /// Random tiebreaker for equal versions.
    #[serde(default)]
    pub version_nonce: i64,
    /// Tombstone flag. Deleted elements are kept, never removed.
    #[serde(default)]
    pub is_deleted: bool,
    /// Last edit time, milliseconds since the epoch.
    #[serde(default)]
    pub updated: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

/// Shape variants, tagged by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Shape {
    Rectangle(ShapeProps),
    Diamond(ShapeProps),
    Ellipse(ShapeProps),
    Arrow(ShapeProps),
    Line(ShapeProps),
    Freedraw(ShapeProps),
    Text(ShapeProps),
    Image(ShapeProps),
    Frame(ShapeProps),
    MagicFrame(ShapeProps),
    Embeddable(ShapeProps),
    Iframe(ShapeProps),
    Selection(ShapeProps),
}

impl Shape {
    /// The wire tag of this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Shape::Rectangle(_) => "rectangle",
            Shape::Diamond(_) => "diamond",
            Shape::Ellipse(_) => "ellipse",
            Shape::Arrow(_) => "arrow",
            Shape::Line(_) => "line",
            Shape::Freedraw(_) => "freedraw",
            Shape::Text(_) => "text",
            Shape::Image(_) => "image",
            Shape::Frame(_) => "frame",
            Shape::MagicFrame(_) => "magicframe",
            Shape::Embeddable(_) => "embeddable",
            Shape::Iframe(_) => "iframe",
            Shape::Selection(_) => "selection",
        }
    }

    pub fn props(&self) -> &ShapeProps {
        match self {
            Shape::Rectangle(p)
            | Shape::Diamond(p)
            | Shape::Ellipse(p)
            | Shape::Arrow(p)
            | Shape::Line(p)
            | Shape::Freedraw(p)
            | Shape::Text(p)
            | Shape::Image(p)
            | Shape::Frame(p)
            | Shape::MagicFrame(p)
            | Shape::Embeddable(p)
            | Shape::Iframe(p)
            | Shape::Selection(p) => p,
        }
    }

    pub fn props_mut(&mut self) -> &mut ShapeProps {
        match self {
            Shape::Rectangle(p)
            | Shape::Diamond(p)
            | Shape::Ellipse(p)
            | Shape::Arrow(p)
            | Shape::Line(p)
            | Shape::Freedraw(p)
            | Shape::Text(p)
            | Shape::Image(p)
            | Shape::Frame(p)
            | Shape::MagicFrame(p)
            | Shape::Embeddable(p)
            | Shape::Iframe(p)
            | Shape::Selection(p) => p,
        }
    }
}

/// One drawable object: reconciliation header plus shape payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    #[serde(flatten)]
    pub header: ElementHeader,
    #[serde(flatten)]
    pub shape: Shape,
}

impl Element {
    /// Create a fresh element at version 1 with a random nonce.
    pub fn new(id: impl Into<String>, shape: Shape) -> Self {
        Self {
            header: ElementHeader {
                id: id.into(),
                version: 1,
                version_nonce: random_nonce(),
                is_deleted: false,
                updated: now_millis(),
                file_id: None,
            },
            shape,
        }
    }

    /// Shorthand for an empty rectangle.
    pub fn rectangle(id: impl Into<String>) -> Self {
        Self::new(id, Shape::Rectangle(ShapeProps::new()))
    }

    /// Shorthand for an image element bound to `file_id`.
    pub fn image(id: impl Into<String>, file_id: impl Into<String>) -> Self {
        let mut element = Self::new(id, Shape::Image(ShapeProps::new()));
        element.header.file_id = Some(file_id.into());
        element
    }

    /// Builder: pin version and nonce.
    pub fn versioned(mut self, version: u64, version_nonce: i64) -> Self {
        self.header.version = version;
        self.header.version_nonce = version_nonce;
        self
    }

    /// Builder: set the tombstone flag.
    pub fn deleted(mut self, is_deleted: bool) -> Self {
        self.header.is_deleted = is_deleted;
        self
    }

    /// Builder: set a payload property.
    pub fn with_prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.shape.props_mut().insert(key.into(), value);
        self
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn version(&self) -> u64 {
        self.header.version
    }

    pub fn version_nonce(&self) -> i64 {
        self.header.version_nonce
    }

    pub fn is_deleted(&self) -> bool {
        self.header.is_deleted
    }

    pub fn file_id(&self) -> Option<&str> {
        self.header.file_id.as_deref()
    }

    /// Record a local edit: bump the version, draw a new nonce, stamp the time.
    pub fn bump(&mut self) {
        self.header.version += 1;
        self.header.version_nonce = random_nonce();
        self.header.updated = now_millis();
    }

    /// Tombstone this element as a local edit.
    pub fn mark_deleted(&mut self) {
        self.header.is_deleted = true;
        self.bump();
    }

    /// Decode an element from a raw JSON value.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Decode a raw batch, dropping elements that fail to parse.
    ///
    /// Returns the decoded elements and the number dropped.
    pub fn decode_batch(values: Vec<Value>) -> (Vec<Element>, usize) {
        let mut malformed = 0;
        let mut elements = Vec::with_capacity(values.len());
        for value in values {
            match Self::from_value(value) {
                Ok(element) => elements.push(element),
                Err(e) => {
                    malformed += 1;
                    log::debug!("Dropping malformed element: {e}");
                }
            }
        }
        (elements, malformed)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Non-negative 31-bit nonce drawn from a v4 UUID.
fn random_nonce() -> i64 {
    (Uuid::new_v4().as_u128() & 0x7FFF_FFFF) as i64
}
