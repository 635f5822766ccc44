//! Binary attachment relay with a content-safety gate.
//!
//! ```text
//! announce(blob)
//!    │
//!    ├── id known, same content   → Duplicate (no-op, not rebroadcast)
//!    ├── id known, other content  → Rejected(Immutable)
//!    │
//!    ▼
//! ContentGate::check(blob)
//!    ├── scheme != data:          → Rejected(DisallowedScheme | Malformed)
//!    ├── media type not image/*   → Rejected(DisallowedMimeType)
//!    ├── active markup in decoded
//!    │   payload (any image type) → Rejected(ActiveContent)
//!    └── ok                       → Accepted (broadcast to peers)
//! ```
//!
//! Files travel independently of the elements that reference them. An image
//! element whose file has not arrived (or was rejected) is a normal state.

use base64::Engine;
use indexmap::IndexMap;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ordered file set of a room or drawing, keyed by file id.
pub type FileMap = IndexMap<String, FileBlob>;

/// Immutable, content-addressed attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileBlob {
    #[serde(rename = "fileId", alias = "id")]
    pub id: String,
    pub mime_type: String,
    #[serde(rename = "dataURL")]
    pub data_url: String,
    /// Creation time, milliseconds since the epoch.
    #[serde(default)]
    pub created: u64,
}

impl FileBlob {
    pub fn new(
        id: impl Into<String>,
        mime_type: impl Into<String>,
        data_url: impl Into<String>,
        created: u64,
    ) -> Self {
        Self {
            id: id.into(),
            mime_type: mime_type.into(),
            data_url: data_url.into(),
            created,
        }
    }

    /// Same bound content (the creation stamp is not part of identity).
    pub fn same_content(&self, other: &FileBlob) -> bool {
        self.mime_type == other.mime_type && self.data_url == other.data_url
    }
}

/// Why a file was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileRejection {
    #[error("file {0} is already bound to different content")]
    Immutable(String),
    #[error("disallowed URL scheme '{0}'")]
    DisallowedScheme(String),
    #[error("disallowed media type '{0}'")]
    DisallowedMimeType(String),
    #[error("payload contains active content ({0})")]
    ActiveContent(&'static str),
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("malformed data URL: {0}")]
    Malformed(String),
}

/// Content gate limits.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Maximum length of the data URL in bytes.
    pub max_data_url_bytes: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_data_url_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Markers of script-capable markup, matched case-insensitively.
const ACTIVE_MARKERS: &[&str] = &[
    "<script",
    "javascript:",
    "vbscript:",
    "<iframe",
    "<foreignobject",
    "<object",
    "<embed",
    "onload=",
    "onerror=",
    "onclick=",
    "onmouseover=",
    "onbegin=",
    "onfocus=",
];

/// Stateless content-safety check applied before a file is accepted.
#[derive(Debug, Clone, Default)]
pub struct ContentGate {
    config: GateConfig,
}

impl ContentGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Check a blob. `Ok(())` means it may be accepted.
    pub fn check(&self, blob: &FileBlob) -> Result<(), FileRejection> {
        let url = blob.data_url.trim_start();
        if url.len() > self.config.max_data_url_bytes {
            return Err(FileRejection::TooLarge {
                size: url.len(),
                limit: self.config.max_data_url_bytes,
            });
        }

        let scheme = url
            .split_once(':')
            .map(|(s, _)| s.to_ascii_lowercase())
            .ok_or_else(|| FileRejection::Malformed("missing scheme".into()))?;
        if scheme != "data" {
            return Err(FileRejection::DisallowedScheme(scheme));
        }

        let declared = blob.mime_type.to_ascii_lowercase();
        if !is_image_type(&declared) {
            return Err(FileRejection::DisallowedMimeType(blob.mime_type.clone()));
        }

        let parsed = DataUrl::parse(url)?;
        if !is_image_type(&parsed.media_type) {
            return Err(FileRejection::DisallowedMimeType(parsed.media_type));
        }

        // Every image type is scanned, raster included.
        let payload = parsed.decode()?;
        scan_active_content(&payload)
    }
}

fn is_image_type(media_type: &str) -> bool {
    media_type.starts_with("image/")
}

/// Parsed `data:[<media type>][;base64],<data>` URL.
struct DataUrl<'a> {
    media_type: String,
    base64: bool,
    data: &'a str,
}

impl<'a> DataUrl<'a> {
    fn parse(url: &'a str) -> Result<Self, FileRejection> {
        let rest = url
            .get(5..)
            .ok_or_else(|| FileRejection::Malformed("truncated".into()))?;
        let (meta, data) = rest
            .split_once(',')
            .ok_or_else(|| FileRejection::Malformed("missing ','".into()))?;

        let mut parts = meta.split(';');
        let media_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let base64 = parts.any(|p| p.trim().eq_ignore_ascii_case("base64"));
        let media_type = if media_type.is_empty() {
            "text/plain".to_string()
        } else {
            media_type
        };

        Ok(Self {
            media_type,
            base64,
            data,
        })
    }

    fn decode(&self) -> Result<Vec<u8>, FileRejection> {
        if self.base64 {
            // Some encoders wrap long data URLs across lines.
            let compact: String = self.data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact)
                .map_err(|e| FileRejection::Malformed(format!("bad base64: {e}")))
        } else {
            Ok(percent_decode_str(self.data).collect())
        }
    }
}

fn scan_active_content(payload: &[u8]) -> Result<(), FileRejection> {
    let lowered: Vec<u8> = payload
        .iter()
        .filter(|b| !b.is_ascii_whitespace())
        .map(u8::to_ascii_lowercase)
        .collect();
    for marker in ACTIVE_MARKERS {
        let needle: Vec<u8> = marker.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
        if lowered.windows(needle.len()).any(|w| w == needle.as_slice()) {
            return Err(FileRejection::ActiveContent(marker));
        }
    }
    Ok(())
}

/// Outcome of a successful announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAnnouncement {
    /// First time this id was seen: store and broadcast.
    Accepted,
    /// Identical content already bound: nothing to do.
    Duplicate,
}

/// Per-room file set guarded by the content gate.
#[derive(Debug, Clone, Default)]
pub struct FileRelay {
    files: FileMap,
    gate: ContentGate,
}

impl FileRelay {
    pub fn new(gate: ContentGate) -> Self {
        Self {
            files: FileMap::new(),
            gate,
        }
    }

    /// Seed from a stored drawing. Stored files bypass the gate.
    pub fn with_files(gate: ContentGate, files: FileMap) -> Self {
        Self { files, gate }
    }

    /// Offer a blob to the room.
    ///
    /// `Ok` means the file is (now) part of the room; only
    /// [`FileAnnouncement::Accepted`] should be broadcast.
    pub fn announce(&mut self, blob: FileBlob) -> Result<FileAnnouncement, FileRejection> {
        if let Some(existing) = self.files.get(&blob.id) {
            if existing.same_content(&blob) {
                return Ok(FileAnnouncement::Duplicate);
            }
            log::warn!("Rejected re-announcement of file {} with different content", blob.id);
            return Err(FileRejection::Immutable(blob.id));
        }

        if let Err(rejection) = self.gate.check(&blob) {
            log::warn!("Rejected file {}: {rejection}", blob.id);
            return Err(rejection);
        }

        self.files.insert(blob.id.clone(), blob);
        Ok(FileAnnouncement::Accepted)
    }

    /// Take a file from durable storage without gating it again.
    /// Returns `false` if the id is already bound.
    pub fn adopt(&mut self, blob: FileBlob) -> bool {
        if self.files.contains_key(&blob.id) {
            return false;
        }
        self.files.insert(blob.id.clone(), blob);
        true
    }

    pub fn get(&self, id: &str) -> Option<&FileBlob> {
        self.files.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.files.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &FileMap {
        &self.files
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_data_url(bytes: usize) -> String {
        // PNG signature followed by deterministic filler.
        let mut raw = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        raw.extend((0..bytes.saturating_sub(8)).map(|i| (i * 31 % 251) as u8));
        format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&raw)
        )
    }

    fn svg_data_url(svg: &str) -> String {
        format!(
            "data:image/svg+xml;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(svg)
        )
    }

    fn png(id: &str, bytes: usize) -> FileBlob {
        FileBlob::new(id, "image/png", png_data_url(bytes), 1)
    }

    #[test]
    fn test_accept_then_duplicate() {
        let mut relay = FileRelay::default();
        let blob = png("f1", 1024);
        assert_eq!(relay.announce(blob.clone()), Ok(FileAnnouncement::Accepted));
        assert_eq!(relay.announce(blob), Ok(FileAnnouncement::Duplicate));
        assert_eq!(relay.len(), 1);
    }

    #[test]
    fn test_different_content_same_id_rejected() {
        let mut relay = FileRelay::default();
        let original = png("f1", 1024);
        relay.announce(original.clone()).unwrap();

        let result = relay.announce(png("f1", 2048));
        assert_eq!(result, Err(FileRejection::Immutable("f1".into())));
        assert_eq!(relay.get("f1"), Some(&original));
    }

    #[test]
    fn test_created_stamp_not_part_of_identity() {
        let mut relay = FileRelay::default();
        let mut blob = png("f1", 64);
        relay.announce(blob.clone()).unwrap();
        blob.created = 999;
        assert_eq!(relay.announce(blob), Ok(FileAnnouncement::Duplicate));
    }

    #[test]
    fn test_script_scheme_rejected() {
        let gate = ContentGate::default();
        let blob = FileBlob::new("x", "image/png", "javascript:alert(1)", 0);
        assert_eq!(
            gate.check(&blob),
            Err(FileRejection::DisallowedScheme("javascript".into()))
        );

        let blob = FileBlob::new("x", "image/png", "  JavaScript:alert(1)", 0);
        assert!(matches!(gate.check(&blob), Err(FileRejection::DisallowedScheme(_))));

        let blob = FileBlob::new("x", "image/png", "https://example.com/a.png", 0);
        assert!(matches!(gate.check(&blob), Err(FileRejection::DisallowedScheme(_))));
    }

    #[test]
    fn test_svg_with_script_tag_rejected() {
        let gate = ContentGate::default();
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg"><SCRIPT>alert(1)</SCRIPT></svg>"#;
        let blob = FileBlob::new("s", "image/svg+xml", svg_data_url(svg), 0);
        assert_eq!(gate.check(&blob), Err(FileRejection::ActiveContent("<script")));
    }

    #[test]
    fn test_svg_with_event_handler_rejected() {
        let gate = ContentGate::default();
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" onload ="x()"><rect/></svg>"#;
        let blob = FileBlob::new("s", "image/svg+xml", svg_data_url(svg), 0);
        assert!(matches!(gate.check(&blob), Err(FileRejection::ActiveContent(_))));
    }

    #[test]
    fn test_percent_encoded_svg_scanned() {
        let gate = ContentGate::default();
        let url = "data:image/svg+xml,%3Csvg%3E%3Cscript%3Ealert(1)%3C/script%3E%3C/svg%3E";
        let blob = FileBlob::new("s", "image/svg+xml", url, 0);
        assert_eq!(gate.check(&blob), Err(FileRejection::ActiveContent("<script")));
    }

    #[test]
    fn test_raster_payload_with_markup_rejected() {
        let gate = ContentGate::default();
        let html = "<html><script>alert(document.cookie)</script></html>";
        let url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(html)
        );
        let blob = FileBlob::new("p", "image/png", url, 0);
        assert_eq!(gate.check(&blob), Err(FileRejection::ActiveContent("<script")));
    }

    #[test]
    fn test_wrapped_base64_accepted() {
        let gate = ContentGate::default();
        let url = png_data_url(512);
        let (head, data) = url.split_once(',').unwrap();
        let wrapped: Vec<String> = data
            .as_bytes()
            .chunks(76)
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect();
        let blob = FileBlob::new("w", "image/png", format!("{head},{}", wrapped.join("\r\n")), 0);
        assert_eq!(gate.check(&blob), Ok(()));
    }

    #[test]
    fn test_percent_encoded_clean_svg_accepted() {
        let gate = ContentGate::default();
        let url = "data:image/svg+xml,%3Csvg%20xmlns='http://www.w3.org/2000/svg'%3E%3Crect/%3E%3C/svg%3E";
        let blob = FileBlob::new("s", "image/svg+xml", url, 0);
        assert_eq!(gate.check(&blob), Ok(()));
    }

    #[test]
    fn test_clean_svg_accepted() {
        let gate = ContentGate::default();
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg"><circle r="4"/></svg>"#;
        let blob = FileBlob::new("s", "image/svg+xml", svg_data_url(svg), 0);
        assert_eq!(gate.check(&blob), Ok(()));
    }

    #[test]
    fn test_html_payload_rejected_by_media_type() {
        let gate = ContentGate::default();
        let blob = FileBlob::new("h", "text/html", "data:text/html,<b>hi</b>", 0);
        assert!(matches!(gate.check(&blob), Err(FileRejection::DisallowedMimeType(_))));

        let blob = FileBlob::new("h", "image/png", "data:text/html,<b>hi</b>", 0);
        assert_eq!(
            gate.check(&blob),
            Err(FileRejection::DisallowedMimeType("text/html".into()))
        );
    }

    #[test]
    fn test_bad_base64_is_malformed() {
        let gate = ContentGate::default();
        let blob = FileBlob::new("b", "image/png", "data:image/png;base64,@@@@", 0);
        assert!(matches!(gate.check(&blob), Err(FileRejection::Malformed(_))));

        let blob = FileBlob::new("b", "image/png", "no scheme here", 0);
        assert!(matches!(gate.check(&blob), Err(FileRejection::Malformed(_))));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let gate = ContentGate::new(GateConfig {
            max_data_url_bytes: 1024,
        });
        let blob = png("big", 4096);
        assert!(matches!(gate.check(&blob), Err(FileRejection::TooLarge { .. })));
    }

    #[test]
    fn test_images_roundtrip_byte_for_byte() {
        for size in [1024, 15 * 1024, 75 * 1024] {
            let mut relay = FileRelay::default();
            let blob = png(&format!("img-{size}"), size);
            relay.announce(blob.clone()).unwrap();

            let stored = relay.get(&blob.id).unwrap();
            assert_eq!(stored.data_url.as_bytes(), blob.data_url.as_bytes());

            let encoded = stored.data_url.split_once(',').unwrap().1;
            let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
            assert_eq!(decoded.len(), size);
        }
    }

    #[test]
    fn test_rejected_file_not_stored() {
        let mut relay = FileRelay::default();
        let bad = FileBlob::new("bad", "image/png", "javascript:void(0)", 0);
        assert!(relay.announce(bad).is_err());
        assert!(!relay.contains("bad"));
        assert!(relay.is_empty());
    }

    #[test]
    fn test_wire_shape() {
        let blob = FileBlob::new("f", "image/png", "data:image/png;base64,AAAA", 5);
        let value = serde_json::to_value(&blob).unwrap();
        assert_eq!(value["dataURL"], "data:image/png;base64,AAAA");
        assert_eq!(value["mimeType"], "image/png");

        let parsed: FileBlob = serde_json::from_value(serde_json::json!({
            "fileId": "g",
            "mimeType": "image/jpeg",
            "dataURL": "data:image/jpeg;base64,AAAA",
            "created": 7
        }))
        .unwrap();
        assert_eq!(parsed.id, "g");
    }
}
