use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use serde_with::{skip_serializing_none, DeserializeFromStr, SerializeDisplay};
use thiserror::Error;
use url::Url;

pub mod config;
pub mod decorations;
pub mod host;
pub mod navigator;
pub mod selection;
pub mod settings;

pub use config::BridgeConfig;
pub use decorations::{Decoration, DecorationActivation, HighlightAction, HighlightBridge, HighlightMenu};
pub use host::{HostPhase, ReaderHost};
pub use navigator::{Navigator, NavigatorEvent, NavigatorFactory, Selection, SelectionAction};
pub use settings::{PropertyKind, SettingsBridge, ThemeColors, UserProperties, UserProperty};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to open publication: {0:#}")]
    OpenFailed(anyhow::Error),
    #[error("publication has no cover image")]
    NoCover,
    #[error("failed to write cover image: {0:#}")]
    WriteFailed(anyhow::Error),
    #[error("setting `{reference}` expects {expected}")]
    TypeMismatch {
        reference: String,
        expected: &'static str,
    },
    #[error("operation cancelled")]
    Cancelled,
}

impl BridgeError {
    /// Stable name used when a failure crosses the bridge as a rejection.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::OpenFailed(_) => "OpenFailed",
            BridgeError::NoCover => "NoCover",
            BridgeError::WriteFailed(_) => "WriteFailed",
            BridgeError::TypeMismatch { .. } => "TypeMismatch",
            BridgeError::Cancelled => "Cancelled",
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// A precise position within a publication.
///
/// `locations` and `text` belong to the engine; they are carried through
/// untouched so that a locator read from the navigator serializes back to
/// the exact JSON the host was given.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Locator {
    pub href: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub title: Option<String>,
    pub locations: Option<Map<String, Value>>,
    pub text: Option<Map<String, Value>>,
}

impl Locator {
    pub fn new(href: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            media_type: media_type.into(),
            title: None,
            locations: None,
            text: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_progression(mut self, progression: f64) -> Self {
        let locations = self.locations.get_or_insert_with(Map::new);
        locations.insert("progression".to_string(), Value::from(progression));
        self
    }

    /// The href without its fragment.
    pub fn resource_href(&self) -> &str {
        strip_fragment(&self.href)
    }
}

/// A navigation entry, as found in a table of contents.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(rename = "type")]
    pub media_type: Option<String>,
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Link>,
}

impl Link {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            media_type: None,
            title: None,
            children: Vec::new(),
        }
    }
}

/// Either a locator or a link; hosts may hand over a TOC entry wherever a
/// position is expected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Location {
    Locator(Locator),
    Link(Link),
}

impl<'de> Deserialize<'de> for Location {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Map::<String, Value>::deserialize(deserializer)?;
        let has_type = value
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| !t.is_empty());
        let has_fragment = value
            .get("href")
            .and_then(Value::as_str)
            .is_some_and(|href| href.contains('#'));
        let link_only = value.contains_key("children") || value.contains_key("templated");
        let locator_only = value.contains_key("locations") || value.contains_key("text");
        let is_locator = locator_only || (has_type && !has_fragment && !link_only);

        let value = Value::Object(value);
        if is_locator {
            if let Ok(locator) = Locator::deserialize(&value) {
                return Ok(Location::Locator(locator));
            }
        }
        serde_json::from_value(value)
            .map(Location::Link)
            .map_err(D::Error::custom)
    }
}

impl From<Locator> for Location {
    fn from(locator: Locator) -> Self {
        Location::Locator(locator)
    }
}

impl From<Link> for Location {
    fn from(link: Link) -> Self {
        Location::Link(link)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub id: i64,
    pub locator: Locator,
}

/// The publication a host asks the reader to open.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub url: String,
    #[serde(rename = "initialLocation")]
    pub initial_location: Option<Location>,
}

impl FileDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            initial_location: None,
        }
    }

    pub fn with_initial_location(mut self, location: impl Into<Location>) -> Self {
        self.initial_location = Some(location.into());
        self
    }

    pub fn local_path(&self) -> BridgeResult<PathBuf> {
        local_path_for_url(&self.url)
    }
}

/// Resolves a host-supplied path or `file://` URL to a local path.
pub fn local_path_for_url(raw: &str) -> BridgeResult<PathBuf> {
    match Url::parse(raw) {
        Ok(url) if url.scheme() == "file" => url.to_file_path().map_err(|_| {
            BridgeError::OpenFailed(anyhow::anyhow!("`{raw}` is not a valid local file URL"))
        }),
        // Windows drive letters parse as one-letter schemes.
        Ok(url) if url.scheme().len() > 1 => Err(BridgeError::OpenFailed(anyhow::anyhow!(
            "unsupported publication URL scheme `{}`",
            url.scheme()
        ))),
        _ => Ok(PathBuf::from(raw)),
    }
}

/// Host-provided value for a single user property. Any JSON value is
/// accepted here; whether it fits the property is decided on apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Flag(bool),
    Integer(i64),
    Number(f64),
    Other(Value),
}

impl SettingValue {
    pub fn as_index(&self) -> Option<usize> {
        match self {
            SettingValue::Integer(value) => usize::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            SettingValue::Integer(value) => Some(*value as f64),
            SettingValue::Number(value) if value.is_finite() => Some(*value),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            SettingValue::Flag(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Flag(value)
    }
}

impl From<i32> for SettingValue {
    fn from(value: i32) -> Self {
        SettingValue::Integer(value.into())
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Integer(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Number(value)
    }
}

/// Property reference -> value, as supplied by the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsMap(BTreeMap<String, SettingValue>);

impl SettingsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reference: &str) -> Option<&SettingValue> {
        self.0.get(reference)
    }

    pub fn insert(&mut self, reference: impl Into<String>, value: impl Into<SettingValue>) {
        self.0.insert(reference.into(), value.into());
    }

    pub fn with(mut self, reference: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.insert(reference, value);
        self
    }

    /// Overlays `other` on top of `self`, key by key.
    pub fn merge(&mut self, other: &SettingsMap) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SettingValue)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl FromStr for Color {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix('#')
            .ok_or_else(|| anyhow::anyhow!("color `{s}` must start with `#`"))?;
        if hex.len() != 6 || !hex.is_ascii() {
            anyhow::bail!("color `{s}` must have the form #rrggbb");
        }
        let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16);
        Ok(Color {
            r: channel(0..2)?,
            g: channel(2..4)?,
            b: channel(4..6)?,
        })
    }
}

/// Everything the bridge reports back to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum BridgeEvent {
    LocationChanged(Locator),
    TocLoaded(Option<Vec<Link>>),
    TranslateRequested(Locator),
    HighlightShowRequested { id: i64 },
    HighlightDeleteRequested { id: i64 },
}

pub(crate) fn strip_fragment(href: &str) -> &str {
    href.split_once('#').map(|(path, _)| path).unwrap_or(href)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn locator_round_trips_opaque_fields() {
        let raw = json!({
            "href": "OEBPS/chapter1.xhtml",
            "type": "application/xhtml+xml",
            "title": "Chapter 1",
            "locations": {"progression": 0.25, "position": 4, "otherLocations": {"cssSelector": "#p3"}},
            "text": {"highlight": "It was a dark night", "before": "", "after": " and stormy"}
        });

        let locator: Locator = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(locator.resource_href(), "OEBPS/chapter1.xhtml");
        assert_eq!(serde_json::to_value(&locator).unwrap(), raw);
    }

    #[test]
    fn locator_omits_absent_optionals() {
        let locator = Locator::new("a.xhtml", "application/xhtml+xml");
        let value = serde_json::to_value(&locator).unwrap();
        assert_eq!(value, json!({"href": "a.xhtml", "type": "application/xhtml+xml"}));
    }

    #[test]
    fn location_distinguishes_links_from_locators() {
        let locator: Location = serde_json::from_value(json!({
            "href": "ch1.xhtml",
            "type": "application/xhtml+xml",
            "locations": {"progression": 0.5}
        }))
        .unwrap();
        assert!(matches!(locator, Location::Locator(_)));

        let toc_entry: Location = serde_json::from_value(json!({
            "href": "ch1.xhtml#section-2",
            "type": "application/xhtml+xml",
            "title": "Section 2"
        }))
        .unwrap();
        assert!(matches!(toc_entry, Location::Link(_)));

        let parent: Location = serde_json::from_value(json!({
            "href": "ch1.xhtml",
            "title": "Part One",
            "children": [{"href": "ch2.xhtml"}]
        }))
        .unwrap();
        match parent {
            Location::Link(link) => assert_eq!(link.children.len(), 1),
            other => panic!("unexpected location: {:?}", other),
        }
    }

    #[test]
    fn location_keeps_text_of_fragment_locators() {
        let raw = json!({
            "href": "ch1.xhtml#p3",
            "type": "application/xhtml+xml",
            "text": {"highlight": "dark night"}
        });
        let location: Location = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(location, Location::Locator(_)));
        assert_eq!(serde_json::to_value(&location).unwrap(), raw);

        let untyped: Location = serde_json::from_value(json!({
            "href": "ch1.xhtml",
            "locations": {"progression": 0.5}
        }))
        .unwrap();
        match untyped {
            Location::Link(link) => assert_eq!(link.href, "ch1.xhtml"),
            other => panic!("unexpected location: {:?}", other),
        }
    }

    #[test]
    fn highlight_uses_host_wire_shape() {
        let highlight: Highlight = serde_json::from_value(json!({
            "id": 7,
            "locator": {"href": "ch1.xhtml", "type": "application/xhtml+xml"}
        }))
        .unwrap();
        assert_eq!(highlight.id, 7);
        assert_eq!(highlight.locator.href, "ch1.xhtml");
    }

    #[test]
    fn file_descriptor_reads_initial_location() {
        let file: FileDescriptor = serde_json::from_value(json!({
            "url": "/books/moby.epub",
            "initialLocation": {"href": "ch3.xhtml", "type": "application/xhtml+xml"}
        }))
        .unwrap();
        assert_eq!(file.local_path().unwrap(), PathBuf::from("/books/moby.epub"));
        assert!(matches!(file.initial_location, Some(Location::Locator(_))));
    }

    #[test]
    fn remote_urls_are_rejected() {
        let err = local_path_for_url("https://example.com/book.epub").unwrap_err();
        assert_eq!(err.code(), "OpenFailed");
    }

    #[cfg(unix)]
    #[test]
    fn file_urls_resolve_to_paths() {
        let path = local_path_for_url("file:///tmp/book.epub").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/book.epub"));
    }

    #[test]
    fn settings_values_keep_their_json_kind() {
        let map: SettingsMap = serde_json::from_value(json!({
            "appearance": 2,
            "fontSize": 150.5,
            "scroll": true,
            "fontFamily": "serif"
        }))
        .unwrap();

        assert_eq!(map.get("appearance"), Some(&SettingValue::Integer(2)));
        assert_eq!(map.get("fontSize").and_then(SettingValue::as_number), Some(150.5));
        assert_eq!(map.get("scroll").and_then(SettingValue::as_flag), Some(true));
        assert!(matches!(map.get("fontFamily"), Some(SettingValue::Other(_))));
        assert_eq!(map.get("fontFamily").and_then(SettingValue::as_index), None);
    }

    #[test]
    fn settings_merge_overlays_keys() {
        let mut base = SettingsMap::new().with("fontSize", 120.0).with("scroll", false);
        base.merge(&SettingsMap::new().with("scroll", true));
        assert_eq!(base.get("fontSize"), Some(&SettingValue::Number(120.0)));
        assert_eq!(base.get("scroll"), Some(&SettingValue::Flag(true)));
    }

    #[test]
    fn color_parses_hex() {
        let color: Color = "#FAF4E8".parse().unwrap();
        assert_eq!(color, Color::rgb(0xfa, 0xf4, 0xe8));
        assert_eq!(color.to_string(), "#faf4e8");
        assert!("faf4e8".parse::<Color>().is_err());
        assert!("#fff".parse::<Color>().is_err());
    }

    #[test]
    fn bridge_events_serialize_with_event_tag() {
        let event = BridgeEvent::HighlightDeleteRequested { id: 3 };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "highlightDeleteRequested", "payload": {"id": 3}})
        );

        let toc = BridgeEvent::TocLoaded(None);
        assert_eq!(
            serde_json::to_value(&toc).unwrap(),
            json!({"event": "tocLoaded", "payload": null})
        );
    }
}
