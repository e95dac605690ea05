//! User properties and the settings bridge.
//!
//! A navigator exposes a fixed, ordered set of typed user properties. The
//! host sends loosely typed maps keyed by property reference; this module
//! validates such a map against the properties and assigns the values that
//! are present.

use serde::Serialize;
use tracing::{debug, trace};

use crate::navigator::Navigator;
use crate::{BridgeError, BridgeResult, Color, SettingValue, SettingsMap};

/// Property references understood by the default property set.
pub mod reference {
    pub const FONT_SIZE: &str = "fontSize";
    pub const FONT_FAMILY: &str = "fontFamily";
    pub const FONT_OVERRIDE: &str = "fontOverride";
    pub const APPEARANCE: &str = "appearance";
    pub const SCROLL: &str = "scroll";
    pub const PUBLISHER_DEFAULT: &str = "advancedSettings";
    pub const TEXT_ALIGNMENT: &str = "textAlign";
    pub const COLUMN_COUNT: &str = "colCount";
    pub const WORD_SPACING: &str = "wordSpacing";
    pub const LETTER_SPACING: &str = "letterSpacing";
    pub const PAGE_MARGINS: &str = "pageMargins";
    pub const LINE_HEIGHT: &str = "lineHeight";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PropertyKind {
    Enumerable { index: usize, values: Vec<String> },
    Incrementable { value: f32, min: f32, max: f32, step: f32 },
    Switchable { on: bool },
}

impl PropertyKind {
    fn expected(&self) -> &'static str {
        match self {
            PropertyKind::Enumerable { .. } => "an option index",
            PropertyKind::Incrementable { .. } => "a number",
            PropertyKind::Switchable { .. } => "a boolean",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserProperty {
    pub reference: String,
    /// CSS custom property the engine maps this onto.
    pub name: String,
    #[serde(flatten)]
    pub kind: PropertyKind,
}

impl UserProperty {
    fn enumerable(reference: &str, name: &str, index: usize, values: &[&str]) -> Self {
        Self {
            reference: reference.to_string(),
            name: name.to_string(),
            kind: PropertyKind::Enumerable {
                index,
                values: values.iter().map(|v| v.to_string()).collect(),
            },
        }
    }

    fn incrementable(reference: &str, name: &str, value: f32, min: f32, max: f32, step: f32) -> Self {
        Self {
            reference: reference.to_string(),
            name: name.to_string(),
            kind: PropertyKind::Incrementable {
                value,
                min,
                max,
                step,
            },
        }
    }

    fn switchable(reference: &str, name: &str, on: bool) -> Self {
        Self {
            reference: reference.to_string(),
            name: name.to_string(),
            kind: PropertyKind::Switchable { on },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct UserProperties {
    properties: Vec<UserProperty>,
}

impl UserProperties {
    pub fn new(properties: Vec<UserProperty>) -> Self {
        Self { properties }
    }

    pub fn get(&self, reference: &str) -> Option<&UserProperty> {
        self.properties.iter().find(|p| p.reference == reference)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserProperty> {
        self.properties.iter()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn appearance_index(&self) -> Option<usize> {
        match self.get(reference::APPEARANCE).map(|p| &p.kind) {
            Some(PropertyKind::Enumerable { index, .. }) => Some(*index),
            _ => None,
        }
    }
}

impl Default for UserProperties {
    fn default() -> Self {
        use reference::*;

        Self::new(vec![
            UserProperty::incrementable(FONT_SIZE, "--USER__fontSize", 100.0, 100.0, 300.0, 25.0),
            UserProperty::enumerable(
                FONT_FAMILY,
                "--USER__fontFamily",
                0,
                &[
                    "Original",
                    "Helvetica Neue",
                    "Iowan Old Style",
                    "Athelas",
                    "Seravek",
                    "OpenDyslexic",
                    "AccessibleDfA",
                    "IA Writer Duospace",
                ],
            ),
            UserProperty::switchable(FONT_OVERRIDE, "--USER__fontOverride", false),
            UserProperty::enumerable(
                APPEARANCE,
                "--USER__appearance",
                0,
                &["readium-default-on", "readium-sepia-on", "readium-night-on"],
            ),
            UserProperty::switchable(SCROLL, "--USER__scroll", false),
            UserProperty::switchable(PUBLISHER_DEFAULT, "--USER__advancedSettings", false),
            UserProperty::enumerable(TEXT_ALIGNMENT, "--USER__textAlign", 0, &["justify", "start"]),
            UserProperty::enumerable(COLUMN_COUNT, "--USER__colCount", 0, &["auto", "1", "2"]),
            UserProperty::incrementable(WORD_SPACING, "--USER__wordSpacing", 0.0, 0.0, 0.5, 0.25),
            UserProperty::incrementable(LETTER_SPACING, "--USER__letterSpacing", 0.0, 0.0, 0.5, 0.0625),
            UserProperty::incrementable(PAGE_MARGINS, "--USER__pageMargins", 1.0, 0.5, 4.0, 0.25),
            UserProperty::incrementable(LINE_HEIGHT, "--USER__lineHeight", 1.0, 1.0, 2.0, 0.25),
        ])
    }
}

/// Background and foreground colors matching an appearance theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThemeColors {
    pub background: Color,
    pub foreground: Color,
}

impl ThemeColors {
    pub fn for_appearance(index: usize) -> Self {
        match index {
            1 => ThemeColors {
                background: Color::rgb(0xfa, 0xf4, 0xe8),
                foreground: Color::rgb(0x12, 0x12, 0x12),
            },
            2 => ThemeColors {
                background: Color::rgb(0x00, 0x00, 0x00),
                foreground: Color::rgb(0xfe, 0xfe, 0xfe),
            },
            _ => ThemeColors {
                background: Color::rgb(0xff, 0xff, 0xff),
                foreground: Color::rgb(0x12, 0x12, 0x12),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedSettings {
    /// References that received a value, in property order.
    pub assigned: Vec<String>,
    /// Set when the appearance changed; chrome must be recolored.
    pub theme: Option<ThemeColors>,
}

impl AppliedSettings {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }
}

enum Assignment {
    Index(usize),
    Value(f32),
    Flag(bool),
}

fn coerce(property: &UserProperty, value: &SettingValue) -> BridgeResult<Assignment> {
    let mismatch = || BridgeError::TypeMismatch {
        reference: property.reference.clone(),
        expected: property.kind.expected(),
    };

    match &property.kind {
        PropertyKind::Enumerable { values, .. } => value
            .as_index()
            .filter(|index| *index < values.len())
            .map(Assignment::Index)
            .ok_or_else(mismatch),
        PropertyKind::Incrementable { min, max, .. } => value
            .as_number()
            .map(|number| Assignment::Value((number as f32).clamp(*min, *max)))
            .ok_or_else(mismatch),
        PropertyKind::Switchable { .. } => value.as_flag().map(Assignment::Flag).ok_or_else(mismatch),
    }
}

/// Assigns every value of `map` whose key names a property.
///
/// The whole map is validated first: on a type mismatch no property is
/// modified.
pub fn apply_settings(properties: &mut UserProperties, map: &SettingsMap) -> BridgeResult<AppliedSettings> {
    let mut assignments = Vec::new();
    for (position, property) in properties.properties.iter().enumerate() {
        let Some(value) = map.get(&property.reference) else {
            continue;
        };
        assignments.push((position, coerce(property, value)?));
    }

    let mut applied = AppliedSettings::default();
    for (position, assignment) in assignments {
        let property = &mut properties.properties[position];
        match (&mut property.kind, assignment) {
            (PropertyKind::Enumerable { index, .. }, Assignment::Index(next)) => *index = next,
            (PropertyKind::Incrementable { value, .. }, Assignment::Value(next)) => *value = next,
            (PropertyKind::Switchable { on }, Assignment::Flag(next)) => *on = next,
            _ => unreachable!("assignment kind is derived from the property kind"),
        }
        trace!(reference = %property.reference, "assigned user property");
        if property.reference == reference::APPEARANCE {
            if let PropertyKind::Enumerable { index, .. } = property.kind {
                applied.theme = Some(ThemeColors::for_appearance(index));
            }
        }
        applied.assigned.push(property.reference.clone());
    }

    Ok(applied)
}

/// Settings state owned by a reader host.
#[derive(Debug, Default)]
pub struct SettingsBridge {
    pending: Option<SettingsMap>,
    effective: SettingsMap,
}

impl SettingsBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps `map` until a navigator is mounted. Only the latest deferred
    /// map survives.
    pub fn defer(&mut self, map: SettingsMap) {
        debug!(keys = map.len(), "deferring settings until the navigator is ready");
        self.pending = Some(map);
    }

    /// Assigns `map` to the navigator's user properties, then recolors the
    /// chrome if needed and runs a single style pass.
    pub fn apply(&mut self, navigator: &mut dyn Navigator, map: SettingsMap) -> BridgeResult<()> {
        let mut properties = navigator.user_properties();
        let applied = apply_settings(&mut properties, &map)?;
        self.effective.merge(&map);
        if applied.is_empty() {
            return Ok(());
        }

        navigator.set_user_properties(properties);
        if let Some(colors) = applied.theme {
            navigator.apply_chrome_colors(colors);
        }
        navigator.update_user_settings_style();
        Ok(())
    }

    /// Applies the deferred map, if any, exactly once. Settings applied to
    /// an earlier navigator are applied again underneath it, so the reader
    /// keeps its look across files.
    pub fn replay(&mut self, navigator: &mut dyn Navigator) -> BridgeResult<()> {
        let pending = self.pending.take();
        if self.effective.is_empty() {
            return match pending {
                Some(map) => self.apply(navigator, map),
                None => Ok(()),
            };
        }

        let mut map = self.effective.clone();
        if let Some(pending) = pending {
            map.merge(&pending);
        }
        debug!(keys = map.len(), "replaying settings onto new navigator");
        self.apply(navigator, map)
    }

    pub fn pending(&self) -> Option<&SettingsMap> {
        self.pending.as_ref()
    }

    pub fn clear(&mut self) {
        self.pending = None;
        self.effective = SettingsMap::new();
    }
}
