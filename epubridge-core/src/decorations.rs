//! Highlights as navigator decorations, and the menu shown when one is tapped.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::navigator::Navigator;
use crate::{BridgeEvent, Color, Highlight, Locator, Rect};

pub const HIGHLIGHT_GROUP: &str = "highlights";

pub const DEFAULT_TINT: Color = Color::rgb(0xff, 0xff, 0x00);

pub fn decoration_id(highlight_id: i64) -> String {
    format!("{highlight_id}-highlight")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DecorationStyle {
    Highlight { tint: Color },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decoration {
    pub id: String,
    pub locator: Locator,
    pub style: DecorationStyle,
    /// Carried back verbatim on activation.
    pub payload: Value,
}

impl Decoration {
    pub fn from_highlight(highlight: &Highlight, tint: Color) -> Self {
        Self {
            id: decoration_id(highlight.id),
            locator: highlight.locator.clone(),
            style: DecorationStyle::Highlight { tint },
            payload: Value::from(highlight.id),
        }
    }
}

/// Reported by a navigator when the user taps a decoration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecorationActivation {
    pub group: String,
    pub decoration_id: String,
    pub payload: Option<Value>,
    pub rect: Option<Rect>,
}

/// Highlight ids are positive integers; anything else is not ours.
pub fn parse_highlight_id(payload: &Value) -> Option<i64> {
    let id = match payload {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }?;
    (id > 0).then_some(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HighlightAction {
    Show,
    Delete,
}

impl fmt::Display for HighlightAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HighlightAction::Show => f.write_str("Show"),
            HighlightAction::Delete => f.write_str("Delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HighlightMenu {
    pub highlight_id: i64,
    pub anchor: Rect,
}

impl HighlightMenu {
    pub fn actions(&self) -> [HighlightAction; 2] {
        [HighlightAction::Show, HighlightAction::Delete]
    }
}

#[derive(Debug)]
pub struct HighlightBridge {
    tint: Color,
    highlights: Option<Vec<Highlight>>,
    menu: Option<HighlightMenu>,
}

impl HighlightBridge {
    pub fn new(tint: Color) -> Self {
        Self {
            tint,
            highlights: None,
            menu: None,
        }
    }

    /// The list last supplied by the host.
    pub fn highlights(&self) -> &[Highlight] {
        self.highlights.as_deref().unwrap_or_default()
    }

    pub fn decorations(&self) -> Vec<Decoration> {
        self.highlights()
            .iter()
            .map(|highlight| Decoration::from_highlight(highlight, self.tint))
            .collect()
    }

    /// Stores the host's list; it reaches a navigator through
    /// [`HighlightBridge::replay`].
    pub fn set_highlights(&mut self, highlights: Vec<Highlight>) {
        self.highlights = Some(highlights);
    }

    /// Installs the current list on `navigator` in a single call. Does
    /// nothing if the host never sent a list.
    pub fn replay(&self, navigator: &mut dyn Navigator) {
        if self.highlights.is_some() {
            navigator.apply_decorations(self.decorations(), HIGHLIGHT_GROUP);
        }
    }

    /// Opens the highlight menu for an activation, unless one is already
    /// showing or the activation does not carry a highlight id.
    pub fn activate(&mut self, activation: &DecorationActivation) -> Option<&HighlightMenu> {
        if activation.group != HIGHLIGHT_GROUP {
            return None;
        }
        if self.menu.is_some() {
            debug!(decoration = %activation.decoration_id, "highlight menu already open");
            return None;
        }
        let Some(highlight_id) = activation.payload.as_ref().and_then(parse_highlight_id) else {
            debug!(decoration = %activation.decoration_id, "ignoring activation without highlight id");
            return None;
        };
        let anchor = activation.rect?;

        self.menu = Some(HighlightMenu { highlight_id, anchor });
        self.menu.as_ref()
    }

    pub fn menu(&self) -> Option<&HighlightMenu> {
        self.menu.as_ref()
    }

    /// Dismisses the menu and turns the choice into the host callback.
    pub fn choose(&mut self, action: HighlightAction) -> Option<BridgeEvent> {
        let menu = self.menu.take()?;
        let id = menu.highlight_id;
        Some(match action {
            HighlightAction::Show => BridgeEvent::HighlightShowRequested { id },
            HighlightAction::Delete => BridgeEvent::HighlightDeleteRequested { id },
        })
    }

    pub fn dismiss_menu(&mut self) {
        self.menu = None;
    }

    pub fn clear(&mut self) {
        self.highlights = None;
        self.menu = None;
    }
}

impl Default for HighlightBridge {
    fn default() -> Self {
        Self::new(DEFAULT_TINT)
    }
}
