use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::decorations::{Decoration, DecorationActivation};
use crate::settings::{ThemeColors, UserProperties};
use crate::{BridgeResult, FileDescriptor, Link, Locator};

pub type EventSink = mpsc::UnboundedSender<NavigatorEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Raw events a navigator reports to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum NavigatorEvent {
    LocationChanged(Locator),
    SelectionActionInvoked { action: String },
    DecorationActivated(DecorationActivation),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub locator: Locator,
}

/// An entry of the text-selection toolbar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionAction {
    pub id: String,
    pub title: String,
}

impl SelectionAction {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

/// The wrapped reading engine, as seen by the bridge.
///
/// Rendering, pagination and decoration drawing stay behind this trait;
/// the bridge only feeds it configuration and listens to what it reports.
pub trait Navigator: Send {
    fn table_of_contents(&self) -> Vec<Link>;
    fn current_location(&self) -> Option<Locator>;
    /// Resolves a link (typically a TOC entry) to a locator in this publication.
    fn locate(&self, link: &Link) -> Option<Locator>;
    /// Returns false when the locator does not point into the publication.
    fn go(&mut self, locator: &Locator, animated: bool) -> bool;

    fn user_properties(&self) -> UserProperties;
    fn set_user_properties(&mut self, properties: UserProperties);
    /// Recomputes the reading style from the current user properties.
    fn update_user_settings_style(&mut self);
    fn apply_chrome_colors(&mut self, colors: ThemeColors);

    /// Replaces every decoration of `group` at once.
    fn apply_decorations(&mut self, decorations: Vec<Decoration>, group: &str);

    fn add_selection_action(&mut self, action: SelectionAction);
    fn current_selection(&self) -> Option<Selection>;
    fn clear_selection(&mut self);

    /// Location changes and selection actions.
    fn subscribe(&mut self, sink: EventSink) -> SubscriptionId;
    /// Activations of decorations in `group`.
    fn add_decoration_listener(&mut self, group: &str, sink: EventSink) -> SubscriptionId;
    fn unsubscribe(&mut self, id: SubscriptionId);
}

#[async_trait]
pub trait NavigatorFactory: Send + Sync + 'static {
    async fn open(&self, file: &FileDescriptor) -> BridgeResult<Box<dyn Navigator>>;
}
