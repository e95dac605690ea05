//! Headless navigator over an opened EPUB.
//!
//! Nothing is rendered. The navigator keeps the state a visual engine would
//! keep (position, user properties, the computed reading style, decoration
//! groups, selection) so the bridge can be driven end to end. An
//! [`InteractionHandle`] stands in for the user: it selects text, taps
//! decorations and turns pages, and the navigator reports those gestures to
//! its subscribers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use epubridge_core::decorations::Decoration;
use epubridge_core::navigator::{EventSink, SubscriptionId};
use epubridge_core::settings::reference;
use epubridge_core::{
    BridgeError, BridgeResult, DecorationActivation, FileDescriptor, Link, Location, Locator,
    Navigator, NavigatorEvent, NavigatorFactory, PropertyKind, Rect, Selection, SelectionAction,
    ThemeColors, UserProperties, UserProperty,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, instrument, trace, warn};

use crate::publication::Publication;

/// Toolbar entries the engine shows for every selection.
pub const DEFAULT_SELECTION_ACTIONS: [(&str, &str); 3] =
    [("copy", "Copy"), ("share", "Share"), ("lookup", "Look Up")];

struct Listener {
    id: SubscriptionId,
    /// `None` for general events, otherwise the decoration group.
    group: Option<String>,
    sink: EventSink,
}

struct NavigatorState {
    location: Option<Locator>,
    properties: UserProperties,
    style: BTreeMap<String, String>,
    style_passes: u64,
    chrome: Option<ThemeColors>,
    decorations: BTreeMap<String, Vec<Decoration>>,
    selection_actions: Vec<SelectionAction>,
    selection: Option<Selection>,
    listeners: Vec<Listener>,
    next_subscription: u64,
}

impl NavigatorState {
    fn new(location: Option<Locator>) -> Self {
        let properties = UserProperties::default();
        Self {
            location,
            style: reading_style(&properties),
            properties,
            style_passes: 0,
            chrome: None,
            decorations: BTreeMap::new(),
            selection_actions: DEFAULT_SELECTION_ACTIONS
                .iter()
                .map(|(id, title)| SelectionAction::new(*id, *title))
                .collect(),
            selection: None,
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    fn listen(&mut self, group: Option<String>, sink: EventSink) -> SubscriptionId {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.listeners.push(Listener { id, group, sink });
        id
    }

    fn notify(&self, group: Option<&str>, event: NavigatorEvent) {
        for listener in self.listeners.iter().filter(|l| l.group.as_deref() == group) {
            if listener.sink.send(event.clone()).is_err() {
                trace!(subscription = listener.id.0, "listener channel closed");
            }
        }
    }

    fn move_to(&mut self, locator: Locator) {
        self.location = Some(locator.clone());
        self.selection = None;
        self.notify(None, NavigatorEvent::LocationChanged(locator));
    }
}

/// The CSS custom properties the current user properties map onto.
pub fn reading_style(properties: &UserProperties) -> BTreeMap<String, String> {
    properties
        .iter()
        .map(|property| (property.name.clone(), css_value(property)))
        .collect()
}

fn css_value(property: &UserProperty) -> String {
    match &property.kind {
        PropertyKind::Enumerable { index, values } => values.get(*index).cloned().unwrap_or_default(),
        PropertyKind::Incrementable { value, .. } => match property.reference.as_str() {
            reference::FONT_SIZE => format!("{value}%"),
            reference::WORD_SPACING | reference::LETTER_SPACING => format!("{value}rem"),
            _ => value.to_string(),
        },
        PropertyKind::Switchable { on } => {
            let flag = match property.reference.as_str() {
                reference::FONT_OVERRIDE => "font",
                reference::PUBLISHER_DEFAULT => "advanced",
                other => other,
            };
            format!("readium-{flag}-{}", if *on { "on" } else { "off" })
        }
    }
}

pub struct EpubNavigator {
    publication: Arc<Publication>,
    state: Arc<Mutex<NavigatorState>>,
}

impl EpubNavigator {
    /// Opens at `initial` when it points into the publication, else at the
    /// first resource of the reading order.
    pub fn new(publication: Arc<Publication>, initial: Option<&Location>) -> Self {
        let requested = initial.and_then(|location| match location {
            Location::Locator(locator) => publication
                .resource(locator.resource_href())
                .map(|_| locator.clone()),
            Location::Link(link) => locate_in(&publication, link),
        });
        if initial.is_some() && requested.is_none() {
            warn!("initial location is not part of the publication; opening at the start");
        }
        let location = requested.or_else(|| publication.start());
        Self {
            state: Arc::new(Mutex::new(NavigatorState::new(location))),
            publication,
        }
    }

    pub fn interaction(&self) -> InteractionHandle {
        InteractionHandle {
            publication: Arc::clone(&self.publication),
            state: Arc::clone(&self.state),
        }
    }
}

fn locate_in(publication: &Publication, link: &Link) -> Option<Locator> {
    let mut locator = publication.locator_for(&link.href)?;
    if let Some((_, fragment)) = link.href.split_once('#') {
        let locations = locator.locations.get_or_insert_with(Map::new);
        locations.insert("fragments".to_string(), Value::from(vec![fragment.to_string()]));
    }
    if link.title.is_some() {
        locator.title = link.title.clone();
    }
    Some(locator)
}

impl Navigator for EpubNavigator {
    fn table_of_contents(&self) -> Vec<Link> {
        self.publication.table_of_contents().to_vec()
    }

    fn current_location(&self) -> Option<Locator> {
        self.state.lock().location.clone()
    }

    fn locate(&self, link: &Link) -> Option<Locator> {
        locate_in(&self.publication, link)
    }

    fn go(&mut self, locator: &Locator, _animated: bool) -> bool {
        if self.publication.resource(locator.resource_href()).is_none() {
            debug!(href = %locator.href, "locator is outside the reading order");
            return false;
        }
        self.state.lock().move_to(locator.clone());
        true
    }

    fn user_properties(&self) -> UserProperties {
        self.state.lock().properties.clone()
    }

    fn set_user_properties(&mut self, properties: UserProperties) {
        self.state.lock().properties = properties;
    }

    fn update_user_settings_style(&mut self) {
        let mut state = self.state.lock();
        state.style = reading_style(&state.properties);
        state.style_passes += 1;
    }

    fn apply_chrome_colors(&mut self, colors: ThemeColors) {
        self.state.lock().chrome = Some(colors);
    }

    fn apply_decorations(&mut self, decorations: Vec<Decoration>, group: &str) {
        trace!(group, count = decorations.len(), "replacing decorations");
        self.state.lock().decorations.insert(group.to_string(), decorations);
    }

    fn add_selection_action(&mut self, action: SelectionAction) {
        let mut state = self.state.lock();
        if !state.selection_actions.iter().any(|a| a.id == action.id) {
            state.selection_actions.push(action);
        }
    }

    fn current_selection(&self) -> Option<Selection> {
        self.state.lock().selection.clone()
    }

    fn clear_selection(&mut self) {
        self.state.lock().selection = None;
    }

    fn subscribe(&mut self, sink: EventSink) -> SubscriptionId {
        self.state.lock().listen(None, sink)
    }

    fn add_decoration_listener(&mut self, group: &str, sink: EventSink) -> SubscriptionId {
        self.state.lock().listen(Some(group.to_string()), sink)
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        self.state.lock().listeners.retain(|listener| listener.id != id);
    }
}

/// User-side access to a mounted [`EpubNavigator`].
#[derive(Clone)]
pub struct InteractionHandle {
    publication: Arc<Publication>,
    state: Arc<Mutex<NavigatorState>>,
}

impl InteractionHandle {
    pub fn style(&self) -> BTreeMap<String, String> {
        self.state.lock().style.clone()
    }

    pub fn style_passes(&self) -> u64 {
        self.state.lock().style_passes
    }

    pub fn chrome(&self) -> Option<ThemeColors> {
        self.state.lock().chrome
    }

    pub fn decorations(&self, group: &str) -> Vec<Decoration> {
        self.state.lock().decorations.get(group).cloned().unwrap_or_default()
    }

    pub fn selection_actions(&self) -> Vec<SelectionAction> {
        self.state.lock().selection_actions.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Selects text at `locator`. Returns false if it is outside the
    /// publication.
    pub fn select(&self, locator: Locator) -> bool {
        if self.publication.resource(locator.resource_href()).is_none() {
            return false;
        }
        self.state.lock().selection = Some(Selection { locator });
        true
    }

    /// Presses a selection toolbar entry. Only entries shown on the toolbar
    /// can be pressed, and only while something is selected.
    pub fn press_selection_action(&self, action: &str) -> bool {
        let state = self.state.lock();
        if state.selection.is_none() || !state.selection_actions.iter().any(|a| a.id == action) {
            return false;
        }
        state.notify(
            None,
            NavigatorEvent::SelectionActionInvoked {
                action: action.to_string(),
            },
        );
        true
    }

    /// Taps the decoration `decoration_id`, reporting it with `rect` as the
    /// tapped area.
    pub fn tap_decoration(&self, decoration_id: &str, rect: Rect) -> bool {
        let state = self.state.lock();
        let found = state.decorations.iter().find_map(|(group, decorations)| {
            decorations
                .iter()
                .find(|d| d.id == decoration_id)
                .map(|d| (group.clone(), d.payload.clone()))
        });
        let Some((group, payload)) = found else {
            debug!(decoration_id, "no decoration under tap");
            return false;
        };
        state.notify(
            Some(group.as_str()),
            NavigatorEvent::DecorationActivated(DecorationActivation {
                group: group.clone(),
                decoration_id: decoration_id.to_string(),
                payload: Some(payload),
                rect: Some(rect),
            }),
        );
        true
    }

    /// Turns to the start of the resource `href`, as a swipe or link tap
    /// would.
    pub fn turn_to(&self, href: &str) -> bool {
        match self.publication.locator_for(href) {
            Some(locator) => {
                self.state.lock().move_to(locator);
                true
            }
            None => false,
        }
    }
}

/// Opens EPUBs from local paths or `file://` URLs.
#[derive(Default)]
pub struct EpubNavigatorFactory {
    latest: Mutex<Option<InteractionHandle>>,
}

impl EpubNavigatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The interaction handle of the navigator opened most recently.
    pub fn interaction(&self) -> Option<InteractionHandle> {
        self.latest.lock().clone()
    }
}

#[async_trait]
impl NavigatorFactory for EpubNavigatorFactory {
    #[instrument(skip(self, file), fields(url = %file.url))]
    async fn open(&self, file: &FileDescriptor) -> BridgeResult<Box<dyn Navigator>> {
        let path = file.local_path()?;
        let publication = tokio::task::spawn_blocking(move || Publication::open(&path))
            .await
            .map_err(|_| BridgeError::Cancelled)?
            .map_err(BridgeError::OpenFailed)?;

        let navigator = EpubNavigator::new(Arc::new(publication), file.initial_location.as_ref());
        *self.latest.lock() = Some(navigator.interaction());
        Ok(Box::new(navigator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::write_epub;
    use epubridge_core::decorations::HIGHLIGHT_GROUP;
    use epubridge_core::{BridgeEvent, Highlight, HighlightAction, HostPhase, ReaderHost, SettingsMap};
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    const XHTML: &str = "application/xhtml+xml";

    fn open(dir: &std::path::Path) -> EpubNavigator {
        let path = write_epub(dir, "book.epub", None);
        EpubNavigator::new(Arc::new(Publication::open(&path).unwrap()), None)
    }

    fn rect() -> Rect {
        Rect {
            x: 5.0,
            y: 5.0,
            width: 80.0,
            height: 14.0,
        }
    }

    #[test]
    fn opens_at_first_resource_and_navigates_within_reading_order() {
        let dir = tempdir().unwrap();
        let mut navigator = open(dir.path());
        let (sink, mut events) = mpsc::unbounded_channel();
        navigator.subscribe(sink);

        assert_eq!(
            navigator.current_location().map(|l| l.href),
            Some("OEBPS/chapter1.xhtml".to_string())
        );
        assert!(!navigator.go(&Locator::new("OEBPS/missing.xhtml", XHTML), true));

        let target = Locator::new("OEBPS/chapter2.xhtml", XHTML).with_progression(0.4);
        assert!(navigator.go(&target, false));
        assert_eq!(events.try_recv().unwrap(), NavigatorEvent::LocationChanged(target));
    }

    #[test]
    fn locate_keeps_link_fragment() {
        let dir = tempdir().unwrap();
        let navigator = open(dir.path());
        let mut link = Link::new("OEBPS/chapter2.xhtml#sec2");
        link.title = Some("Section".to_string());

        let locator = navigator.locate(&link).unwrap();
        assert_eq!(locator.href, "OEBPS/chapter2.xhtml");
        assert_eq!(locator.title.as_deref(), Some("Section"));
        assert_eq!(locator.locations.unwrap()["fragments"], json!(["sec2"]));
        assert!(navigator.locate(&Link::new("OEBPS/nav.xhtml")).is_none());
    }

    #[test]
    fn initial_location_outside_publication_falls_back_to_start() {
        let dir = tempdir().unwrap();
        let path = write_epub(dir.path(), "book.epub", None);
        let publication = Arc::new(Publication::open(&path).unwrap());

        let stray = Location::Locator(Locator::new("elsewhere.xhtml", XHTML));
        let navigator = EpubNavigator::new(Arc::clone(&publication), Some(&stray));
        assert_eq!(navigator.current_location(), publication.start());

        let link = Location::Link(Link::new("OEBPS/chapter2.xhtml"));
        let navigator = EpubNavigator::new(publication, Some(&link));
        assert_eq!(
            navigator.current_location().map(|l| l.href),
            Some("OEBPS/chapter2.xhtml".to_string())
        );
    }

    #[test]
    fn style_pass_recomputes_css_properties() {
        let dir = tempdir().unwrap();
        let mut navigator = open(dir.path());
        let handle = navigator.interaction();
        assert_eq!(handle.style()["--USER__appearance"], "readium-default-on");

        let mut properties = navigator.user_properties();
        epubridge_core::settings::apply_settings(
            &mut properties,
            &SettingsMap::new()
                .with(reference::APPEARANCE, 2)
                .with(reference::FONT_SIZE, 150.0)
                .with(reference::SCROLL, true),
        )
        .unwrap();
        navigator.set_user_properties(properties);
        assert_eq!(handle.style()["--USER__appearance"], "readium-default-on");

        navigator.update_user_settings_style();
        let style = handle.style();
        assert_eq!(style["--USER__appearance"], "readium-night-on");
        assert_eq!(style["--USER__fontSize"], "150%");
        assert_eq!(style["--USER__scroll"], "readium-scroll-on");
        assert_eq!(style["--USER__fontOverride"], "readium-font-off");
        assert_eq!(handle.style_passes(), 1);
    }

    #[test]
    fn decoration_taps_reach_group_listeners_only() {
        let dir = tempdir().unwrap();
        let mut navigator = open(dir.path());
        let handle = navigator.interaction();
        let (general, mut general_rx) = mpsc::unbounded_channel();
        let (group, mut group_rx) = mpsc::unbounded_channel();
        navigator.subscribe(general);
        let id = navigator.add_decoration_listener(HIGHLIGHT_GROUP, group);

        let highlight = Highlight {
            id: 7,
            locator: Locator::new("OEBPS/chapter1.xhtml", XHTML),
        };
        navigator.apply_decorations(
            vec![Decoration::from_highlight(&highlight, epubridge_core::decorations::DEFAULT_TINT)],
            HIGHLIGHT_GROUP,
        );

        assert!(handle.tap_decoration("7-highlight", rect()));
        match group_rx.try_recv().unwrap() {
            NavigatorEvent::DecorationActivated(activation) => {
                assert_eq!(activation.payload, Some(json!(7)));
                assert_eq!(activation.rect, Some(rect()));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(general_rx.try_recv().is_err());
        assert!(!handle.tap_decoration("8-highlight", rect()));

        navigator.unsubscribe(id);
        assert!(handle.tap_decoration("7-highlight", rect()));
        assert!(group_rx.try_recv().is_err());
    }

    #[test]
    fn selection_actions_need_a_selection_and_a_toolbar_entry() {
        let dir = tempdir().unwrap();
        let mut navigator = open(dir.path());
        let handle = navigator.interaction();
        let (sink, mut events) = mpsc::unbounded_channel();
        navigator.subscribe(sink);
        navigator.add_selection_action(SelectionAction::new("translate", "Translate"));
        navigator.add_selection_action(SelectionAction::new("translate", "Translate"));

        let ids: Vec<String> = handle.selection_actions().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["copy", "share", "lookup", "translate"]);

        assert!(!handle.press_selection_action("translate"));
        assert!(handle.select(Locator::new("OEBPS/chapter1.xhtml", XHTML)));
        assert!(!handle.press_selection_action("bookmark"));
        assert!(handle.press_selection_action("translate"));
        assert_eq!(
            events.try_recv().unwrap(),
            NavigatorEvent::SelectionActionInvoked {
                action: "translate".to_string()
            }
        );
    }

    #[tokio::test]
    async fn factory_rejects_missing_and_remote_publications() {
        let factory = EpubNavigatorFactory::new();
        let missing = factory.open(&FileDescriptor::new("/nonexistent/book.epub")).await;
        assert!(matches!(missing, Err(BridgeError::OpenFailed(_))));

        let remote = factory.open(&FileDescriptor::new("https://example.com/book.epub")).await;
        assert!(matches!(remote, Err(BridgeError::OpenFailed(_))));
        assert!(factory.interaction().is_none());
    }

    #[tokio::test]
    async fn host_drives_the_headless_navigator() {
        let dir = tempdir().unwrap();
        let path = write_epub(dir.path(), "book.epub", None);
        let url = url::Url::from_file_path(&path).unwrap().to_string();

        let factory = Arc::new(EpubNavigatorFactory::new());
        let (mut host, mut events) = ReaderHost::new(factory.clone());
        host.set_settings(SettingsMap::new().with(reference::APPEARANCE, 1)).unwrap();
        host.set_highlights(vec![Highlight {
            id: 3,
            locator: Locator::new("OEBPS/chapter2.xhtml", XHTML),
        }]);
        host.set_file(FileDescriptor::new(url));
        host.wait_ready().await.unwrap();
        assert_eq!(host.phase(), HostPhase::Ready);

        let handle = factory.interaction().unwrap();
        assert_eq!(handle.chrome(), Some(ThemeColors::for_appearance(1)));
        assert_eq!(handle.style()["--USER__appearance"], "readium-sepia-on");
        assert_eq!(handle.decorations(HIGHLIGHT_GROUP).len(), 1);
        match events.try_recv().unwrap() {
            BridgeEvent::TocLoaded(Some(toc)) => assert_eq!(toc.len(), 2),
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(handle.turn_to("OEBPS/chapter2.xhtml"));
        host.pump().unwrap();
        match events.try_recv().unwrap() {
            BridgeEvent::LocationChanged(locator) => assert_eq!(locator.href, "OEBPS/chapter2.xhtml"),
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(handle.tap_decoration("3-highlight", rect()));
        host.pump().unwrap();
        assert!(host.choose_highlight_action(HighlightAction::Delete));
        assert_eq!(events.try_recv().unwrap(), BridgeEvent::HighlightDeleteRequested { id: 3 });

        host.unmount();
        assert_eq!(handle.listener_count(), 0);
    }
}
