//! The view host adapter.
//!
//! `ReaderHost` receives property updates from the embedding host in any
//! order, opens the publication in the background, and forwards whatever
//! the mounted navigator reports as [`BridgeEvent`]s. Properties that
//! arrive before the navigator is ready are held and replayed once.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::BridgeConfig;
use crate::decorations::{HighlightAction, HighlightBridge, HighlightMenu, HIGHLIGHT_GROUP};
use crate::navigator::{Navigator, NavigatorEvent, NavigatorFactory, SubscriptionId};
use crate::selection::{handle_selection_action, translate_action};
use crate::settings::SettingsBridge;
use crate::{BridgeError, BridgeEvent, BridgeResult, FileDescriptor, Highlight, Location, SettingsMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPhase {
    /// No publication requested yet, or the last open failed.
    Unmounted,
    Loading,
    Ready,
    /// Torn down; further updates are ignored.
    Detached,
}

struct LoadOutcome {
    generation: u64,
    result: BridgeResult<Box<dyn Navigator>>,
}

struct Mounted {
    navigator: Box<dyn Navigator>,
    subscriptions: Vec<SubscriptionId>,
    events: mpsc::UnboundedReceiver<NavigatorEvent>,
}

enum Phase {
    Unmounted,
    Loading { generation: u64, task: JoinHandle<()> },
    Ready(Mounted),
    Detached,
}

enum Wake {
    Load(LoadOutcome),
    Navigator(NavigatorEvent),
}

pub struct ReaderHost {
    factory: Arc<dyn NavigatorFactory>,
    phase: Phase,
    generation: u64,
    location: Option<Location>,
    settings: SettingsBridge,
    highlights: HighlightBridge,
    outbound: mpsc::UnboundedSender<BridgeEvent>,
    loads_tx: mpsc::UnboundedSender<LoadOutcome>,
    loads_rx: mpsc::UnboundedReceiver<LoadOutcome>,
}

impl ReaderHost {
    pub fn new(factory: Arc<dyn NavigatorFactory>) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        Self::with_config(factory, &BridgeConfig::default())
    }

    pub fn with_config(
        factory: Arc<dyn NavigatorFactory>,
        config: &BridgeConfig,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (outbound, events) = mpsc::unbounded_channel();
        let (loads_tx, loads_rx) = mpsc::unbounded_channel();
        let host = Self {
            factory,
            phase: Phase::Unmounted,
            generation: 0,
            location: None,
            settings: SettingsBridge::new(),
            highlights: HighlightBridge::new(config.highlights.tint),
            outbound,
            loads_tx,
            loads_rx,
        };
        (host, events)
    }

    pub fn phase(&self) -> HostPhase {
        match self.phase {
            Phase::Unmounted => HostPhase::Unmounted,
            Phase::Loading { .. } => HostPhase::Loading,
            Phase::Ready(_) => HostPhase::Ready,
            Phase::Detached => HostPhase::Detached,
        }
    }

    pub fn navigator(&self) -> Option<&dyn Navigator> {
        match &self.phase {
            Phase::Ready(mounted) => Some(mounted.navigator.as_ref()),
            _ => None,
        }
    }

    pub fn highlights(&self) -> &[Highlight] {
        self.highlights.highlights()
    }

    pub fn pending_settings(&self) -> Option<&SettingsMap> {
        self.settings.pending()
    }

    /// Starts opening `file` in the background. Any navigator already
    /// mounted is released first and an open still in flight is abandoned.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self, file), fields(url = %file.url))]
    pub fn set_file(&mut self, file: FileDescriptor) {
        if matches!(self.phase, Phase::Detached) {
            debug!("ignoring file after unmount");
            return;
        }
        self.release();
        self.location = file.initial_location.clone();

        self.generation += 1;
        let generation = self.generation;
        let factory = Arc::clone(&self.factory);
        let loads = self.loads_tx.clone();
        let task = tokio::spawn(async move {
            let result = factory.open(&file).await;
            // The host may be gone; nobody is waiting for the result then.
            let _ = loads.send(LoadOutcome { generation, result });
        });
        self.phase = Phase::Loading { generation, task };
        info!(generation, "opening publication");
    }

    /// Moves the navigator to `location` unless it is already there.
    pub fn set_location(&mut self, location: Location) {
        match &mut self.phase {
            Phase::Detached => {}
            Phase::Ready(mounted) => {
                go_to_location(mounted.navigator.as_mut(), &location);
                self.location = Some(location);
            }
            _ => self.location = Some(location),
        }
    }

    pub fn set_settings(&mut self, map: SettingsMap) -> BridgeResult<()> {
        match &mut self.phase {
            Phase::Ready(mounted) => self.settings.apply(mounted.navigator.as_mut(), map),
            Phase::Detached => Ok(()),
            _ => {
                self.settings.defer(map);
                Ok(())
            }
        }
    }

    /// Replaces every highlight decoration with `highlights`.
    pub fn set_highlights(&mut self, highlights: Vec<Highlight>) {
        if matches!(self.phase, Phase::Detached) {
            return;
        }
        self.highlights.set_highlights(highlights);
        if let Phase::Ready(mounted) = &mut self.phase {
            self.highlights.replay(mounted.navigator.as_mut());
        }
    }

    pub fn highlight_menu(&self) -> Option<&HighlightMenu> {
        self.highlights.menu()
    }

    /// Resolves the open highlight menu. Returns false if no menu was open.
    pub fn choose_highlight_action(&mut self, action: HighlightAction) -> bool {
        match self.highlights.choose(action) {
            Some(event) => {
                emit(&self.outbound, event);
                true
            }
            None => false,
        }
    }

    pub fn dismiss_highlight_menu(&mut self) {
        self.highlights.dismiss_menu();
    }

    /// Handles everything already queued without waiting. Returns how many
    /// items were processed; stops at the first error.
    pub fn pump(&mut self) -> BridgeResult<usize> {
        let mut handled = 0;
        loop {
            let wake = if let Ok(outcome) = self.loads_rx.try_recv() {
                Wake::Load(outcome)
            } else if let Phase::Ready(mounted) = &mut self.phase {
                match mounted.events.try_recv() {
                    Ok(event) => Wake::Navigator(event),
                    Err(_) => break,
                }
            } else {
                break;
            };
            self.handle(wake)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Waits for the next load result or navigator event and handles it.
    /// Returns false when there is nothing left to wait for.
    pub async fn tick(&mut self) -> BridgeResult<bool> {
        let wake = match &mut self.phase {
            Phase::Loading { .. } => match self.loads_rx.recv().await {
                Some(outcome) => Wake::Load(outcome),
                None => return Ok(false),
            },
            Phase::Ready(mounted) => {
                tokio::select! {
                    Some(outcome) = self.loads_rx.recv() => Wake::Load(outcome),
                    Some(event) = mounted.events.recv() => Wake::Navigator(event),
                    else => return Ok(false),
                }
            }
            Phase::Unmounted | Phase::Detached => return Ok(false),
        };
        self.handle(wake)?;
        Ok(true)
    }

    /// Drives the host until the requested publication is mounted.
    pub async fn wait_ready(&mut self) -> BridgeResult<()> {
        loop {
            match self.phase() {
                HostPhase::Ready => return Ok(()),
                HostPhase::Loading => {
                    self.tick().await?;
                }
                HostPhase::Unmounted | HostPhase::Detached => return Err(BridgeError::Cancelled),
            }
        }
    }

    /// Tears the host down: listeners are removed before the navigator is
    /// dropped, a pending open is abandoned and held state is discarded.
    pub fn unmount(&mut self) {
        self.release();
        self.phase = Phase::Detached;
        self.settings.clear();
        self.highlights.clear();
        self.location = None;
        while self.loads_rx.try_recv().is_ok() {}
        info!("reader host detached");
    }

    fn release(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Unmounted) {
            Phase::Loading { generation, task } => {
                debug!(generation, "abandoning pending open");
                task.abort();
            }
            Phase::Ready(mounted) => teardown(mounted),
            other => self.phase = other,
        }
        self.highlights.dismiss_menu();
    }

    fn handle(&mut self, wake: Wake) -> BridgeResult<()> {
        match wake {
            Wake::Load(outcome) => self.finish_load(outcome),
            Wake::Navigator(event) => {
                self.handle_navigator_event(event);
                Ok(())
            }
        }
    }

    fn finish_load(&mut self, outcome: LoadOutcome) -> BridgeResult<()> {
        let current = match &self.phase {
            Phase::Loading { generation, .. } => *generation == outcome.generation,
            _ => false,
        };
        if !current {
            debug!(generation = outcome.generation, "discarding stale load result");
            return Ok(());
        }

        self.phase = Phase::Unmounted;
        match outcome.result {
            Ok(navigator) => self.mount(navigator),
            Err(err) => {
                warn!(error = %err, "failed to open publication");
                Err(err)
            }
        }
    }

    fn mount(&mut self, mut navigator: Box<dyn Navigator>) -> BridgeResult<()> {
        let (sink, events) = mpsc::unbounded_channel();
        let subscriptions = vec![
            navigator.subscribe(sink.clone()),
            navigator.add_decoration_listener(HIGHLIGHT_GROUP, sink),
        ];
        navigator.add_selection_action(translate_action());

        let replayed = self.settings.replay(navigator.as_mut());
        self.highlights.replay(navigator.as_mut());
        if let Some(location) = &self.location {
            go_to_location(navigator.as_mut(), location);
        }

        let toc = navigator.table_of_contents();
        self.phase = Phase::Ready(Mounted {
            navigator,
            subscriptions,
            events,
        });
        info!(entries = toc.len(), "navigator ready");
        emit(&self.outbound, BridgeEvent::TocLoaded((!toc.is_empty()).then_some(toc)));
        replayed
    }

    fn handle_navigator_event(&mut self, event: NavigatorEvent) {
        let Phase::Ready(mounted) = &mut self.phase else {
            return;
        };
        match event {
            NavigatorEvent::LocationChanged(locator) => {
                emit(&self.outbound, BridgeEvent::LocationChanged(locator))
            }
            NavigatorEvent::SelectionActionInvoked { action } => {
                if let Some(event) = handle_selection_action(mounted.navigator.as_mut(), &action) {
                    emit(&self.outbound, event);
                }
            }
            NavigatorEvent::DecorationActivated(activation) => {
                if let Some(menu) = self.highlights.activate(&activation) {
                    debug!(highlight = menu.highlight_id, "highlight menu opened");
                }
            }
        }
    }
}

impl Drop for ReaderHost {
    fn drop(&mut self) {
        self.release();
    }
}

fn teardown(mounted: Mounted) {
    let Mounted {
        mut navigator,
        subscriptions,
        events,
    } = mounted;
    for id in subscriptions {
        navigator.unsubscribe(id);
    }
    drop(events);
    drop(navigator);
}

fn go_to_location(navigator: &mut dyn Navigator, location: &Location) -> bool {
    let locator = match location {
        Location::Locator(locator) => locator.clone(),
        Location::Link(link) => match navigator.locate(link) {
            Some(locator) => locator,
            None => {
                warn!(href = %link.href, "link does not resolve in this publication");
                return false;
            }
        },
    };
    if navigator.current_location().as_ref() == Some(&locator) {
        trace!(href = %locator.href, "already at requested location");
        return false;
    }
    navigator.go(&locator, true)
}

fn emit(outbound: &mpsc::UnboundedSender<BridgeEvent>, event: BridgeEvent) {
    if outbound.send(event).is_err() {
        trace!("no one is listening for bridge events");
    }
}
