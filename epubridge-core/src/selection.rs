use tracing::debug;

use crate::navigator::{Navigator, SelectionAction};
use crate::BridgeEvent;

pub const TRANSLATE_ACTION: &str = "translate";

/// The custom toolbar entry, added next to the engine's own actions.
pub fn translate_action() -> SelectionAction {
    SelectionAction::new(TRANSLATE_ACTION, "Translate")
}

/// Handles a selection toolbar action reported by the navigator.
///
/// For "Translate", the current selection is handed to the host and then
/// cleared. Without a selection nothing happens.
pub fn handle_selection_action(navigator: &mut dyn Navigator, action: &str) -> Option<BridgeEvent> {
    if action != TRANSLATE_ACTION {
        debug!(action, "ignoring selection action handled by the engine");
        return None;
    }
    let selection = navigator.current_selection()?;
    navigator.clear_selection();
    Some(BridgeEvent::TranslateRequested(selection.locator))
}
