use std::collections::HashMap;

use global_hotkey::{
    GlobalHotKeyManager,
    hotkey::{Code, HotKey},
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HotkeyAction {
    Show,
    Hide,
    SendQuery,
    ScrollUp,
    ScrollDown,
}

pub const DEFAULT_BINDINGS: [(Code, HotkeyAction); 5] = [
    (Code::F8, HotkeyAction::SendQuery),
    (Code::F9, HotkeyAction::ScrollUp),
    (Code::F10, HotkeyAction::ScrollDown),
    (Code::F11, HotkeyAction::Show),
    (Code::F12, HotkeyAction::Hide),
];

#[derive(Debug, Error)]
pub enum HotkeyError {
    #[error("hotkey manager unavailable: {0}")]
    Manager(#[source] global_hotkey::Error),
    #[error("failed to register {key:?}: {source}")]
    Register {
        key: Code,
        #[source]
        source: global_hotkey::Error,
    },
}

/// Hotkey id → action lookup, cheap to move into the event handler.
#[derive(Debug, Clone, Default)]
pub struct HotkeyMap {
    actions: HashMap<u32, HotkeyAction>,
}

impl HotkeyMap {
    pub fn from_bindings(bindings: &[(Code, HotkeyAction)]) -> Self {
        let actions = bindings
            .iter()
            .map(|(code, action)| (HotKey::new(None, *code).id(), *action))
            .collect();
        Self { actions }
    }

    pub fn action_for(&self, id: u32) -> Option<HotkeyAction> {
        self.actions.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Registers the bindings system-wide. The returned manager must stay alive for them to fire.
pub fn register(
    bindings: &[(Code, HotkeyAction)],
) -> Result<(GlobalHotKeyManager, HotkeyMap), HotkeyError> {
    let manager = GlobalHotKeyManager::new().map_err(HotkeyError::Manager)?;
    for (code, _) in bindings {
        manager
            .register(HotKey::new(None, *code))
            .map_err(|source| HotkeyError::Register { key: *code, source })?;
    }
    Ok((manager, HotkeyMap::from_bindings(bindings)))
}
