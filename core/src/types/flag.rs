use serde::{Deserialize, Serialize};

/// Dark theme on/off.
pub const THEME_ENABLED: &str = "theme-enabled";
/// Menu animation on/off.
pub const MENU_ANIMATIONS_ENABLED: &str = "menu-animations-enabled";
/// Optional UI extensions on/off.
pub const UI_EXTENSIONS_ENABLED: &str = "ui-extensions-enabled";

/// Compiled-in flag definitions. Every deployment starts from this table;
/// additional per-feature flags can be registered at runtime from settings.
pub const BUILTIN_FLAGS: &[FlagSpec] = &[
    FlagSpec { key: THEME_ENABLED, default_value: true },
    FlagSpec { key: MENU_ANIMATIONS_ENABLED, default_value: false },
    FlagSpec { key: UI_EXTENSIONS_ENABLED, default_value: true },
];

/// A compile-time flag definition: key plus the value used when persistent
/// storage has no entry for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagSpec {
    pub key: &'static str,
    pub default_value: bool,
}

/// Look up the built-in default for a key, if it is one of the compiled-in flags.
pub fn builtin_default(key: &str) -> Option<bool> {
    BUILTIN_FLAGS
        .iter()
        .find(|spec| spec.key == key)
        .map(|spec| spec.default_value)
}

/// A named boolean setting synchronized across execution contexts.
///
/// Created on first read (falling back to `default_value` when absent from
/// persistent storage), mutated through the store, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub key: String,
    pub value: bool,
    pub default_value: bool,
}

impl FeatureFlag {
    pub fn new(key: &str, value: bool, default_value: bool) -> Self {
        FeatureFlag {
            key: key.to_string(),
            value,
            default_value,
        }
    }

    /// Whether the current value still matches the compiled-in default.
    pub fn is_default(&self) -> bool {
        self.value == self.default_value
    }
}
