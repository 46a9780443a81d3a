//! Display-mode selection for resolved names.

use serde::{Deserialize, Serialize};

use super::name_record::{is_invalid_name, NameRecord};

/// How a resolved name should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameDisplayMode {
    /// The legacy `First Last` name only.
    LegacyOnly,
    /// The display name only.
    DisplayNameOnly,
    /// Custom display name when set, legacy otherwise, with the legacy name
    /// appended in parentheses when both are present and differ.
    #[default]
    Smart,
    /// `Display Name (user.name)`.
    DisplayAndUserName,
}

impl NameDisplayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LegacyOnly => "legacy_only",
            Self::DisplayNameOnly => "display_name_only",
            Self::Smart => "smart",
            Self::DisplayAndUserName => "display_and_user_name",
        }
    }

    /// Render `record`, or `None` when it holds nothing usable for this mode.
    pub fn format(&self, record: &NameRecord) -> Option<String> {
        let display = valid(&record.display_name);
        let legacy = record.legacy_full_name();

        match self {
            Self::LegacyOnly => legacy.or_else(|| display.map(str::to_string)),
            Self::DisplayNameOnly => display.map(str::to_string).or(legacy),
            Self::Smart => match (display, legacy) {
                (Some(_), Some(legacy)) if record.is_default_display_name => Some(legacy),
                (Some(display), Some(legacy)) if display != legacy => {
                    Some(format!("{display} ({legacy})"))
                }
                (Some(display), _) => Some(display.to_string()),
                (None, legacy) => legacy,
            },
            Self::DisplayAndUserName => {
                let user = record.effective_user_name();
                match (display, user) {
                    (Some(display), Some(user)) if !display.eq_ignore_ascii_case(&user) => {
                        Some(format!("{display} ({user})"))
                    }
                    (Some(display), _) => Some(display.to_string()),
                    (None, _) => record.legacy_full_name(),
                }
            }
        }
    }
}

impl std::fmt::Display for NameDisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn valid(value: &str) -> Option<&str> {
    if is_invalid_name(value) {
        None
    } else {
        Some(value.trim())
    }
}
