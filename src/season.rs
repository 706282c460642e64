/// Work units: the four seasons plus the non-seasonal "universal" cache.
///
/// Each season maps to the numeric `Season Type` code written into the seasons
/// INI and the file suffix its grass cache outputs are renamed to.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Season {
    Winter,
    Spring,
    Summer,
    Autumn,
    Universal,
}

/// Suffix every raw grass cache file carries before renaming.
pub const RAW_SUFFIX: &str = ".cgid";

impl Season {
    pub const ALL: [Season; 5] = [
        Season::Winter,
        Season::Spring,
        Season::Summer,
        Season::Autumn,
        Season::Universal,
    ];

    /// The four real seasons, in generation order.
    pub const SEASONAL: [Season; 4] = [
        Season::Winter,
        Season::Spring,
        Season::Summer,
        Season::Autumn,
    ];

    /// Stable identifier used in lock file names, config and CLI.
    pub fn id(self) -> &'static str {
        match self {
            Season::Winter => "winter",
            Season::Spring => "spring",
            Season::Summer => "summer",
            Season::Autumn => "autumn",
            Season::Universal => "universal",
        }
    }

    /// `Season Type` value for the seasons INI. 0 means "no seasons".
    pub fn config_code(self) -> u8 {
        match self {
            Season::Winter => 1,
            Season::Spring => 2,
            Season::Summer => 3,
            Season::Autumn => 4,
            Season::Universal => 0,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Season::Winter => ".WIN.cgid",
            Season::Spring => ".SPR.cgid",
            Season::Summer => ".SUM.cgid",
            Season::Autumn => ".AUT.cgid",
            Season::Universal => RAW_SUFFIX,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Season::Winter => "Winter",
            Season::Spring => "Spring",
            Season::Summer => "Summer",
            Season::Autumn => "Autumn",
            Season::Universal => "Universal",
        }
    }

    /// True when `file_name` already carries one of the seasonal suffixes.
    pub fn has_seasonal_suffix(file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        Season::SEASONAL
            .iter()
            .any(|s| lower.ends_with(&s.suffix().to_ascii_lowercase()))
    }

    /// Whether `file_name` is an output of this work unit.
    ///
    /// Universal outputs are raw `.cgid` files that were never given a
    /// seasonal suffix.
    pub fn owns_output(self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        match self {
            Season::Universal => {
                lower.ends_with(RAW_SUFFIX) && !Season::has_seasonal_suffix(file_name)
            }
            _ => lower.ends_with(&self.suffix().to_ascii_lowercase()),
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Season {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "winter" | "win" => Ok(Season::Winter),
            "spring" | "spr" => Ok(Season::Spring),
            "summer" | "sum" => Ok(Season::Summer),
            "autumn" | "aut" | "fall" => Ok(Season::Autumn),
            "universal" | "none" | "no-seasons" | "no_seasons" => Ok(Season::Universal),
            other => Err(format!(
                "unknown season '{other}' (expected winter, spring, summer, autumn or universal)"
            )),
        }
    }
}
