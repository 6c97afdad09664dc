use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::HostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShortcutLocation {
    Desktop,
    StartMenu,
    Startup,
    AppRoot,
}

impl ShortcutLocation {
    pub const DEFAULT: [ShortcutLocation; 2] = [ShortcutLocation::StartMenu, ShortcutLocation::Desktop];

    pub const ALL: [ShortcutLocation; 4] = [
        ShortcutLocation::Desktop,
        ShortcutLocation::StartMenu,
        ShortcutLocation::Startup,
        ShortcutLocation::AppRoot,
    ];
}

impl fmt::Display for ShortcutLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Desktop => write!(f, "Desktop"),
            Self::StartMenu => write!(f, "StartMenu"),
            Self::Startup => write!(f, "Startup"),
            Self::AppRoot => write!(f, "AppRoot"),
        }
    }
}

impl FromStr for ShortcutLocation {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Desktop" => Ok(Self::Desktop),
            "StartMenu" => Ok(Self::StartMenu),
            "Startup" => Ok(Self::Startup),
            "AppRoot" => Ok(Self::AppRoot),
            other => Err(HostError::InvalidLocation {
                value: other.to_string(),
            }),
        }
    }
}

/// Parse a comma-separated location list such as `Desktop,StartMenu`.
///
/// A blank or missing list yields [`ShortcutLocation::DEFAULT`]. Duplicates
/// are collapsed.
///
/// # Errors
/// Returns [`HostError::InvalidLocation`] for an unknown location name.
pub fn parse_shortcut_locations(raw: Option<&str>) -> Result<Vec<ShortcutLocation>, HostError> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(ShortcutLocation::DEFAULT.to_vec());
    };

    let mut locations = raw
        .split(',')
        .map(str::parse)
        .collect::<Result<Vec<ShortcutLocation>, _>>()?;
    locations.sort();
    locations.dedup();
    Ok(locations)
}

/// What the uninstall registration records about an installed application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallMetadata {
    pub app_name: String,
    pub display_name: String,
    pub version: String,
    pub publisher: Option<String>,
    pub install_dir: PathBuf,
    pub updater_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::{ShortcutLocation, parse_shortcut_locations};
    use crate::HostError;

    #[test]
    fn missing_list_uses_default_locations() {
        assert_eq!(
            parse_shortcut_locations(None).expect("default should parse"),
            ShortcutLocation::DEFAULT.to_vec()
        );
        assert_eq!(
            parse_shortcut_locations(Some("  ")).expect("blank should parse"),
            ShortcutLocation::DEFAULT.to_vec()
        );
    }

    #[test]
    fn parses_and_deduplicates_list() {
        let parsed = parse_shortcut_locations(Some("Startup, Desktop,Startup"))
            .expect("list should parse");
        assert_eq!(
            parsed,
            vec![ShortcutLocation::Desktop, ShortcutLocation::Startup]
        );
    }

    #[test]
    fn rejects_unknown_location() {
        let error = parse_shortcut_locations(Some("Desktop,Taskbar"))
            .expect_err("unknown location should fail");
        assert_eq!(
            error,
            HostError::InvalidLocation {
                value: "Taskbar".to_string()
            }
        );
    }
}
