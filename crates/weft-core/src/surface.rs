//! Data exchanged with an interactive surface.
//!
//! The surface itself (pointer, keyboard and navigation primitives against a
//! live document) lives outside the engine; see [`crate::traits::BrowserSurface`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// URL and title of the active page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
}

/// Text content extracted from the active page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContent {
    pub title: String,
    pub url: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: u64,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl FromStr for MouseButton {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            "middle" => Ok(Self::Middle),
            other => Err(format!("unknown mouse button: {}", other)),
        }
    }
}

/// A visual capture of the surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    pub media_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

/// Paired visual capture and structured listing of interactive elements.
///
/// `elements` holds one element per line in the form
/// `[index]:<tag attr="value">text</tag>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub screenshot: Option<Screenshot>,
    pub elements: String,
}

/// Events a watch can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEvent {
    /// Document structure changed.
    Dom,
    /// Desktop GUI changed.
    Gui,
    /// A watched file changed.
    File,
}

impl FromStr for WatchEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dom" => Ok(Self::Dom),
            "gui" => Ok(Self::Gui),
            "file" => Ok(Self::File),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dom => write!(f, "dom"),
            Self::Gui => write!(f, "gui"),
            Self::File => write!(f, "file"),
        }
    }
}

/// One firing of a watched event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceEvent {
    pub event: WatchEvent,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_event_parses_case_insensitively() {
        assert_eq!("DOM".parse::<WatchEvent>(), Ok(WatchEvent::Dom));
        assert_eq!(" file ".parse::<WatchEvent>(), Ok(WatchEvent::File));
        assert!("network".parse::<WatchEvent>().is_err());
    }

    #[test]
    fn mouse_button_parse() {
        assert_eq!("right".parse::<MouseButton>(), Ok(MouseButton::Right));
        assert!("wheel".parse::<MouseButton>().is_err());
    }
}
