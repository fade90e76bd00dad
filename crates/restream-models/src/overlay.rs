//! Overlay placement and censorship modes.

use serde::{Deserialize, Serialize};

/// Censorship mode of a relayed video.
///
/// `AreaScreen` and `CustomScreen` both require the low-resolution shadow
/// proxy; only `CustomScreen` drives the per-frame overlay renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlayMode {
    /// No censorship
    #[default]
    None,
    /// The whole frame is covered
    FullScreen,
    /// Fixed regions are covered by the egress filter graph
    AreaScreen,
    /// Overlays are composited per-frame through the renderer pipe
    CustomScreen,
}

impl OverlayMode {
    /// Whether this mode streams from the low-resolution shadow video.
    pub fn needs_shadow(&self) -> bool {
        matches!(self, OverlayMode::AreaScreen | OverlayMode::CustomScreen)
    }

    /// Whether this mode pipes rendered frames into the egress process.
    pub fn needs_renderer(&self) -> bool {
        matches!(self, OverlayMode::CustomScreen)
    }
}

/// Placement of an overlay on the egress canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayPlacement {
    /// Paint order; lower indexes paint first
    pub index: i32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl OverlayPlacement {
    pub fn new(index: i32, x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            index,
            x,
            y,
            width,
            height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadow_modes() {
        assert!(OverlayMode::AreaScreen.needs_shadow());
        assert!(OverlayMode::CustomScreen.needs_shadow());
        assert!(!OverlayMode::None.needs_shadow());
        assert!(!OverlayMode::FullScreen.needs_shadow());
    }

    #[test]
    fn test_renderer_modes() {
        assert!(OverlayMode::CustomScreen.needs_renderer());
        assert!(!OverlayMode::AreaScreen.needs_renderer());
    }
}
