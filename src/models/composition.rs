use serde::Serialize;
use std::path::PathBuf;

/// Everything the script generator needs to lay out one memorial card.
/// Derived per invocation from a [`GameResult`](super::game_result::GameResult); never persisted.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompositionConfig {
    pub datetime: String,
    pub background_path: PathBuf,
    pub font_path: PathBuf,
    pub foreground: Placement,
    pub texts: Vec<TextElement>,
    pub output_filename: String,
}

/// Target rectangle for the stylized photo on the background.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Placement {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Placement {
    /// Raster tool geometry string, `WxH+X+Y`.
    pub fn geometry(&self) -> String {
        format!("{}x{}{:+}{:+}", self.width, self.height, self.x, self.y)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TextElement {
    pub text: String,
    pub x: i32,
    pub y: i32,
    pub size: u32,
    pub color: String,
    pub bold: bool,
    pub stroke: Option<Stroke>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Stroke {
    pub color: String,
    pub width: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_string() {
        let placement = Placement { x: 120, y: 180, width: 720, height: 720 };
        assert_eq!(placement.geometry(), "720x720+120+180");

        let offscreen = Placement { x: -10, y: 0, width: 5, height: 5 };
        assert_eq!(offscreen.geometry(), "5x5-10+0");
    }
}
