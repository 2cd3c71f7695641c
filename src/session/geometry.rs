use std::fmt;

use crate::common::GeometrySettings;

/// The `Geometry` struct represents the screen geometry of a virtual display.
/// It is fixed for the lifetime of a session.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    width: u32,
    height: u32,
    depth: u32,
}

impl Geometry {
    /// Creates a new `Geometry` instance.
    ///
    /// # Arguments
    /// * `width` - The width of the screen in pixels.
    /// * `height` - The height of the screen in pixels.
    /// * `depth` - The colour depth in bits.
    ///
    /// # Returns
    /// A new `Geometry` instance.
    pub fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Returns the width of the screen in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Returns the height of the screen in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Returns the colour depth in bits.
    pub fn depth(&self) -> u32 {
        self.depth
    }
}

impl fmt::Display for Geometry {
    /// Formats the `Geometry` as "widthxheightxdepth", the form the Xvfb
    /// `-screen` argument expects.
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

impl From<&GeometrySettings> for Geometry {
    fn from(settings: &GeometrySettings) -> Self {
        Self::new(settings.width, settings.height, settings.depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_as_screen_argument() {
        let geometry = Geometry::new(1200, 720, 24);
        assert_eq!(geometry.to_string(), "1200x720x24");
    }
}
