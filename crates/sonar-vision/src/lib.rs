//! Screen-vision sensors: the avatar glyph on the full map and minimap, and
//! map matching of the minimap patch against a reference map.

pub mod contour;
pub mod features;
pub mod homography;
pub mod icon;
pub mod map_matcher;
pub mod mask;
pub mod triangle;

pub use icon::{GlyphDetection, IconDetector, IconLocalizer, MinimapLocalizer};
pub use map_matcher::{MapMatcher, MapReference, MatcherConfig, MatcherStatus, PpiLocalizer};
