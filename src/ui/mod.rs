//! C3 — UI Element Model & Finder.

mod element;
mod finder;
mod similarity;
mod xml;

pub use element::{Bounds, UiElement, UiTree};
pub use finder::{compare_bounds, find_element, FindQuery, Match, Method};
pub use similarity::screenshot_similarity;
pub use xml::parse_ui_hierarchy;
