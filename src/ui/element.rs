use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Bounds {
    pub fn center(&self) -> (i32, i32) {
        (self.x + self.w / 2, self.y + self.h / 2)
    }
}

/// A node in the parsed `uiautomator dump` tree (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiElement {
    pub text: String,
    pub resource_id: String,
    pub class: String,
    pub bounds: Bounds,
    /// Child-index chain from root, e.g. `"0/2/1/3"`.
    pub path: String,
    pub parent_path: String,
    pub depth: usize,
    pub sibling_index: usize,
    /// Global depth-first-search order across the whole tree.
    pub element_index: usize,
    pub clickable: bool,
    /// Clickability as reported by this node itself, before ancestor
    /// propagation. Preserved so the Finder can still match on it precisely.
    pub clickable_self: bool,
    pub visible: bool,
    pub enabled: bool,
    pub focused: bool,
    pub scrollable: bool,
    pub content_desc: String,
}

#[derive(Debug, Clone, Default)]
pub struct UiTree {
    pub elements: Vec<UiElement>,
}

impl UiTree {
    pub fn by_path(&self, path: &str) -> Option<&UiElement> {
        self.elements.iter().find(|e| e.path == path)
    }
}
