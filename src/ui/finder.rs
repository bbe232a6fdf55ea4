//! Multi-strategy element finder (spec.md §4.3). Grounded on the teacher's
//! `perception::find_best_match` scored-candidate approach, generalized into
//! an explicit confidence ladder with named methods instead of one scalar
//! score, so the ladder's ordering is testable independently of the numbers.

use super::element::{Bounds, UiElement, UiTree};

/// What to search for. Any combination of fields may be set; `find_element`
/// tries the most specific combination first and falls back down the ladder.
#[derive(Debug, Clone, Default)]
pub struct FindQuery {
    pub resource_id: Option<String>,
    pub text: Option<String>,
    pub class: Option<String>,
    pub path: Option<String>,
    pub parent_path: Option<String>,
    pub bounds_near: Option<Bounds>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    ResourceIdAndText,
    ResourceIdOnly,
    ResourceIdAndClass,
    TextAndClass,
    PathMatch,
    ParentPathHeuristic,
    BoundsProximity,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct Match {
    pub found: bool,
    pub element: Option<UiElement>,
    pub bounds: Option<Bounds>,
    pub method: Method,
    pub confidence: f64,
    pub message: String,
}

impl Match {
    fn not_found(message: impl Into<String>) -> Self {
        Match { found: false, element: None, bounds: None, method: Method::NotFound, confidence: 0.0, message: message.into() }
    }

    fn hit(element: &UiElement, method: Method, confidence: f64) -> Self {
        Match {
            found: true,
            element: Some(element.clone()),
            bounds: Some(element.bounds),
            method,
            confidence,
            message: String::new(),
        }
    }
}

/// Confidence ladder, highest first. Returns the first method that yields
/// exactly one unambiguous candidate; never returns more than one match.
pub fn find_element(tree: &UiTree, query: &FindQuery) -> Match {
    if let (Some(rid), Some(text)) = (&query.resource_id, &query.text) {
        if let Some(el) = unique(tree.elements.iter().filter(|e| &e.resource_id == rid && &e.text == text)) {
            return Match::hit(el, Method::ResourceIdAndText, 1.0);
        }
    }

    if let Some(rid) = &query.resource_id {
        if !rid.is_empty() {
            if let Some(el) = unique(tree.elements.iter().filter(|e| &e.resource_id == rid)) {
                return Match::hit(el, Method::ResourceIdOnly, 0.9);
            }
        }
    }

    if let (Some(rid), Some(class)) = (&query.resource_id, &query.class) {
        if let Some(el) = unique(tree.elements.iter().filter(|e| &e.resource_id == rid && &e.class == class)) {
            return Match::hit(el, Method::ResourceIdAndClass, 0.85);
        }
    }

    if let (Some(text), Some(class)) = (&query.text, &query.class) {
        if let Some(el) = unique(tree.elements.iter().filter(|e| &e.text == text && &e.class == class)) {
            return Match::hit(el, Method::TextAndClass, 0.75);
        }
    }

    if let Some(path) = &query.path {
        if let Some(el) = tree.by_path(path) {
            return Match::hit(el, Method::PathMatch, 0.7);
        }
    }

    if let Some(parent_path) = &query.parent_path {
        let candidates: Vec<&UiElement> = tree
            .elements
            .iter()
            .filter(|e| &e.parent_path == parent_path)
            .filter(|e| {
                query.text.as_ref().map(|t| &e.text == t).unwrap_or(false)
                    || query.class.as_ref().map(|c| &e.class == c).unwrap_or(false)
            })
            .collect();
        if candidates.len() == 1 {
            return Match::hit(candidates[0], Method::ParentPathHeuristic, 0.6);
        }
    }

    if let Some(target) = &query.bounds_near {
        let class_hint = query.class.clone();
        let text_hint = query.text.clone();
        let mut best: Option<(&UiElement, i32)> = None;
        for el in &tree.elements {
            let class_ok = class_hint.as_ref().map(|c| &el.class == c).unwrap_or(true);
            let text_ok = text_hint.as_ref().map(|t| &el.text == t).unwrap_or(true);
            if !class_ok && !text_ok {
                continue;
            }
            let (similar, dist) = compare_bounds(&el.bounds, target);
            if similar && best.map(|(_, d)| dist < d).unwrap_or(true) {
                best = Some((el, dist));
            }
        }
        if let Some((el, _)) = best {
            return Match::hit(el, Method::BoundsProximity, 0.5);
        }
    }

    Match::not_found("no method in the confidence ladder produced a unique match")
}

fn unique<'a>(mut it: impl Iterator<Item = &'a UiElement>) -> Option<&'a UiElement> {
    let first = it.next()?;
    if it.next().is_some() {
        return None;
    }
    Some(first)
}

/// Center-to-center pixel distance between two bounds, and whether that
/// distance is within the drift tolerance. Drift of exactly 10px is NOT a
/// repair event; 11px is (spec.md).
pub fn compare_bounds(a: &Bounds, b: &Bounds) -> (bool, i32) {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    let dist = (((ax - bx).pow(2) + (ay - by).pow(2)) as f64).sqrt().round() as i32;
    (dist <= 10, dist)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el(path: &str, parent_path: &str, resource_id: &str, text: &str, class: &str, bounds: Bounds) -> UiElement {
        UiElement {
            text: text.to_string(),
            resource_id: resource_id.to_string(),
            class: class.to_string(),
            bounds,
            path: path.to_string(),
            parent_path: parent_path.to_string(),
            depth: path.matches('/').count(),
            sibling_index: 0,
            element_index: 0,
            clickable: false,
            clickable_self: false,
            visible: true,
            enabled: true,
            focused: false,
            scrollable: false,
            content_desc: String::new(),
        }
    }

    #[test]
    fn exact_resource_id_and_text_wins_first() {
        let tree = UiTree {
            elements: vec![
                el("0", "", "com.x:id/a", "Hello", "TextView", Bounds { x: 0, y: 0, w: 10, h: 10 }),
                el("0/1", "0", "com.x:id/a", "Other", "TextView", Bounds { x: 100, y: 100, w: 10, h: 10 }),
            ],
        };
        let q = FindQuery { resource_id: Some("com.x:id/a".into()), text: Some("Hello".into()), ..Default::default() };
        let m = find_element(&tree, &q);
        assert!(m.found);
        assert_eq!(m.method, Method::ResourceIdAndText);
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn ambiguous_resource_id_alone_falls_through_to_class() {
        let tree = UiTree {
            elements: vec![
                el("0", "", "com.x:id/a", "Hello", "TextView", Bounds::default()),
                el("0/1", "0", "com.x:id/a", "Bye", "Button", Bounds::default()),
            ],
        };
        // resource_id alone is ambiguous (2 matches); resource_id+class narrows to 1.
        let q = FindQuery {
            resource_id: Some("com.x:id/a".into()),
            class: Some("Button".into()),
            ..Default::default()
        };
        let m = find_element(&tree, &q);
        assert!(m.found);
        assert_eq!(m.method, Method::ResourceIdAndClass);
    }

    #[test]
    fn path_match_is_direct_lookup() {
        let tree = UiTree { elements: vec![el("0/2/1", "0/2", "", "", "View", Bounds::default())] };
        let q = FindQuery { path: Some("0/2/1".into()), ..Default::default() };
        let m = find_element(&tree, &q);
        assert!(m.found);
        assert_eq!(m.method, Method::PathMatch);
    }

    #[test]
    fn drift_of_exactly_10px_is_not_a_repair_event_11px_is() {
        let a = Bounds { x: 0, y: 0, w: 20, h: 0 }; // center (10, 0)
        let b_10 = Bounds { x: 0, y: 0, w: 0, h: 0 }; // center (0, 0), distance 10
        let (similar, dist) = compare_bounds(&a, &b_10);
        assert_eq!(dist, 10);
        assert!(similar);

        let b_11 = Bounds { x: -1, y: 0, w: 0, h: 0 }; // center (-1, 0), distance 11
        let (similar11, dist11) = compare_bounds(&a, &b_11);
        assert_eq!(dist11, 11);
        assert!(!similar11);
    }

    #[test]
    fn not_found_when_nothing_matches() {
        let tree = UiTree { elements: vec![] };
        let q = FindQuery { resource_id: Some("com.x:id/missing".into()), ..Default::default() };
        let m = find_element(&tree, &q);
        assert!(!m.found);
        assert_eq!(m.method, Method::NotFound);
    }
}
