//! C8 — Navigation Graph.
//!
//! Per-package learned screen/transition graph with content-addressed
//! screen ids and shortest-path routing (spec.md §4.6.7, §3 Navigation
//! Graph). Grounded on the teacher's in-memory `DashMap`-of-state idiom
//! (`identity::IdentityResolver`) since the teacher carries no navigation
//! concept of its own.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Screen {
    pub activity: String,
    pub landmarks: Vec<String>,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionAction {
    Tap { x: i32, y: i32 },
    Swipe { x1: i32, y1: i32, x2: i32, y2: i32 },
    Keyevent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub action: TransitionAction,
    #[serde(default)]
    pub successes: u32,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub mean_time_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageGraph {
    pub screens: HashMap<String, Screen>,
    pub transitions: Vec<Transition>,
    pub home_screen_id: Option<String>,
}

impl PackageGraph {
    pub fn record_transition_result(&mut self, from: &str, to: &str, success: bool, elapsed_ms: f64) {
        if let Some(t) = self.transitions.iter_mut().find(|t| t.from == from && t.to == to) {
            if success {
                t.successes += 1;
                let n = (t.successes + t.failures) as f64;
                t.mean_time_ms = ((t.mean_time_ms * (n - 1.0)) + elapsed_ms) / n;
            } else {
                t.failures += 1;
            }
        }
    }

    /// Dijkstra shortest path by hop count (transitions carry no persisted
    /// weight beyond their own stats, so hop count is the routing metric;
    /// mean_time_ms is tracked for observability, not used as edge weight).
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<Transition>> {
        if from == to {
            return Some(Vec::new());
        }
        let mut dist: HashMap<&str, u32> = HashMap::new();
        let mut prev: HashMap<&str, &Transition> = HashMap::new();
        let mut heap = BinaryHeap::new();
        dist.insert(from, 0);
        heap.push(std::cmp::Reverse((0u32, from)));

        while let Some(std::cmp::Reverse((d, node))) = heap.pop() {
            if node == to {
                break;
            }
            if d > *dist.get(node).unwrap_or(&u32::MAX) {
                continue;
            }
            for t in self.transitions.iter().filter(|t| t.from == node) {
                let nd = d + 1;
                if nd < *dist.get(t.to.as_str()).unwrap_or(&u32::MAX) {
                    dist.insert(&t.to, nd);
                    prev.insert(&t.to, t);
                    heap.push(std::cmp::Reverse((nd, t.to.as_str())));
                }
            }
        }

        if !dist.contains_key(to) {
            return None;
        }
        let mut path = Vec::new();
        let mut cur = to;
        while cur != from {
            let t = prev.get(cur)?;
            path.push((*t).clone());
            cur = t.from.as_str();
        }
        path.reverse();
        Some(path)
    }
}

/// Content-addressed id: stable across app relaunches because it hashes
/// `(activity, sorted landmark set)` rather than anything transient.
pub fn screen_id(activity: &str, landmarks: &[String]) -> String {
    let mut sorted = landmarks.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    hasher.update(activity.as_bytes());
    for l in &sorted {
        hasher.update(b"|");
        hasher.update(l.as_bytes());
    }
    format!("{:x}", hasher.finalize())[..16].to_string()
}

pub struct NavigationGraphs {
    graphs: DashMap<String, PackageGraph>,
}

impl NavigationGraphs {
    pub fn new() -> Self {
        Self { graphs: DashMap::new() }
    }

    pub fn learn_screen(&self, package: &str, screen_id: String, screen: Screen) {
        let mut entry = self.graphs.entry(package.to_string()).or_default();
        if entry.home_screen_id.is_none() {
            entry.home_screen_id = Some(screen_id.clone());
        }
        entry.screens.insert(screen_id, screen);
    }

    pub fn learn_transition(&self, package: &str, transition: Transition) {
        let mut entry = self.graphs.entry(package.to_string()).or_default();
        if !entry.transitions.iter().any(|t| t.from == transition.from && t.to == transition.to) {
            debug!(package, from = %transition.from, to = %transition.to, "learned new navigation transition");
            entry.transitions.push(transition);
        }
    }

    pub fn route(&self, package: &str, from: &str, to: &str) -> Option<Vec<Transition>> {
        self.graphs.get(package)?.shortest_path(from, to)
    }

    /// Falls back to the package's known home screen when no direct route
    /// exists (spec.md §4.6.7).
    pub fn route_or_via_home(&self, package: &str, from: &str, to: &str) -> Option<Vec<Transition>> {
        if let Some(path) = self.route(package, from, to) {
            return Some(path);
        }
        let graph = self.graphs.get(package)?;
        let home = graph.home_screen_id.clone()?;
        drop(graph);
        let to_home = self.route(package, from, &home)?;
        let mut from_home = self.route(package, &home, to)?;
        let mut full = to_home;
        full.append(&mut from_home);
        Some(full)
    }
}

impl Default for NavigationGraphs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(from: &str, to: &str) -> Transition {
        Transition { from: from.into(), to: to.into(), action: TransitionAction::Keyevent, successes: 0, failures: 0, mean_time_ms: 0.0 }
    }

    #[test]
    fn screen_id_is_stable_regardless_of_landmark_order() {
        let a = screen_id("MainActivity", &["battery".into(), "temp".into()]);
        let b = screen_id("MainActivity", &["temp".into(), "battery".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn finds_shortest_path_over_multiple_hops() {
        let mut g = PackageGraph::default();
        g.transitions.push(transition("a", "b"));
        g.transitions.push(transition("b", "c"));
        g.transitions.push(transition("a", "c")); // direct edge too
        let path = g.shortest_path("a", "c").unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].from, "a");
    }

    #[test]
    fn falls_back_to_home_when_no_direct_route() {
        let graphs = NavigationGraphs::new();
        graphs.learn_transition("com.x", transition("home", "settings"));
        graphs.learn_transition("com.x", transition("unrelated", "home"));
        graphs.learn_screen("com.x", "home".into(), Screen { activity: "Home".into(), landmarks: vec![], display_name: "Home".into() });
        let path = graphs.route_or_via_home("com.x", "unrelated", "settings").unwrap();
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn no_path_returns_none() {
        let g = PackageGraph::default();
        assert!(g.shortest_path("a", "z").is_none());
    }
}
