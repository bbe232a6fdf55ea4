//! `uiautomator dump` XML -> `UiTree`. Grounded on the teacher's
//! `perception::simplify_ui_xml`/`sanitizer::parse_node_tag` attribute
//! extraction, reimplemented over `quick_xml`'s pull parser instead of
//! manual string slicing so nesting (`path`/`depth`/`sibling_index`) falls
//! out of the parser's own element stack rather than brace-counting.

use super::element::{Bounds, UiElement, UiTree};
use quick_xml::events::Event;
use quick_xml::Reader;

/// Parses the raw XML, stripping any preamble before `<hierarchy` and any
/// trailing bytes after `</hierarchy>` (spec.md §4.2 UI hierarchy contract).
///
/// `bounds_only`: when true, skips text/content-desc/resource-id attribute
/// allocation for a faster pass (spec's "bounds-only mode, ~30-40% faster").
pub fn parse_ui_hierarchy(raw: &str, bounds_only: bool) -> UiTree {
    let xml = trim_to_hierarchy(raw);
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut elements = Vec::new();
    let mut stack: Vec<usize> = Vec::new(); // sibling counters per depth
    let mut path_stack: Vec<String> = Vec::new();
    let mut global_index = 0usize;
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf);
        match event {
            Ok(Event::Start(e)) => {
                if e.name().as_ref() != b"node" {
                    buf.clear();
                    continue;
                }
                let (path, parent_path, depth, sibling_index) = next_path(&mut stack, &path_stack);
                elements.push(build_element(&e, bounds_only, path.clone(), parent_path, depth, sibling_index, global_index));
                global_index += 1;
                path_stack.push(path);
                stack.push(0);
            }
            Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() != b"node" {
                    buf.clear();
                    continue;
                }
                let (path, parent_path, depth, sibling_index) = next_path(&mut stack, &path_stack);
                elements.push(build_element(e, bounds_only, path, parent_path, depth, sibling_index, global_index));
                global_index += 1;
                // Self-closing: no matching End event, no children, nothing pushed.
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"node" {
                    path_stack.pop();
                    stack.pop();
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    propagate_clickable(&mut elements);
    UiTree { elements }
}

/// Computes this node's `(path, parent_path, depth, sibling_index)` and
/// bumps the sibling counter for the current depth, without yet pushing a
/// new frame (callers do that only for `Start`, since `Empty` nodes have no
/// children).
fn next_path(stack: &mut Vec<usize>, path_stack: &[String]) -> (String, String, usize, usize) {
    let depth = path_stack.len();
    if stack.len() <= depth {
        stack.push(0);
    }
    let sibling_index = stack[depth];
    stack[depth] += 1;
    let parent_path = path_stack.last().cloned().unwrap_or_default();
    let path = if parent_path.is_empty() {
        sibling_index.to_string()
    } else {
        format!("{}/{}", parent_path, sibling_index)
    };
    (path, parent_path, depth, sibling_index)
}

fn build_element(
    e: &quick_xml::events::BytesStart,
    bounds_only: bool,
    path: String,
    parent_path: String,
    depth: usize,
    sibling_index: usize,
    element_index: usize,
) -> UiElement {
    let mut text = String::new();
    let mut resource_id = String::new();
    let mut content_desc = String::new();
    let mut class = String::new();
    let mut bounds = Bounds::default();
    let mut clickable_self = false;
    let mut enabled = true;
    let mut focused = false;
    let mut scrollable = false;

    for attr in e.attributes().flatten() {
        let key = attr.key.as_ref();
        let value = attr.unescape_value().unwrap_or_default().to_string();
        match key {
            b"text" if !bounds_only => text = value,
            b"content-desc" if !bounds_only => content_desc = value,
            b"resource-id" if !bounds_only => resource_id = value,
            b"class" => class = value,
            b"bounds" => bounds = parse_bounds(&value),
            b"clickable" => clickable_self = value == "true",
            b"enabled" => enabled = value == "true",
            b"focused" => focused = value == "true",
            b"scrollable" => scrollable = value == "true",
            _ => {}
        }
    }

    UiElement {
        text,
        resource_id,
        class,
        bounds,
        path,
        parent_path,
        depth,
        sibling_index,
        element_index,
        clickable: clickable_self,
        clickable_self,
        visible: enabled,
        enabled,
        focused,
        scrollable,
        content_desc,
    }
}

fn trim_to_hierarchy(raw: &str) -> &str {
    let start = raw.find("<?xml").or_else(|| raw.find("<hierarchy")).unwrap_or(0);
    let slice = &raw[start..];
    match slice.find("</hierarchy>") {
        Some(end) => &slice[..end + "</hierarchy>".len()],
        None => slice,
    }
}

fn parse_bounds(s: &str) -> Bounds {
    let nums: Vec<i32> = s
        .chars()
        .map(|c| if c.is_ascii_digit() || c == '-' || c == ',' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .flat_map(|chunk| chunk.split(','))
        .filter_map(|n| n.parse().ok())
        .collect();
    if nums.len() >= 4 {
        Bounds { x: nums[0], y: nums[1], w: nums[2] - nums[0], h: nums[3] - nums[1] }
    } else {
        Bounds::default()
    }
}

/// `clickable` propagates downward: a child reports `clickable=true` if any
/// ancestor is clickable, while `clickable_self` is preserved unmodified
/// (spec.md §3).
fn propagate_clickable(elements: &mut [UiElement]) {
    use std::collections::HashMap;
    let mut clickable_paths: HashMap<String, bool> = HashMap::new();
    for el in elements.iter() {
        clickable_paths.insert(el.path.clone(), el.clickable_self);
    }
    for el in elements.iter_mut() {
        let mut path = el.parent_path.as_str();
        let mut ancestor_clickable = false;
        loop {
            if path.is_empty() {
                break;
            }
            if clickable_paths.get(path).copied().unwrap_or(false) {
                ancestor_clickable = true;
                break;
            }
            path = match path.rfind('/') {
                Some(idx) => &path[..idx],
                None => "",
            };
        }
        el.clickable = el.clickable_self || ancestor_clickable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version='1.0' encoding='UTF-8'?><hierarchy rotation="0">
<node index="0" text="" resource-id="" class="android.widget.FrameLayout" clickable="true" enabled="true" focused="false" scrollable="false" bounds="[0,0][1080,2400]">
  <node index="0" text="Hello" resource-id="com.x:id/greeting" class="android.widget.TextView" clickable="false" enabled="true" focused="false" scrollable="false" bounds="[100,200][300,260]" />
</node>
</hierarchy>"#;

    #[test]
    fn parses_bounds_and_paths() {
        let tree = parse_ui_hierarchy(SAMPLE, false);
        assert_eq!(tree.elements.len(), 2);
        let child = &tree.elements[1];
        assert_eq!(child.text, "Hello");
        assert_eq!(child.bounds, Bounds { x: 100, y: 200, w: 200, h: 60 });
        assert_eq!(child.parent_path, "0");
    }

    #[test]
    fn clickable_propagates_down_but_clickable_self_preserved() {
        let tree = parse_ui_hierarchy(SAMPLE, false);
        let child = &tree.elements[1];
        assert!(child.clickable, "parent is clickable so child should inherit it");
        assert!(!child.clickable_self);
    }

    #[test]
    fn strips_preamble_and_trailing_bytes() {
        let wrapped = format!("UI hierchary dumped to: /sdcard/x.xml\n{}\ntrailing garbage", SAMPLE);
        let tree = parse_ui_hierarchy(&wrapped, false);
        assert_eq!(tree.elements.len(), 2);
    }

    #[test]
    fn bounds_only_mode_skips_text_and_resource_id() {
        let tree = parse_ui_hierarchy(SAMPLE, true);
        assert!(tree.elements.iter().all(|e| e.text.is_empty() && e.resource_id.is_empty()));
    }
}
