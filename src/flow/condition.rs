//! `conditional` step grammar (spec.md §4.6.4): `element_exists:...`,
//! `screen_activity:X`, `var:NAME OP VALUE`, bare truthy-variable test.

use super::context::VariableContext;
use crate::ui::UiTree;

pub fn evaluate(condition: &str, tree: &UiTree, current_activity: &str, ctx: &VariableContext) -> bool {
    if let Some(rest) = condition.strip_prefix("element_exists:") {
        return element_exists(rest, tree);
    }
    if let Some(rest) = condition.strip_prefix("screen_activity:") {
        return current_activity.contains(rest);
    }
    if let Some(rest) = condition.strip_prefix("var:") {
        return eval_var_expr(rest, ctx);
    }
    // Bare truthy-variable test.
    match ctx.get(condition) {
        Some(v) => !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"),
        None => false,
    }
}

fn element_exists(spec: &str, tree: &UiTree) -> bool {
    let Some((key, value)) = spec.split_once('=') else { return false };
    tree.elements.iter().any(|e| match key {
        "text" => e.text == value,
        "resource-id" => e.resource_id == value,
        "class" => e.class == value,
        _ => false,
    })
}

fn eval_var_expr(rest: &str, ctx: &VariableContext) -> bool {
    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some(idx) = rest.find(op) {
            let name = rest[..idx].trim();
            let value = rest[idx + op.len()..].trim();
            let Some(current) = ctx.get(name) else { return false };
            return compare(current, op, value);
        }
    }
    false
}

fn compare(current: &str, op: &str, value: &str) -> bool {
    if let (Ok(a), Ok(b)) = (current.parse::<f64>(), value.parse::<f64>()) {
        return match op {
            "==" => a == b,
            "!=" => a != b,
            ">=" => a >= b,
            "<=" => a <= b,
            ">" => a > b,
            "<" => a < b,
            _ => false,
        };
    }
    match op {
        "==" => current == value,
        "!=" => current != value,
        ">=" => current >= value,
        "<=" => current <= value,
        ">" => current > value,
        "<" => current < value,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::Bounds;
    use crate::ui::UiElement;

    fn tree_with(text: &str) -> UiTree {
        UiTree {
            elements: vec![UiElement {
                text: text.into(),
                resource_id: String::new(),
                class: String::new(),
                bounds: Bounds::default(),
                path: "0".into(),
                parent_path: String::new(),
                depth: 0,
                sibling_index: 0,
                element_index: 0,
                clickable: false,
                clickable_self: false,
                visible: true,
                enabled: true,
                focused: false,
                scrollable: false,
                content_desc: String::new(),
            }],
        }
    }

    #[test]
    fn element_exists_matches_text() {
        let tree = tree_with("Hello");
        let ctx = VariableContext::default();
        assert!(evaluate("element_exists:text=Hello", &tree, "Main", &ctx));
        assert!(!evaluate("element_exists:text=Goodbye", &tree, "Main", &ctx));
    }

    #[test]
    fn screen_activity_is_substring_match() {
        let tree = tree_with("");
        let ctx = VariableContext::default();
        assert!(evaluate("screen_activity:Main", &tree, "com.x/.MainActivity", &ctx));
    }

    #[test]
    fn numeric_var_comparison_with_coercion() {
        let tree = tree_with("");
        let mut ctx = VariableContext::default();
        ctx.set("count", "5");
        assert!(evaluate("var:count >= 3", &tree, "Main", &ctx));
        assert!(!evaluate("var:count < 3", &tree, "Main", &ctx));
    }

    #[test]
    fn bare_truthy_variable_test() {
        let tree = tree_with("");
        let mut ctx = VariableContext::default();
        ctx.set("flag", "true");
        assert!(evaluate("flag", &tree, "Main", &ctx));
        ctx.set("flag", "0");
        assert!(!evaluate("flag", &tree, "Main", &ctx));
    }
}
