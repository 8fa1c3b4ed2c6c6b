use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json as json;
use tokio::time::timeout;

use crate::event::ActionMetadata;
use crate::feed::PageHandle;

pub mod diff;

/// Methods that open or close a session, touch routing, or manage cookies.
/// No page state is attached to them.
const SNAPSHOT_EXEMPT_METHODS: &[&str] = &[
    "newContext",
    "newPage",
    "close",
    "route",
    "unroute",
    "unrouteAll",
    "addCookies",
    "clearCookies",
    "cookies",
    "storageState",
    "setExtraHTTPHeaders",
];

pub fn is_snapshot_exempt(action: &ActionMetadata) -> bool {
    SNAPSHOT_EXEMPT_METHODS.contains(&action.method.as_str())
}

/// Structural snapshot of the page for `action`, or `None` when the action
/// is exempt, the page fails, or it does not answer within `limit`.
pub async fn capture_snapshot<P: PageHandle>(
    page: &P,
    action: &ActionMetadata,
    limit: Duration,
) -> Option<String> {
    if is_snapshot_exempt(action) {
        return None;
    }
    match timeout(limit, page.accessibility_snapshot()).await {
        Ok(Ok(snapshot)) => Some(snapshot),
        Ok(Err(error)) => {
            log::debug!("snapshot for {} unavailable: {:#}", action.id, error);
            None
        }
        Err(_) => {
            log::warn!(
                "snapshot for {} timed out after {:?}",
                action.id,
                limit
            );
            None
        }
    }
}

/// Roles that only wrap other nodes.
const TRANSPARENT_ROLES: &[&str] = &["generic", "none"];
const SKIPPED_ROLES: &[&str] = &["InlineTextBox"];

struct AxNode {
    role: String,
    name: String,
    ignored: bool,
    children: Vec<String>,
}

/// Renders the `nodes` array returned by `Accessibility.getFullAXTree` as
/// one `role 'name'` line per node, indented two spaces per level. Ignored
/// and unnamed wrapper nodes are dropped and their children hoisted.
pub fn render_ax_tree(nodes: &[json::Value]) -> String {
    let mut by_id: HashMap<String, AxNode> = HashMap::new();
    let mut order = Vec::new();
    let mut has_parent = HashSet::new();

    for node in nodes {
        let Some(id) = node.get("nodeId").and_then(value_as_id) else {
            continue;
        };
        let children: Vec<String> = node
            .get("childIds")
            .and_then(json::Value::as_array)
            .map(|ids| ids.iter().filter_map(value_as_id).collect())
            .unwrap_or_default();
        for child in &children {
            has_parent.insert(child.clone());
        }
        order.push(id.clone());
        by_id.insert(
            id,
            AxNode {
                role: ax_value(node, "role"),
                name: ax_value(node, "name"),
                ignored: node
                    .get("ignored")
                    .and_then(json::Value::as_bool)
                    .unwrap_or(false),
                children,
            },
        );
    }

    let mut lines = Vec::new();
    let mut visited = HashSet::new();
    for id in order.iter().filter(|id| !has_parent.contains(*id)) {
        render_node(id, 0, &by_id, &mut visited, &mut lines);
    }
    lines.join("\n")
}

fn render_node(
    id: &str,
    depth: usize,
    by_id: &HashMap<String, AxNode>,
    visited: &mut HashSet<String>,
    lines: &mut Vec<String>,
) {
    let Some(node) = by_id.get(id) else { return };
    if !visited.insert(id.to_string()) {
        return;
    }
    if SKIPPED_ROLES.contains(&node.role.as_str()) {
        return;
    }

    let transparent = node.ignored
        || node.role.is_empty()
        || (TRANSPARENT_ROLES.contains(&node.role.as_str())
            && node.name.is_empty());

    let child_depth = if transparent {
        depth
    } else {
        let indent = "  ".repeat(depth);
        if node.name.is_empty() {
            lines.push(format!("{}{}", indent, node.role));
        } else {
            lines.push(format!("{}{} '{}'", indent, node.role, node.name));
        }
        depth + 1
    };

    for child in &node.children {
        render_node(child, child_depth, by_id, visited, lines);
    }
}

fn value_as_id(value: &json::Value) -> Option<String> {
    match value {
        json::Value::String(s) => Some(s.clone()),
        json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn ax_value(node: &json::Value, key: &str) -> String {
    match node.get(key).and_then(|value| value.get("value")) {
        Some(json::Value::String(s)) => s.trim().to_string(),
        Some(json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ActionId;
    use anyhow::{Result, anyhow};
    use insta::assert_snapshot;

    fn action(method: &str) -> ActionMetadata {
        ActionMetadata {
            id: ActionId("call@1".to_string()),
            kind: "Frame".to_string(),
            method: method.to_string(),
            title: method.to_string(),
            start_time: 0,
            end_time: None,
            error: None,
        }
    }

    enum Behavior {
        Answer(&'static str),
        Fail,
        Hang,
    }

    struct FakePage(Behavior);

    impl PageHandle for FakePage {
        async fn accessibility_snapshot(&self) -> Result<String> {
            match self.0 {
                Behavior::Answer(text) => Ok(text.to_string()),
                Behavior::Fail => Err(anyhow!("no main frame")),
                Behavior::Hang => std::future::pending().await,
            }
        }

        async fn url(&self) -> Option<String> {
            None
        }

        async fn response_body(
            &self,
            _request: &crate::event::RequestId,
        ) -> Result<Vec<u8>> {
            Err(anyhow!("no body"))
        }
    }

    #[tokio::test]
    async fn test_capture_snapshot_answer() {
        let page = FakePage(Behavior::Answer("button 'Go'"));
        let snapshot =
            capture_snapshot(&page, &action("click"), Duration::from_secs(1))
                .await;
        assert_eq!(snapshot.as_deref(), Some("button 'Go'"));
    }

    #[tokio::test]
    async fn test_capture_snapshot_failure_is_absent() {
        let page = FakePage(Behavior::Fail);
        let snapshot =
            capture_snapshot(&page, &action("click"), Duration::from_secs(1))
                .await;
        assert_eq!(snapshot, None);
    }

    #[tokio::test]
    async fn test_capture_snapshot_timeout_is_absent() {
        let page = FakePage(Behavior::Hang);
        let snapshot = capture_snapshot(
            &page,
            &action("click"),
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(snapshot, None);
    }

    #[tokio::test]
    async fn test_exempt_actions_skip_capture() {
        let page = FakePage(Behavior::Answer("button 'Go'"));
        for method in ["newPage", "route", "addCookies", "close"] {
            let snapshot = capture_snapshot(
                &page,
                &action(method),
                Duration::from_secs(1),
            )
            .await;
            assert_eq!(snapshot, None, "{} should be exempt", method);
        }
    }

    #[test]
    fn test_render_ax_tree() {
        let nodes = json::json!([
            {
                "nodeId": "1",
                "ignored": false,
                "role": { "type": "role", "value": "RootWebArea" },
                "name": { "type": "computedString", "value": "Shop" },
                "childIds": ["2", "5"]
            },
            {
                "nodeId": "2",
                "ignored": false,
                "role": { "type": "role", "value": "generic" },
                "name": { "type": "computedString", "value": "" },
                "childIds": ["3", "4"]
            },
            {
                "nodeId": "3",
                "ignored": false,
                "role": { "type": "role", "value": "button" },
                "name": { "type": "computedString", "value": "Add to Cart" },
                "childIds": ["6"]
            },
            {
                "nodeId": "4",
                "ignored": true,
                "role": { "type": "role", "value": "none" },
                "childIds": []
            },
            {
                "nodeId": "5",
                "ignored": false,
                "role": { "type": "role", "value": "list" },
                "childIds": ["7"]
            },
            {
                "nodeId": "6",
                "ignored": false,
                "role": { "type": "internalRole", "value": "InlineTextBox" },
                "name": { "type": "computedString", "value": "Add to Cart" },
                "childIds": []
            },
            {
                "nodeId": "7",
                "ignored": false,
                "role": { "type": "role", "value": "listitem" },
                "name": { "type": "computedString", "value": "Total: $3" },
                "childIds": []
            }
        ]);
        let rendered = render_ax_tree(nodes.as_array().unwrap());
        assert_snapshot!(rendered, @r"
        RootWebArea 'Shop'
          button 'Add to Cart'
          list
            listitem 'Total: $3'
        ");
    }

    #[test]
    fn test_render_ax_tree_tolerates_cycles() {
        let nodes = json::json!([
            { "nodeId": 1, "role": { "value": "main" }, "childIds": [2] },
            { "nodeId": 2, "role": { "value": "region" }, "childIds": [3] },
            {
                "nodeId": 3,
                "role": { "value": "group" },
                "name": { "value": "Filters" },
                "childIds": [2]
            }
        ]);
        assert_snapshot!(render_ax_tree(nodes.as_array().unwrap()), @r"
        main
          region
            group 'Filters'
        ");
    }
}
