//! Taxonomy nodes, the lazily expanded category tree and view lookup.

use crate::source::View;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

const HIERARCHY_SEPARATOR: &str = " > ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub hierarchy: Vec<String>,
    #[serde(default)]
    pub has_children: bool,
    /// Only end leaves that map to a view carry a path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<u32>,
}

impl CategoryNode {
    /// Leafness for table loading is the presence of a path, whatever
    /// `has_children` says.
    pub fn is_end_leaf(&self) -> bool {
        self.path.as_deref().is_some_and(|path| !path.trim().is_empty())
    }

    /// Cleaned hierarchy joined for display, falling back to the node name.
    pub fn hierarchy_label(&self) -> String {
        let label = hierarchy_label(&self.hierarchy);
        if label.is_empty() { self.name.clone() } else { label }
    }
}

/// Drops the root corpus label from a hierarchy when more than one level is
/// present.
pub fn clean_hierarchy(hierarchy: &[String]) -> Vec<String> {
    match hierarchy {
        [] | [_] => hierarchy.to_vec(),
        [_, rest @ ..] => rest.to_vec(),
    }
}

pub fn hierarchy_label(hierarchy: &[String]) -> String {
    clean_hierarchy(hierarchy).join(HIERARCHY_SEPARATOR)
}

/// Turns a `/`-separated path into the `-`-joined view filename.
pub fn view_filename(path: &str) -> String {
    path.split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no table found for path {path:?} (looked for {filename:?})")]
pub struct ViewNotFound {
    pub path: String,
    pub filename: String,
}

/// Finds the view for a leaf path. The joined name must equal a view's
/// filename, with or without its extension.
pub fn resolve_view<'a>(path: &str, views: &'a [View]) -> Result<&'a View, ViewNotFound> {
    let filename = view_filename(path);
    views
        .iter()
        .find(|view| view.filename == filename)
        .or_else(|| views.iter().find(|view| view.stem() == filename))
        .ok_or_else(|| ViewNotFound {
            path: path.to_string(),
            filename,
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Collapsed,
    Loading,
    Expanded,
}

/// What a toggle asks of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    /// Children are not cached; fetch them and call `finish_loading`.
    Fetch(u32),
    Expanded,
    Collapsed,
    /// Already loading, a leaf, or an unknown id.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlatNode<'a> {
    pub node: &'a CategoryNode,
    pub level: usize,
    pub state: NodeState,
}

/// Expand/collapse state over a lazily loaded category tree.
///
/// Loaded children stay cached after a collapse, so expanding again never
/// refetches.
#[derive(Debug, Clone, Default)]
pub struct CategoryNavigator {
    nodes: HashMap<u32, CategoryNode>,
    roots: Vec<u32>,
    children: HashMap<u32, Vec<u32>>,
    states: HashMap<u32, NodeState>,
}

impl CategoryNavigator {
    pub fn new(roots: Vec<CategoryNode>) -> Self {
        let mut navigator = Self::default();
        navigator.set_roots(roots);
        navigator
    }

    pub fn set_roots(&mut self, roots: Vec<CategoryNode>) {
        self.roots = roots.iter().map(|node| node.id).collect();
        for node in roots {
            self.nodes.insert(node.id, node);
        }
    }

    pub fn node(&self, id: u32) -> Option<&CategoryNode> {
        self.nodes.get(&id)
    }

    pub fn state(&self, id: u32) -> NodeState {
        self.states.get(&id).copied().unwrap_or_default()
    }

    pub fn children_loaded(&self, id: u32) -> bool {
        self.children.contains_key(&id)
    }

    pub fn toggle(&mut self, id: u32) -> Toggle {
        let Some(has_children) = self.nodes.get(&id).map(|node| node.has_children) else {
            return Toggle::Unchanged;
        };
        match self.state(id) {
            NodeState::Loading => Toggle::Unchanged,
            NodeState::Expanded => {
                self.collapse(id);
                Toggle::Collapsed
            }
            NodeState::Collapsed if self.children.contains_key(&id) => {
                self.states.insert(id, NodeState::Expanded);
                Toggle::Expanded
            }
            NodeState::Collapsed if has_children => {
                self.states.insert(id, NodeState::Loading);
                Toggle::Fetch(id)
            }
            NodeState::Collapsed => Toggle::Unchanged,
        }
    }

    /// Stores fetched children. The node only opens if it is still waiting
    /// for them.
    pub fn finish_loading(&mut self, id: u32, children: Vec<CategoryNode>) {
        let ids = children.iter().map(|child| child.id).collect();
        for child in children {
            self.nodes.insert(child.id, child);
        }
        self.children.insert(id, ids);
        if self.state(id) == NodeState::Loading {
            self.states.insert(id, NodeState::Expanded);
        }
    }

    pub fn fail_loading(&mut self, id: u32) {
        if self.state(id) == NodeState::Loading {
            self.states.insert(id, NodeState::Collapsed);
        }
    }

    /// Collapses the node and every expanded descendant.
    pub fn collapse(&mut self, id: u32) {
        let mut pending = vec![id];
        let mut seen = HashSet::new();
        while let Some(current) = pending.pop() {
            if !seen.insert(current) {
                continue;
            }
            if self.state(current) == NodeState::Expanded {
                self.states.insert(current, NodeState::Collapsed);
            }
            if let Some(children) = self.children.get(&current) {
                pending.extend(children.iter().copied());
            }
        }
    }

    /// Visible nodes in display order with their indentation level. A node
    /// reachable twice (a cycle in the source data) is listed once.
    pub fn flatten(&self) -> Vec<FlatNode<'_>> {
        let mut rows = Vec::new();
        let mut seen = HashSet::new();
        for &root in &self.roots {
            self.push_visible(root, 0, &mut rows, &mut seen);
        }
        rows
    }

    fn push_visible<'a>(
        &'a self,
        id: u32,
        level: usize,
        rows: &mut Vec<FlatNode<'a>>,
        seen: &mut HashSet<u32>,
    ) {
        if !seen.insert(id) {
            return;
        }
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let state = self.state(id);
        rows.push(FlatNode { node, level, state });
        if state != NodeState::Expanded {
            return;
        }
        if let Some(children) = self.children.get(&id) {
            for &child in children {
                self.push_visible(child, level + 1, rows, seen);
            }
        }
    }

    pub fn remember(&mut self, node: CategoryNode) {
        self.nodes.entry(node.id).or_insert(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32, name: &str, has_children: bool, path: Option<&str>) -> CategoryNode {
        CategoryNode {
            id,
            name: name.to_string(),
            hierarchy: Vec::new(),
            has_children,
            path: path.map(str::to_string),
            parent: None,
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn hierarchy_cleaning_drops_the_root() {
        assert_eq!(
            clean_hierarchy(&strings(&["RMS", "Morphology", "Plural"])),
            strings(&["Morphology", "Plural"])
        );
        assert_eq!(clean_hierarchy(&[]), Vec::<String>::new());
        assert_eq!(clean_hierarchy(&strings(&["Morphology"])), strings(&["Morphology"]));
        assert_eq!(
            hierarchy_label(&strings(&["RMS", "Morphology", "Plural"])),
            "Morphology > Plural"
        );
    }

    #[test]
    fn leafness_comes_from_path_only() {
        assert!(node(1, "a", false, Some("morph/plural")).is_end_leaf());
        assert!(node(1, "a", true, Some("morph/plural")).is_end_leaf());
        assert!(!node(1, "a", false, None).is_end_leaf());
        assert!(!node(1, "a", false, Some("  ")).is_end_leaf());
    }

    #[test]
    fn resolves_views_by_joined_path() {
        let views = vec![
            View::new("morphology-plural.html", "<table></table>"),
            View::new("syntax", "<table></table>"),
        ];
        assert_eq!(view_filename("/morphology//plural/"), "morphology-plural");
        assert_eq!(
            resolve_view("morphology/plural", &views).unwrap().filename,
            "morphology-plural.html"
        );
        assert_eq!(resolve_view("syntax", &views).unwrap().filename, "syntax");
        let err = resolve_view("phonology/vowels", &views).unwrap_err();
        assert_eq!(err.filename, "phonology-vowels");
    }

    #[test]
    fn expand_fetches_once_then_uses_cache() {
        let mut nav = CategoryNavigator::new(vec![node(1, "Morphology", true, None)]);
        assert_eq!(nav.toggle(1), Toggle::Fetch(1));
        assert_eq!(nav.state(1), NodeState::Loading);
        assert_eq!(nav.toggle(1), Toggle::Unchanged);

        nav.finish_loading(1, vec![node(2, "Nouns", true, None), node(3, "Plural", false, Some("m/p"))]);
        assert_eq!(nav.state(1), NodeState::Expanded);
        assert_eq!(nav.flatten().len(), 3);

        assert_eq!(nav.toggle(1), Toggle::Collapsed);
        assert_eq!(nav.flatten().len(), 1);
        assert_eq!(nav.toggle(1), Toggle::Expanded);
        assert!(nav.children_loaded(1));
    }

    #[test]
    fn collapsing_closes_descendants_but_keeps_them_cached() {
        let mut nav = CategoryNavigator::new(vec![node(1, "Root", true, None)]);
        nav.toggle(1);
        nav.finish_loading(1, vec![node(2, "Mid", true, None)]);
        nav.toggle(2);
        nav.finish_loading(2, vec![node(3, "Leaf", false, Some("x"))]);

        let levels: Vec<_> = nav.flatten().iter().map(|row| (row.node.id, row.level)).collect();
        assert_eq!(levels, vec![(1, 0), (2, 1), (3, 2)]);

        nav.toggle(1);
        assert_eq!(nav.state(2), NodeState::Collapsed);
        assert!(nav.children_loaded(2));
        assert_eq!(nav.toggle(1), Toggle::Expanded);
        assert_eq!(nav.flatten().len(), 2);
        assert_eq!(nav.toggle(2), Toggle::Expanded);
    }

    #[test]
    fn self_parented_category_does_not_loop() {
        let mut nav = CategoryNavigator::new(vec![node(1, "Loop", true, None)]);
        nav.toggle(1);
        nav.finish_loading(1, vec![node(1, "Loop", true, None), node(2, "Other", true, None)]);
        nav.toggle(2);
        nav.finish_loading(2, vec![node(1, "Loop", true, None)]);

        let ids: Vec<_> = nav.flatten().iter().map(|row| row.node.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(nav.toggle(1), Toggle::Collapsed);
        assert_eq!(nav.state(2), NodeState::Collapsed);
        assert_eq!(nav.flatten().len(), 1);
    }

    #[test]
    fn failed_load_returns_to_collapsed() {
        let mut nav = CategoryNavigator::new(vec![node(1, "Root", true, None)]);
        nav.toggle(1);
        nav.fail_loading(1);
        assert_eq!(nav.state(1), NodeState::Collapsed);
        assert_eq!(nav.toggle(1), Toggle::Fetch(1));
    }

    #[test]
    fn childless_nodes_do_not_toggle() {
        let mut nav = CategoryNavigator::new(vec![node(1, "Empty", false, None)]);
        assert_eq!(nav.toggle(1), Toggle::Unchanged);
        assert_eq!(nav.toggle(99), Toggle::Unchanged);
    }
}
