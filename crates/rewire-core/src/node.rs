use serde::{Deserialize, Serialize};

/// Deepest level searched below the root
pub const MAX_SEARCH_DEPTH: usize = 32;

/// Content-description fragments that identify an address bar when no
/// known view id is present
const ADDRESS_BAR_HINTS: [&str; 3] = ["address", "url", "search bar"];

/// Platform-neutral snapshot of one UI element and its subtree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiNode {
    pub view_id: Option<String>,
    pub text: Option<String>,
    pub description: Option<String>,
    pub focused: bool,
    pub children: Vec<UiNode>,
}

impl UiNode {
    /// Depth-first, first-match search bounded by `max_depth`
    #[must_use]
    pub fn find(&self, max_depth: usize, predicate: &dyn Fn(&UiNode) -> bool) -> Option<&UiNode> {
        if predicate(self) {
            return Some(self);
        }
        if max_depth == 0 {
            return None;
        }
        self.children
            .iter()
            .find_map(|child| child.find(max_depth - 1, predicate))
    }

    #[must_use]
    pub fn find_by_view_id(&self, view_id: &str) -> Option<&UiNode> {
        self.find(MAX_SEARCH_DEPTH, &|node| {
            node.view_id.as_deref() == Some(view_id)
        })
    }

    /// First node whose content description contains any of `hints`
    #[must_use]
    pub fn find_by_description(&self, hints: &[&str]) -> Option<&UiNode> {
        self.find(MAX_SEARCH_DEPTH, &|node| {
            node.description.as_deref().is_some_and(|description| {
                let description = description.to_lowercase();
                hints.iter().any(|hint| description.contains(hint))
            })
        })
    }

    /// Locate a browser's address bar: known view ids first, then hints
    #[must_use]
    pub fn find_address_bar(&self, view_ids: &[String]) -> Option<&UiNode> {
        view_ids
            .iter()
            .find_map(|id| self.find_by_view_id(id))
            .or_else(|| self.find_by_description(&ADDRESS_BAR_HINTS))
    }
}
