use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::LibraryError;
use crate::models::{LibraryItem, LibraryItemKind};

/// Index of a node inside a [`LibraryArena`].
pub type NodeIndex = usize;

/// One folder-tree node. Parent and children are arena indices, which keeps
/// the graph free of reference cycles; back references are lookups only.
#[derive(Debug, Clone)]
pub struct LibraryNode {
    pub item: LibraryItem,
    pub parent: Option<NodeIndex>,
    pub children: Vec<NodeIndex>,
    /// Populated for smart folders on refresh.
    pub videos: HashSet<Uuid>,
}

/// In-memory folder tree backing the catalog's `library_items` rows.
/// Nodes are never removed from the backing vector; detached nodes are
/// tombstoned so indices stay stable.
#[derive(Debug, Default)]
pub struct LibraryArena {
    nodes: Vec<LibraryNode>,
    by_url: HashMap<String, NodeIndex>,
}

impl LibraryArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: NodeIndex) -> Option<&LibraryNode> {
        self.nodes.get(index)
    }

    pub fn get_mut(&mut self, index: NodeIndex) -> Option<&mut LibraryNode> {
        self.nodes.get_mut(index)
    }

    pub fn find_by_url(&self, url: &str) -> Option<NodeIndex> {
        self.by_url.get(url).copied()
    }

    pub fn add_root(&mut self, item: LibraryItem) -> NodeIndex {
        let index = self.nodes.len();
        if let Some(ref url) = item.url {
            self.by_url.insert(url.clone(), index);
        }
        self.nodes.push(LibraryNode {
            item,
            parent: None,
            children: Vec::new(),
            videos: HashSet::new(),
        });
        index
    }

    pub fn add_child(
        &mut self,
        parent: NodeIndex,
        mut item: LibraryItem,
    ) -> Result<NodeIndex, LibraryError> {
        let parent_id = match self.nodes.get(parent) {
            Some(node) => node.item.id,
            None => return Err(LibraryError::NotFound(format!("node #{}", parent))),
        };
        if let Some(ref url) = item.url {
            if self.by_url.contains_key(url) {
                return Err(LibraryError::Conflict(url.clone()));
            }
        }
        item.parent_id = Some(parent_id);
        let index = self.nodes.len();
        if let Some(ref url) = item.url {
            self.by_url.insert(url.clone(), index);
        }
        self.nodes.push(LibraryNode {
            item,
            parent: Some(parent),
            children: Vec::new(),
            videos: HashSet::new(),
        });
        self.nodes[parent].children.push(index);
        Ok(index)
    }

    /// Ensures a node exists for `path` and for every ancestor up to (and
    /// including) `root`. Returns the node for `path` and every newly
    /// created item, root-first, so callers can persist the chain in order.
    pub fn ensure_folder_chain(
        &mut self,
        root: &Path,
        path: &Path,
    ) -> Result<(NodeIndex, Vec<LibraryItem>), LibraryError> {
        if !path.starts_with(root) {
            return Err(LibraryError::NotFound(path.display().to_string()));
        }

        let mut created = Vec::new();
        let root_url = root.to_string_lossy().to_string();
        let mut current = match self.find_by_url(&root_url) {
            Some(index) => index,
            None => {
                let name = root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| root_url.clone());
                let item = LibraryItem::folder(name, root_url, None);
                created.push(item.clone());
                self.add_root(item)
            }
        };

        let relative = path.strip_prefix(root).unwrap_or(path);
        let mut cursor = PathBuf::from(root);
        for component in relative.components() {
            cursor.push(component);
            let url = cursor.to_string_lossy().to_string();
            current = match self.find_by_url(&url) {
                Some(index) => index,
                None => {
                    let name = component.as_os_str().to_string_lossy().to_string();
                    let item = LibraryItem::folder(name, url, None);
                    created.push(item.clone());
                    self.add_child(current, item)?
                }
            };
        }

        Ok((current, created))
    }

    /// Unlinks a node from its parent. The node and its subtree stay in the
    /// arena but are no longer reachable from the roots.
    pub fn detach(&mut self, index: NodeIndex) -> Result<(), LibraryError> {
        let parent = match self.nodes.get(index) {
            Some(node) => node.parent,
            None => return Err(LibraryError::NotFound(format!("node #{}", index))),
        };
        if let Some(parent) = parent {
            self.nodes[parent].children.retain(|&c| c != index);
        }
        if let Some(url) = self.nodes[index].item.url.clone() {
            self.by_url.remove(&url);
        }
        self.nodes[index].parent = None;
        self.nodes[index].item.parent_id = None;
        Ok(())
    }

    pub fn set_smart_videos(
        &mut self,
        index: NodeIndex,
        videos: HashSet<Uuid>,
    ) -> Result<(), LibraryError> {
        let node = self
            .nodes
            .get_mut(index)
            .ok_or_else(|| LibraryError::NotFound(format!("node #{}", index)))?;
        if node.item.kind != LibraryItemKind::SmartFolder {
            return Err(LibraryError::OperationNotSupported {
                item_type: node.item.kind.as_str().to_string(),
            });
        }
        node.videos = videos;
        node.item.last_refresh = Some(chrono::Utc::now());
        Ok(())
    }

    /// Checks parent/child pointer consistency; used by tests.
    pub fn is_consistent(&self) -> bool {
        for (index, node) in self.nodes.iter().enumerate() {
            for &child in &node.children {
                match self.nodes.get(child) {
                    Some(c) if c.parent == Some(index) => {}
                    _ => return false,
                }
            }
            if let Some(parent) = node.parent {
                match self.nodes.get(parent) {
                    Some(p) if p.children.contains(&index) => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_chain_created_once_per_path() {
        let mut arena = LibraryArena::new();
        let root = Path::new("/library");
        let (leaf, created) = arena
            .ensure_folder_chain(root, Path::new("/library/2024/summer"))
            .unwrap();
        assert_eq!(created.len(), 3);
        assert_eq!(arena.get(leaf).unwrap().item.name, "summer");

        let (again, created_again) = arena
            .ensure_folder_chain(root, Path::new("/library/2024/summer"))
            .unwrap();
        assert_eq!(again, leaf);
        assert!(created_again.is_empty());

        let (_sibling, created_sibling) = arena
            .ensure_folder_chain(root, Path::new("/library/2024/winter"))
            .unwrap();
        assert_eq!(created_sibling.len(), 1);
        assert!(arena.is_consistent());
    }

    #[test]
    fn parent_child_pointers_stay_consistent() {
        let mut arena = LibraryArena::new();
        let root = arena.add_root(LibraryItem::folder(
            "library".to_string(),
            "/library".to_string(),
            None,
        ));
        let child = arena
            .add_child(
                root,
                LibraryItem::folder("a".to_string(), "/library/a".to_string(), None),
            )
            .unwrap();
        assert!(arena.is_consistent());
        assert_eq!(arena.get(child).unwrap().parent, Some(root));
        assert_eq!(
            arena.get(child).unwrap().item.parent_id,
            Some(arena.get(root).unwrap().item.id)
        );

        arena.detach(child).unwrap();
        assert!(arena.is_consistent());
        assert!(arena.get(root).unwrap().children.is_empty());
        assert!(arena.find_by_url("/library/a").is_none());
    }

    #[test]
    fn duplicate_urls_are_conflicts() {
        let mut arena = LibraryArena::new();
        let root = arena.add_root(LibraryItem::folder(
            "library".to_string(),
            "/library".to_string(),
            None,
        ));
        arena
            .add_child(
                root,
                LibraryItem::folder("a".to_string(), "/library/a".to_string(), None),
            )
            .unwrap();
        let err = arena
            .add_child(
                root,
                LibraryItem::folder("a".to_string(), "/library/a".to_string(), None),
            )
            .unwrap_err();
        assert!(matches!(err, LibraryError::Conflict(_)));
    }

    #[test]
    fn only_smart_folders_cache_videos() {
        let mut arena = LibraryArena::new();
        let folder = arena.add_root(LibraryItem::folder(
            "plain".to_string(),
            "/library".to_string(),
            None,
        ));
        let err = arena.set_smart_videos(folder, HashSet::new()).unwrap_err();
        assert!(matches!(err, LibraryError::OperationNotSupported { .. }));

        let smart = arena.add_root(LibraryItem::smart_folder(
            "big".to_string(),
            Default::default(),
        ));
        arena.set_smart_videos(smart, HashSet::new()).unwrap();
        assert!(arena.get(smart).unwrap().item.last_refresh.is_some());
    }
}
