//! Rebuilds a directory hierarchy from a flat listing of keys.
//!
//! Prefix stores only know full keys such as `photos/2024/a.jpg`; the directories are implied. A
//! [`Tree`] materializes every implied directory once, so a copy can walk the hierarchy and tell
//! leaves (objects) from inner nodes (directories) by their child count.
//!
//! Nodes live in an arena and refer to their children by id. The tree additionally indexes every
//! materialized relative path, so inserting a sibling of an already known key finds its parent
//! with a single lookup instead of descending from the root.

type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Default)]
struct Node {
    children: std::collections::BTreeMap<String, NodeId>,
}

#[derive(Debug)]
pub struct Tree {
    root_path: String,
    delimiter: String,
    nodes: Vec<Node>,
    index: std::collections::HashMap<String, NodeId>,
}

impl Tree {
    /// Creates an empty tree for keys below `root_path`.
    ///
    /// A non-empty root path is normalized to end with `delimiter`; an empty delimiter falls back
    /// to `/`.
    pub fn new(root_path: &str, delimiter: &str) -> Self {
        let delimiter = if delimiter.is_empty() { "/" } else { delimiter };
        let mut root_path = root_path.to_string();
        if !root_path.is_empty() && !root_path.ends_with(delimiter) {
            root_path.push_str(delimiter);
        }
        Self {
            root_path,
            delimiter: delimiter.to_string(),
            nodes: vec![Node::default()],
            index: std::collections::HashMap::new(),
        }
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// Number of materialized nodes, not counting the root.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `path` (a full key, including the root path) has been materialized.
    pub fn contains(&self, path: &str) -> bool {
        path.strip_prefix(self.root_path.as_str())
            .is_some_and(|relative| self.index.contains_key(relative))
    }

    /// Inserts `path` together with all of its implied ancestors.
    ///
    /// Keys outside of the root are ignored. Keys with an empty, `.` or `..` component are logged
    /// and skipped. Inserting a known key is a no-op.
    pub fn add(&mut self, path: &str) {
        let Some(relative) = path.strip_prefix(self.root_path.as_str()) else {
            tracing::debug!("ignoring {:?}: outside of {:?}", path, self.root_path);
            return;
        };
        if relative.is_empty() || self.index.contains_key(relative) {
            return;
        }
        // byte offsets at which each component of `relative` ends
        let mut ends = Vec::new();
        let mut offset = 0;
        for part in relative.split(self.delimiter.as_str()) {
            if part.is_empty() || part == "." || part == ".." {
                tracing::warn!("skipping {:?}: invalid path component {:?}", path, part);
                return;
            }
            offset += part.len();
            ends.push(offset);
            offset += self.delimiter.len();
        }
        // deepest materialized ancestor, the parent is checked first
        let mut depth = ends.len() - 1;
        let mut node = ROOT;
        while depth > 0 {
            if let Some(&id) = self.index.get(&relative[..ends[depth - 1]]) {
                node = id;
                break;
            }
            depth -= 1;
        }
        for level in depth..ends.len() {
            let start = if level == 0 {
                0
            } else {
                ends[level - 1] + self.delimiter.len()
            };
            let end = ends[level];
            let id = self.nodes.len();
            self.nodes.push(Node::default());
            self.nodes[node]
                .children
                .insert(relative[start..end].to_string(), id);
            self.index.insert(relative[..end].to_string(), id);
            node = id;
        }
    }

    /// Visits every node depth-first (parents before children, siblings in name order) with its
    /// full path and number of children.
    ///
    /// The first error returned by `visit` stops the walk and is passed through unchanged.
    pub fn walk<E>(&self, mut visit: impl FnMut(&str, usize) -> Result<(), E>) -> Result<(), E> {
        let mut path = self.root_path.clone();
        self.walk_node(ROOT, &mut path, &mut visit)
    }

    fn walk_node<E, F>(&self, node: NodeId, path: &mut String, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(&str, usize) -> Result<(), E>,
    {
        for (name, &child) in &self.nodes[node].children {
            let len = path.len();
            path.push_str(name);
            visit(path, self.nodes[child].children.len())?;
            path.push_str(&self.delimiter);
            self.walk_node(child, path, visit)?;
            path.truncate(len);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn collect(tree: &Tree) -> Vec<(String, usize)> {
        let mut visited = Vec::new();
        tree.walk(|path, children| {
            visited.push((path.to_string(), children));
            Ok::<_, anyhow::Error>(())
        })
        .unwrap();
        visited
    }

    fn sample_tree() -> Tree {
        let mut tree = Tree::new("root/", "/");
        for key in [
            "root/a", "root/b", "root/c", "root/a/d", "root/a/e", "root/a/f", "root/b/g",
            "root/b/g/h",
        ] {
            tree.add(key);
        }
        tree
    }

    #[test]
    fn walk_reports_child_counts() {
        let visited: std::collections::HashMap<_, _> =
            collect(&sample_tree()).into_iter().collect();
        let expected: std::collections::HashMap<String, usize> = [
            ("root/a", 3),
            ("root/b", 1),
            ("root/c", 0),
            ("root/a/d", 0),
            ("root/a/e", 0),
            ("root/a/f", 0),
            ("root/b/g", 1),
            ("root/b/g/h", 0),
        ]
        .into_iter()
        .map(|(path, count)| (path.to_string(), count))
        .collect();
        assert_eq!(visited, expected);
    }

    #[test]
    fn walk_is_depth_first_in_name_order() {
        let order: Vec<String> = collect(&sample_tree())
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        assert_eq!(
            order,
            vec![
                "root/a",
                "root/a/d",
                "root/a/e",
                "root/a/f",
                "root/b",
                "root/b/g",
                "root/b/g/h",
                "root/c",
            ]
        );
    }

    #[test]
    fn walk_stops_on_first_error() {
        let tree = sample_tree();
        let mut visited = 0;
        let result = tree.walk(|path, _| {
            visited += 1;
            if path == "root/a/e" {
                anyhow::bail!("stop at {}", path);
            }
            Ok(())
        });
        assert_eq!(result.unwrap_err().to_string(), "stop at root/a/e");
        assert_eq!(visited, 3);
    }

    #[test]
    fn deep_key_materializes_ancestors() {
        let mut tree = Tree::new("root", "/");
        assert_eq!(tree.root_path(), "root/");
        tree.add("root/x/y/z");
        assert_eq!(
            collect(&tree),
            vec![
                ("root/x".to_string(), 1),
                ("root/x/y".to_string(), 1),
                ("root/x/y/z".to_string(), 0),
            ]
        );
        tree.add("root/x/y/w");
        assert_eq!(tree.len(), 4);
        assert!(tree.contains("root/x/y/w"));
    }

    #[test]
    fn re_adding_is_a_no_op() {
        let mut tree = sample_tree();
        let before = collect(&tree);
        tree.add("root/a/d");
        tree.add("root/b");
        assert_eq!(collect(&tree), before);
        assert_eq!(tree.len(), 8);
    }

    #[test]
    fn keys_outside_root_and_invalid_components_are_dropped() {
        let mut tree = Tree::new("root/", "/");
        tree.add("etc/passwd");
        tree.add("root/a//b");
        tree.add("root/a/./b");
        tree.add("root/a/../b");
        tree.add("root/a/");
        tree.add("root/");
        assert!(tree.is_empty());
        assert!(collect(&tree).is_empty());
    }

    #[test]
    fn empty_root_accepts_all_keys() {
        let mut tree = Tree::new("", "/");
        tree.add("a/b");
        tree.add("c");
        assert_eq!(
            collect(&tree),
            vec![
                ("a".to_string(), 1),
                ("a/b".to_string(), 0),
                ("c".to_string(), 0),
            ]
        );
    }

    proptest! {
        #[test]
        fn every_prefix_is_visited_once(keys in prop::collection::vec(
            prop::collection::vec("[a-c]{1,2}", 1..4), 0..20)
        ) {
            let mut tree = Tree::new("r/", "/");
            let mut expected = std::collections::BTreeMap::<String, std::collections::BTreeSet<String>>::new();
            for parts in &keys {
                tree.add(&format!("r/{}", parts.join("/")));
                for depth in 1..=parts.len() {
                    let prefix = format!("r/{}", parts[..depth].join("/"));
                    let children = expected.entry(prefix).or_default();
                    if depth < parts.len() {
                        children.insert(parts[depth].clone());
                    }
                }
            }
            let visited = collect(&tree);
            prop_assert_eq!(visited.len(), expected.len());
            for (path, count) in visited {
                let children = expected.get(&path);
                prop_assert!(children.is_some());
                prop_assert_eq!(children.map(|c| c.len()), Some(count));
            }
        }
    }
}
