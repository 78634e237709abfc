//! Virtual project trees and the mount payloads built from them.
//!
//! A [`TreeNode`] is the declarative description of a project layout (as
//! delivered by the assessment backend). [`build_mount_payload`] turns it into
//! the nested `{file: {contents}}` / `{directory: {...}}` mapping a sandbox
//! mounts.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// One node of a virtual project layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeNode {
    Folder {
        name: String,
        #[serde(default)]
        children: Vec<TreeNode>,
    },
    File {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        content: String,
    },
}

/// Entry of a mount payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountEntry {
    File { contents: String },
    Directory(MountTree),
}

/// Mount payload: name to entry, one level of the tree.
pub type MountTree = BTreeMap<String, MountEntry>;

impl TreeNode {
    pub fn folder(name: impl Into<String>, children: Vec<TreeNode>) -> Self {
        TreeNode::Folder {
            name: name.into(),
            children,
        }
    }

    pub fn file(name: impl Into<String>, content: impl Into<String>) -> Self {
        TreeNode::File {
            name: name.into(),
            path: None,
            content: content.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TreeNode::Folder { name, .. } | TreeNode::File { name, .. } => name,
        }
    }

    /// Check sibling uniqueness and that every name is a single safe path segment.
    /// Check the names that end up in a mount payload. A root folder is
    /// never mounted, so only its children are checked.
    pub fn validate(&self) -> Result<()> {
        match self {
            TreeNode::Folder { children, .. } => validate_children(children),
            file => check_segment(file.name()),
        }
    }

    /// Every file below this node keyed by its slash-joined path, the root's
    /// own name excluded.
    pub fn files(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        match self {
            TreeNode::Folder { children, .. } => {
                for child in children {
                    collect_node_files(child, "", &mut out);
                }
            }
            file => collect_node_files(file, "", &mut out),
        }
        out
    }
}

fn validate_children(children: &[TreeNode]) -> Result<()> {
    let mut seen = HashSet::new();
    for child in children {
        if !seen.insert(child.name()) {
            return Err(Error::InvalidTree(format!(
                "duplicate sibling name: {}",
                child.name()
            )));
        }
        check_segment(child.name())?;
        if let TreeNode::Folder { children, .. } = child {
            validate_children(children)?;
        }
    }
    Ok(())
}

/// Reject names that are empty or could escape their parent directory.
pub(crate) fn check_segment(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\')
    {
        return Err(Error::InvalidTree(format!("invalid name: {:?}", name)));
    }
    Ok(())
}

fn collect_node_files(node: &TreeNode, prefix: &str, out: &mut BTreeMap<String, String>) {
    let path = join(prefix, node.name());
    match node {
        TreeNode::File { content, .. } => {
            out.insert(path, content.clone());
        }
        TreeNode::Folder { children, .. } => {
            for child in children {
                collect_node_files(child, &path, out);
            }
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Build the mount payload for `root`.
///
/// The root folder itself is not represented; its children become the top
/// level of the payload. Siblings sharing a name overwrite each other in order.
pub fn build_mount_payload(root: &TreeNode) -> MountTree {
    match root {
        TreeNode::Folder { children, .. } => build_level(children),
        file => build_level(std::slice::from_ref(file)),
    }
}

fn build_level(nodes: &[TreeNode]) -> MountTree {
    let mut level = MountTree::new();
    for node in nodes {
        let entry = match node {
            TreeNode::File { content, .. } => MountEntry::File {
                contents: content.clone(),
            },
            TreeNode::Folder { children, .. } => MountEntry::Directory(build_level(children)),
        };
        level.insert(node.name().to_string(), entry);
    }
    level
}

/// Re-derive `path -> contents` from a payload.
pub fn payload_files(payload: &MountTree) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    collect_payload_files(payload, "", &mut out);
    out
}

fn collect_payload_files(level: &MountTree, prefix: &str, out: &mut BTreeMap<String, String>) {
    for (name, entry) in level {
        let path = join(prefix, name);
        match entry {
            MountEntry::File { contents } => {
                out.insert(path, contents.clone());
            }
            MountEntry::Directory(children) => collect_payload_files(children, &path, out),
        }
    }
}

/// Write a payload under `root` on the local filesystem.
pub async fn materialize(payload: &MountTree, root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(root).await?;
    // Depth-first without recursion so the future stays Sized.
    let mut pending: Vec<(std::path::PathBuf, &MountTree)> = vec![(root.to_path_buf(), payload)];
    while let Some((dir, level)) = pending.pop() {
        for (name, entry) in level {
            check_segment(name)?;
            let target = dir.join(name);
            match entry {
                MountEntry::File { contents } => {
                    tokio::fs::write(&target, contents).await?;
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o644))
                            .await?;
                    }
                }
                MountEntry::Directory(children) => {
                    tokio::fs::create_dir_all(&target).await?;
                    pending.push((target, children));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> TreeNode {
        TreeNode::folder(
            "root",
            vec![
                TreeNode::file("package.json", "{}"),
                TreeNode::folder(
                    "src",
                    vec![
                        TreeNode::file("App.jsx", "export default 1"),
                        TreeNode::folder("components", vec![TreeNode::file("Button.jsx", "")]),
                        TreeNode::folder("empty", vec![]),
                    ],
                ),
            ],
        )
    }

    #[test]
    fn single_file_in_folder_matches_mount_shape() {
        let root = TreeNode::folder(
            "root",
            vec![TreeNode::folder("src", vec![TreeNode::file("App.jsx", "X")])],
        );
        let payload = serde_json::to_value(build_mount_payload(&root)).unwrap();
        assert_eq!(
            payload,
            json!({"src": {"directory": {"App.jsx": {"file": {"contents": "X"}}}}})
        );
    }

    #[test]
    fn payload_preserves_every_file() {
        let root = sample();
        let payload = build_mount_payload(&root);
        assert_eq!(payload_files(&payload), root.files());
        assert_eq!(root.files().len(), 3);
        assert!(matches!(payload.get("src"), Some(MountEntry::Directory(d)) if d.contains_key("empty")));
    }

    #[test]
    fn deserializes_backend_tree() {
        let raw = json!({
            "name": "root",
            "type": "folder",
            "children": [
                {"name": "index.html", "type": "file", "path": "/index.html", "content": "<p/>"}
            ]
        });
        let node: TreeNode = serde_json::from_value(raw).unwrap();
        assert_eq!(node.files().get("index.html").map(String::as_str), Some("<p/>"));
    }

    #[test]
    fn validate_rejects_duplicates_and_traversal() {
        let dup = TreeNode::folder("root", vec![TreeNode::file("a", "1"), TreeNode::file("a", "2")]);
        assert!(matches!(dup.validate(), Err(Error::InvalidTree(_))));

        let escape = TreeNode::folder("root", vec![TreeNode::file("..", "x")]);
        assert!(escape.validate().is_err());

        assert!(sample().validate().is_ok());
    }

    #[test]
    fn root_folder_name_is_not_checked() {
        for name in ["", "/"] {
            let tree = TreeNode::folder(name, vec![TreeNode::file("index.js", "1")]);
            assert!(tree.validate().is_ok(), "root named {:?}", name);
        }
        let nested = TreeNode::folder("", vec![TreeNode::folder("/", vec![])]);
        assert!(nested.validate().is_err());
        assert!(TreeNode::file("", "x").validate().is_err());
    }

    #[test]
    fn duplicate_siblings_overwrite_in_order() {
        let dup = TreeNode::folder("root", vec![TreeNode::file("a", "1"), TreeNode::file("a", "2")]);
        assert_eq!(
            build_mount_payload(&dup).get("a"),
            Some(&MountEntry::File {
                contents: "2".into()
            })
        );
    }

    #[tokio::test]
    async fn materialize_writes_files() {
        let dir = std::env::temp_dir().join(format!("exambox-tree-{}", uuid::Uuid::new_v4()));
        materialize(&build_mount_payload(&sample()), &dir).await.unwrap();

        let app = tokio::fs::read_to_string(dir.join("src/App.jsx")).await.unwrap();
        assert_eq!(app, "export default 1");
        assert!(dir.join("src/empty").is_dir());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
