//! Directory listings as content-addressed, serialized objects (§3.4).

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use data_encoding::BASE64;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hashing::ObjectId;

/// What kind of filesystem entry a [`Node`] records.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    File,
    Dir,
    Symlink,
    Dev,
    Chardev,
    Fifo,
    Socket,
}

/// One filesystem entry: a file, directory, symlink, or special file,
/// together with the metadata needed to restore it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub variant: Variant,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub access_time: Timestamp,
    pub modify_time: Timestamp,
    pub change_time: Timestamp,

    /// Files only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u64>,
    /// Devices only: (major, minor).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub device_numbers: Option<(u32, u32)>,
    /// Symlinks only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub link_target: Option<Utf8PathBuf>,
    /// Files only: the ordered list of data-chunk ids making up its content.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub content: Vec<ObjectId>,
    /// Directories only: the id of the [`Tree`] describing its contents.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subtree: Option<ObjectId>,
    /// Extended attribute values, base64-encoded since xattrs are opaque
    /// bytes and everything on disk here is JSON/UTF-8.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub xattrs: BTreeMap<String, String>,
    /// Set when the archiver couldn't fully read this entry; the node is
    /// still emitted with whatever content it did manage (§3.4).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl Node {
    pub fn xattr(&mut self, name: impl Into<String>, value: &[u8]) {
        self.xattrs.insert(name.into(), BASE64.encode(value));
    }

    pub fn xattr_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.xattrs.get(name).and_then(|v| BASE64.decode(v.as_bytes()).ok())
    }
}

/// A directory listing: `{"nodes": [...]}`, nodes sorted by name (§3.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Builds a tree from nodes in any order, enforcing the sorted-by-name
    /// invariant.
    pub fn new(mut nodes: Vec<Node>) -> Result<Self> {
        nodes.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        for pair in nodes.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(Error::invalid(
                    "tree",
                    format!("duplicate entry name {:?}", pair[0].name),
                ));
            }
        }
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes
            .binary_search_by(|n| n.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.nodes[i])
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// The canonical JSON bytes whose SHA-256 is this tree's [`ObjectId`]
    /// (§3.1). Field order is fixed by struct definition order, so this is
    /// stable across processes.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let tree: Tree = serde_json::from_slice(bytes)?;
        for pair in tree.nodes.windows(2) {
            if pair[0].name.as_bytes() > pair[1].name.as_bytes() {
                return Err(Error::Corrupted(
                    "tree".to_string(),
                    "nodes aren't sorted by name".to_string(),
                ));
            }
        }
        Ok(tree)
    }

    pub fn id(&self) -> Result<ObjectId> {
        Ok(ObjectId::hash(&self.to_canonical_json()?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn epoch() -> Timestamp {
        Timestamp::from_second(0).unwrap()
    }

    fn file_node(name: &str, content: Vec<ObjectId>) -> Node {
        Node {
            name: name.to_string(),
            variant: Variant::File,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            access_time: epoch(),
            modify_time: epoch(),
            change_time: epoch(),
            size: Some(content.len() as u64),
            device_numbers: None,
            link_target: None,
            content,
            subtree: None,
            xattrs: BTreeMap::new(),
            error: None,
        }
    }

    #[test]
    fn nodes_are_sorted_by_name() {
        let tree = Tree::new(vec![
            file_node("zebra", vec![]),
            file_node("apple", vec![]),
            file_node("mango", vec![]),
        ])
        .unwrap();
        let names: Vec<_> = tree.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["apple", "mango", "zebra"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Tree::new(vec![file_node("a", vec![]), file_node("a", vec![])]).unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }));
    }

    #[test]
    fn serialization_round_trips_and_is_deterministic() {
        let tree = Tree::new(vec![
            file_node("b", vec![ObjectId::hash(b"chunk1")]),
            file_node("a", vec![]),
        ])
        .unwrap();

        let json1 = tree.to_canonical_json().unwrap();
        let json2 = tree.to_canonical_json().unwrap();
        assert_eq!(json1, json2);

        let restored = Tree::from_slice(&json1).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(tree.id().unwrap(), restored.id().unwrap());
    }

    #[test]
    fn unsorted_serialized_tree_is_rejected_on_load() {
        let bad = br#"{"nodes":[{"name":"z","variant":"file","mode":0,"uid":0,"gid":0,"access_time":"1970-01-01T00:00:00Z","modify_time":"1970-01-01T00:00:00Z","change_time":"1970-01-01T00:00:00Z"},{"name":"a","variant":"file","mode":0,"uid":0,"gid":0,"access_time":"1970-01-01T00:00:00Z","modify_time":"1970-01-01T00:00:00Z","change_time":"1970-01-01T00:00:00Z"}]}"#;
        assert!(Tree::from_slice(bad).is_err());
    }

    #[test]
    fn xattrs_round_trip_through_base64() {
        let mut node = file_node("f", vec![]);
        node.xattr("user.comment", b"\x00\x01binary");
        assert_eq!(node.xattr_bytes("user.comment").unwrap(), b"\x00\x01binary");
    }
}
