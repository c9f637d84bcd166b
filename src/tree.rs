//! The topic tree: an ino-indexed arena mirroring the broker's topic
//! namespace as a directory tree, shaped to FUSE's lookup-by-(parent,
//! name) and getattr-by-ino operation model rather than spec.md's
//! path-based `find`/`insert_path` pseudocode.
//!
//! Inodes are handed out monotonically and never reused, so there is
//! no generation-counter bookkeeping beyond the constant `1` fuser
//! expects back in a `ReplyEntry`.

use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::error::{bail, Error, ErrorKind, Result};

pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
pub enum NodeKind {
    Directory { children: BTreeMap<Vec<u8>, u64> },
    File { payload: Vec<u8>, handles: Vec<u64> },
}

#[derive(Debug)]
pub struct Node {
    pub ino: u64,
    pub parent: u64,
    pub name: Vec<u8>,
    pub kind: NodeKind,
    pub mtime: SystemTime,
}

impl Node {
    fn directory(ino: u64, parent: u64, name: Vec<u8>) -> Self {
        Node {
            ino,
            parent,
            name,
            kind: NodeKind::Directory {
                children: BTreeMap::new(),
            },
            mtime: SystemTime::now(),
        }
    }

    fn file(ino: u64, parent: u64, name: Vec<u8>) -> Self {
        Node {
            ino,
            parent,
            name,
            kind: NodeKind::File {
                payload: Vec::new(),
                handles: Vec::new(),
            },
            mtime: SystemTime::now(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }
}

/// An open handle on a file node: tracks whether a publish has
/// touched this node since the last time a POLL observed it, and the
/// last poll token registered for an out-of-band wakeup.
#[derive(Debug, Default)]
pub struct Handle {
    pub ino: u64,
    pub updated: bool,
    pub poll_token: Option<u64>,
}

pub struct Tree {
    nodes: std::collections::HashMap<u64, Node>,
    handles: std::collections::HashMap<u64, Handle>,
    next_ino: u64,
    next_fh: u64,
}

impl Tree {
    pub fn new() -> Self {
        let mut nodes = std::collections::HashMap::new();
        nodes.insert(ROOT_INO, Node::directory(ROOT_INO, ROOT_INO, Vec::new()));
        Tree {
            nodes,
            handles: std::collections::HashMap::new(),
            next_ino: ROOT_INO + 1,
            next_fh: 1,
        }
    }

    fn alloc_ino(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    pub fn alloc_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }

    pub fn get(&self, ino: u64) -> Result<&Node> {
        self.nodes
            .get(&ino)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no such inode {ino}")))
    }

    fn get_mut(&mut self, ino: u64) -> Result<&mut Node> {
        self.nodes
            .get_mut(&ino)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no such inode {ino}")))
    }

    /// Look up a child of `parent` by name.
    pub fn lookup_child(&self, parent: u64, name: &[u8]) -> Result<&Node> {
        let parent_node = self.get(parent)?;
        let children = match &parent_node.kind {
            NodeKind::Directory { children } => children,
            NodeKind::File { .. } => bail!(ErrorKind::NotADirectory, "inode {parent} is a file"),
        };
        let ino = *children
            .get(name)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such child"))?;
        self.get(ino)
    }

    /// List a directory's entries in name-sorted order, with `.` and
    /// `..` prepended.
    pub fn readdir(&self, ino: u64) -> Result<Vec<(u64, Vec<u8>, bool)>> {
        let node = self.get(ino)?;
        let children = match &node.kind {
            NodeKind::Directory { children } => children,
            NodeKind::File { .. } => bail!(ErrorKind::NotADirectory, "inode {ino} is a file"),
        };
        let mut out = vec![(node.ino, b".".to_vec(), true), (node.parent, b"..".to_vec(), true)];
        for (name, &child_ino) in children {
            let is_dir = self.get(child_ino)?.is_dir();
            out.push((child_ino, name.clone(), is_dir));
        }
        Ok(out)
    }

    /// Walk a `/`-delimited path from the root, creating any missing
    /// intermediate directories, and set the leaf's payload. Used by
    /// the broker client's publish callback to project a retained
    /// message onto the tree.
    pub fn insert_path(&mut self, path: &[u8], payload: &[u8]) -> Result<u64> {
        let mut parent = ROOT_INO;
        let segments: Vec<&[u8]> = path.split(|&b| b == b'/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            bail!(ErrorKind::InvalidArgument, "empty topic path");
        }
        for seg in &segments[..segments.len() - 1] {
            parent = self.ensure_directory(parent, seg)?;
        }
        let leaf = segments[segments.len() - 1];
        let ino = self.ensure_file(parent, leaf)?;
        if let NodeKind::File { payload: p, .. } = &mut self.get_mut(ino)?.kind {
            p.clear();
            p.extend_from_slice(payload);
        }
        self.get_mut(ino)?.mtime = SystemTime::now();
        Ok(ino)
    }

    fn ensure_directory(&mut self, parent: u64, name: &[u8]) -> Result<u64> {
        if let NodeKind::Directory { children } = &self.get(parent)?.kind {
            if let Some(&ino) = children.get(name) {
                if !self.get(ino)?.is_dir() {
                    bail!(ErrorKind::NotADirectory, "path component is a file");
                }
                return Ok(ino);
            }
        }
        self.mkdir(parent, name)
    }

    fn ensure_file(&mut self, parent: u64, name: &[u8]) -> Result<u64> {
        if let NodeKind::Directory { children } = &self.get(parent)?.kind {
            if let Some(&ino) = children.get(name) {
                if self.get(ino)?.is_dir() {
                    bail!(ErrorKind::IsADirectory, "path component is a directory");
                }
                return Ok(ino);
            }
        }
        self.create_file(parent, name)
    }

    pub fn mkdir(&mut self, parent: u64, name: &[u8]) -> Result<u64> {
        self.check_parent_dir(parent)?;
        self.check_name_free(parent, name)?;
        let ino = self.alloc_ino();
        self.nodes.insert(ino, Node::directory(ino, parent, name.to_vec()));
        self.link_child(parent, name, ino)?;
        Ok(ino)
    }

    pub fn create_file(&mut self, parent: u64, name: &[u8]) -> Result<u64> {
        self.check_parent_dir(parent)?;
        self.check_name_free(parent, name)?;
        let ino = self.alloc_ino();
        self.nodes.insert(ino, Node::file(ino, parent, name.to_vec()));
        self.link_child(parent, name, ino)?;
        Ok(ino)
    }

    fn check_parent_dir(&self, parent: u64) -> Result<()> {
        if !self.get(parent)?.is_dir() {
            bail!(ErrorKind::NotADirectory, "parent {parent} is not a directory");
        }
        Ok(())
    }

    fn check_name_free(&self, parent: u64, name: &[u8]) -> Result<()> {
        if let NodeKind::Directory { children } = &self.get(parent)?.kind {
            if children.contains_key(name) {
                bail!(ErrorKind::Exists, "name already exists in directory");
            }
        }
        Ok(())
    }

    fn link_child(&mut self, parent: u64, name: &[u8], ino: u64) -> Result<()> {
        if let NodeKind::Directory { children } = &mut self.get_mut(parent)?.kind {
            children.insert(name.to_vec(), ino);
        }
        Ok(())
    }

    pub fn unlink(&mut self, parent: u64, name: &[u8]) -> Result<()> {
        let ino = self.lookup_child(parent, name)?.ino;
        if self.get(ino)?.is_dir() {
            bail!(ErrorKind::IsADirectory, "cannot unlink a directory");
        }
        if let NodeKind::Directory { children } = &mut self.get_mut(parent)?.kind {
            children.remove(name);
        }
        self.nodes.remove(&ino);
        self.handles.retain(|_, h| h.ino != ino);
        Ok(())
    }

    pub fn rmdir(&mut self, parent: u64, name: &[u8]) -> Result<()> {
        let ino = self.lookup_child(parent, name)?.ino;
        match &self.get(ino)?.kind {
            NodeKind::Directory { children } if children.is_empty() => {}
            NodeKind::Directory { .. } => bail!(ErrorKind::InvalidArgument, "directory not empty"),
            NodeKind::File { .. } => bail!(ErrorKind::NotADirectory, "not a directory"),
        }
        if let NodeKind::Directory { children } = &mut self.get_mut(parent)?.kind {
            children.remove(name);
        }
        self.nodes.remove(&ino);
        Ok(())
    }

    /// Set a file's payload directly by ino (used for WRITE), marking
    /// every open handle on it as updated and returning any stored
    /// poll tokens so the caller can fire wakeups outside the tree
    /// lock.
    pub fn write_payload(&mut self, ino: u64, data: &[u8]) -> Result<Vec<u64>> {
        let node = self.get_mut(ino)?;
        match &mut node.kind {
            NodeKind::File { payload, handles } => {
                payload.clear();
                payload.extend_from_slice(data);
                let owners = handles.clone();
                node.mtime = SystemTime::now();
                let mut tokens = Vec::new();
                for fh in owners {
                    if let Some(h) = self.handles.get_mut(&fh) {
                        h.updated = true;
                        if let Some(t) = h.poll_token.take() {
                            tokens.push(t);
                        }
                    }
                }
                Ok(tokens)
            }
            NodeKind::Directory { .. } => bail!(ErrorKind::IsADirectory, "cannot write a directory"),
        }
    }

    /// Apply an inbound broker publish: walk/create the path and mark
    /// handles updated, same wakeup bookkeeping as `write_payload`.
    pub fn apply_publish(&mut self, topic: &[u8], payload: &[u8]) -> Result<Vec<u64>> {
        let ino = self.insert_path(topic, payload)?;
        if let NodeKind::File { handles, .. } = &self.get(ino)?.kind {
            let owners = handles.clone();
            let mut tokens = Vec::new();
            for fh in owners {
                if let Some(h) = self.handles.get_mut(&fh) {
                    h.updated = true;
                    if let Some(t) = h.poll_token.take() {
                        tokens.push(t);
                    }
                }
            }
            return Ok(tokens);
        }
        Ok(Vec::new())
    }

    pub fn attach_handle(&mut self, ino: u64) -> Result<u64> {
        let fh = self.alloc_fh();
        if let NodeKind::File { handles, .. } = &mut self.get_mut(ino)?.kind {
            handles.push(fh);
        } else {
            bail!(ErrorKind::IsADirectory, "cannot open a directory as a file");
        }
        self.handles.insert(
            fh,
            Handle {
                ino,
                updated: false,
                poll_token: None,
            },
        );
        Ok(fh)
    }

    pub fn detach_handle(&mut self, fh: u64) {
        if let Some(handle) = self.handles.remove(&fh) {
            if let Ok(node) = self.get_mut(handle.ino) {
                if let NodeKind::File { handles, .. } = &mut node.kind {
                    handles.retain(|&h| h != fh);
                }
            }
        }
    }

    pub fn handle(&self, fh: u64) -> Result<&Handle> {
        self.handles
            .get(&fh)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such open handle"))
    }

    /// Compute POLLIN-or-not, clear `updated`, and store `token` for
    /// the next publish to fire — the single rule both the opcode
    /// table and the poll-wakeup paragraph describe.
    pub fn poll(&mut self, fh: u64, token: Option<u64>) -> Result<bool> {
        let handle = self
            .handles
            .get_mut(&fh)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such open handle"))?;
        let ready = handle.updated;
        handle.updated = false;
        if token.is_some() {
            handle.poll_token = token;
        }
        Ok(ready)
    }

    /// Rebuild the `/`-joined topic path of a node by walking parent
    /// pointers up to the root.
    pub fn path_of(&self, ino: u64) -> Result<Vec<u8>> {
        let mut segments = Vec::new();
        let mut cur = ino;
        while cur != ROOT_INO {
            let node = self.get(cur)?;
            segments.push(node.name.clone());
            cur = node.parent;
        }
        segments.reverse();
        Ok(segments.join(&b'/'))
    }

    pub fn payload(&self, ino: u64) -> Result<&[u8]> {
        match &self.get(ino)?.kind {
            NodeKind::File { payload, .. } => Ok(payload),
            NodeKind::Directory { .. } => bail!(ErrorKind::IsADirectory, "inode {ino} is a directory"),
        }
    }
}

impl Default for Tree {
    fn default() -> Self {
        Tree::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_path_creates_intermediate_directories() {
        let mut tree = Tree::new();
        let ino = tree.insert_path(b"room/light/state", b"ON").unwrap();
        assert_eq!(tree.payload(ino).unwrap(), b"ON");
        let room = tree.lookup_child(ROOT_INO, b"room").unwrap();
        assert!(room.is_dir());
        let room_ino = room.ino;
        let light = tree.lookup_child(room_ino, b"light").unwrap();
        assert!(light.is_dir());
    }

    #[test]
    fn insert_path_twice_replaces_payload() {
        let mut tree = Tree::new();
        tree.insert_path(b"a/b", b"1").unwrap();
        let ino = tree.insert_path(b"a/b", b"2").unwrap();
        assert_eq!(tree.payload(ino).unwrap(), b"2");
    }

    #[test]
    fn readdir_is_sorted_and_has_dot_entries() {
        let mut tree = Tree::new();
        tree.insert_path(b"zeta", b"").unwrap();
        tree.insert_path(b"alpha", b"").unwrap();
        let entries = tree.readdir(ROOT_INO).unwrap();
        let names: Vec<&[u8]> = entries.iter().map(|(_, n, _)| n.as_slice()).collect();
        assert_eq!(names, vec![b".".as_slice(), b"..".as_slice(), b"alpha".as_slice(), b"zeta".as_slice()]);
    }

    #[test]
    fn rmdir_rejects_nonempty() {
        let mut tree = Tree::new();
        tree.mkdir(ROOT_INO, b"room").unwrap();
        let room = tree.lookup_child(ROOT_INO, b"room").unwrap().ino;
        tree.create_file(room, b"light").unwrap();
        assert!(tree.rmdir(ROOT_INO, b"room").is_err());
    }

    #[test]
    fn write_payload_marks_handle_updated() {
        let mut tree = Tree::new();
        let ino = tree.create_file(ROOT_INO, b"switch").unwrap();
        let fh = tree.attach_handle(ino).unwrap();
        assert!(!tree.handle(fh).unwrap().updated);
        tree.write_payload(ino, b"ON").unwrap();
        assert!(tree.handle(fh).unwrap().updated);
    }

    #[test]
    fn poll_clears_updated_and_stores_token() {
        let mut tree = Tree::new();
        let ino = tree.create_file(ROOT_INO, b"switch").unwrap();
        let fh = tree.attach_handle(ino).unwrap();
        tree.write_payload(ino, b"ON").unwrap();
        let ready = tree.poll(fh, Some(42)).unwrap();
        assert!(ready);
        assert!(!tree.handle(fh).unwrap().updated);
        assert_eq!(tree.handle(fh).unwrap().poll_token, Some(42));
    }

    #[test]
    fn apply_publish_returns_stored_tokens() {
        let mut tree = Tree::new();
        let ino = tree.create_file(ROOT_INO, b"switch").unwrap();
        let fh = tree.attach_handle(ino).unwrap();
        tree.poll(fh, Some(7)).unwrap();
        let tokens = tree.apply_publish(b"switch", b"OFF").unwrap();
        assert_eq!(tokens, vec![7]);
    }

    #[test]
    fn path_of_rebuilds_full_topic() {
        let mut tree = Tree::new();
        let ino = tree.insert_path(b"room/light/state", b"ON").unwrap();
        assert_eq!(tree.path_of(ino).unwrap(), b"room/light/state");
    }

    #[test]
    fn unlink_removes_node_and_handles() {
        let mut tree = Tree::new();
        let ino = tree.create_file(ROOT_INO, b"switch").unwrap();
        tree.attach_handle(ino).unwrap();
        tree.unlink(ROOT_INO, b"switch").unwrap();
        assert!(tree.lookup_child(ROOT_INO, b"switch").is_err());
    }
}
