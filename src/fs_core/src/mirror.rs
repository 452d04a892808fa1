use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::paths;
use crate::{FsError, FsResult};

pub type NodeId = u64;

/// The root directory's id. Matches the FUSE root inode so the adapter can
/// use ids and inodes interchangeably for the root.
pub const ROOT_ID: NodeId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Directory,
    File,
    Symlink,
}

/// Stat record handed to the VFS adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub kind: NodeType,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
}

#[derive(Debug)]
pub enum NodeKind {
    Directory { children: BTreeMap<String, NodeId> },
    File { content: Vec<u8> },
    Symlink { target: String },
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub parent: Option<NodeId>,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub kind: NodeKind,
}

impl Node {
    fn new(name: String, parent: Option<NodeId>, kind: NodeKind) -> Self {
        let now = SystemTime::now();
        Self {
            name,
            parent,
            atime: now,
            mtime: now,
            kind,
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::Directory { .. } => NodeType::Directory,
            NodeKind::File { .. } => NodeType::File,
            NodeKind::Symlink { .. } => NodeType::Symlink,
        }
    }
}

/// In-memory tree of everything mounted at `/`.
///
/// Nodes live in an arena keyed by `NodeId`; owning edges go parent→child
/// through directory child maps, the back edge is a bare id. All operations
/// are synchronous and answer in path-length time. Callers share the mirror
/// behind an `RwLock`: mutating operations take the write lock across
/// locate-parent + mutate, reads take the shared lock.
pub struct Mirror {
    nodes: HashMap<NodeId, Node>,
    next_id: NodeId,
}

pub type MirrorRef = Arc<RwLock<Mirror>>;

impl Mirror {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID,
            Node::new(
                "/".to_string(),
                None,
                NodeKind::Directory {
                    children: BTreeMap::new(),
                },
            ),
        );
        Self {
            nodes,
            next_id: ROOT_ID + 1,
        }
    }

    pub fn new_shared() -> MirrorRef {
        Arc::new(RwLock::new(Mirror::new()))
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Descend from the root along `path`. Does not follow symlinks; the
    /// kernel resolves those through `readlink`.
    pub fn find(&self, path: &str) -> Option<NodeId> {
        let mut current = ROOT_ID;
        for component in paths::components(path) {
            let node = self.nodes.get(&current)?;
            match &node.kind {
                NodeKind::Directory { children } => {
                    current = *children.get(component)?;
                }
                _ => return None,
            }
        }
        Some(current)
    }

    /// Absolute path of `id`, rebuilt through parent links.
    pub fn path_of(&self, id: NodeId) -> String {
        if id == ROOT_ID {
            return "/".to_string();
        }
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(cursor) = current {
            if cursor == ROOT_ID {
                break;
            }
            match self.nodes.get(&cursor) {
                Some(node) => {
                    parts.push(node.name.clone());
                    current = node.parent;
                }
                None => break,
            }
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    fn insert_child(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> FsResult<NodeId> {
        let id = self.next_id;
        {
            let parent_node = self
                .nodes
                .get_mut(&parent)
                .ok_or_else(|| FsError::NotFound(name.to_string()))?;
            match &mut parent_node.kind {
                NodeKind::Directory { children } => {
                    if children.contains_key(name) {
                        return Err(FsError::AlreadyExists(name.to_string()));
                    }
                    children.insert(name.to_string(), id);
                }
                _ => return Err(FsError::NotADirectory(parent_node.name.clone())),
            }
            parent_node.mtime = SystemTime::now();
        }
        self.nodes
            .insert(id, Node::new(name.to_string(), Some(parent), kind));
        self.next_id += 1;
        Ok(id)
    }

    pub fn mkdir(&mut self, parent: NodeId, name: &str) -> FsResult<NodeId> {
        self.insert_child(
            parent,
            name,
            NodeKind::Directory {
                children: BTreeMap::new(),
            },
        )
    }

    pub fn mkfile(&mut self, parent: NodeId, name: &str) -> FsResult<NodeId> {
        self.insert_child(parent, name, NodeKind::File { content: Vec::new() })
    }

    pub fn mksymlink(&mut self, parent: NodeId, name: &str, target: &str) -> FsResult<NodeId> {
        self.insert_child(
            parent,
            name,
            NodeKind::Symlink {
                target: target.to_string(),
            },
        )
    }

    /// Unhook `id` from its parent without dropping it from the arena.
    pub fn detach(&mut self, id: NodeId) -> FsResult<()> {
        let (parent_id, name) = {
            let node = self
                .nodes
                .get(&id)
                .ok_or_else(|| FsError::NotFound(id.to_string()))?;
            match node.parent {
                Some(parent) => (parent, node.name.clone()),
                None => return Err(FsError::InvalidArgument("detach of root".to_string())),
            }
        };
        if let Some(parent_node) = self.nodes.get_mut(&parent_id) {
            if let NodeKind::Directory { children } = &mut parent_node.kind {
                children.remove(&name);
                parent_node.mtime = SystemTime::now();
            }
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = None;
        }
        Ok(())
    }

    /// Hook a detached node into `parent` under `new_name`, replacing its
    /// previous name. Fails on a name conflict.
    pub fn attach(&mut self, id: NodeId, parent: NodeId, new_name: &str) -> FsResult<()> {
        {
            let parent_node = self
                .nodes
                .get_mut(&parent)
                .ok_or_else(|| FsError::NotFound(new_name.to_string()))?;
            match &mut parent_node.kind {
                NodeKind::Directory { children } => {
                    if children.contains_key(new_name) {
                        return Err(FsError::AlreadyExists(new_name.to_string()));
                    }
                    children.insert(new_name.to_string(), id);
                }
                _ => return Err(FsError::NotADirectory(parent_node.name.clone())),
            }
            parent_node.mtime = SystemTime::now();
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.name = new_name.to_string();
            node.parent = Some(parent);
        }
        Ok(())
    }

    /// Detach `id` and drop it and all descendants from the arena.
    pub fn remove(&mut self, id: NodeId) -> FsResult<()> {
        self.detach(id)?;
        let mut stack = vec![id];
        while let Some(cursor) = stack.pop() {
            if let Some(node) = self.nodes.remove(&cursor) {
                if let NodeKind::Directory { children } = node.kind {
                    stack.extend(children.values().copied());
                }
            }
        }
        Ok(())
    }

    /// `(id, path)` of `id` and every descendant, parents first.
    pub fn subtree_paths(&self, id: NodeId) -> Vec<(NodeId, String)> {
        let mut out = Vec::new();
        let mut stack = vec![(id, self.path_of(id))];
        while let Some((cursor, path)) = stack.pop() {
            if let Some(node) = self.nodes.get(&cursor) {
                if let NodeKind::Directory { children } = &node.kind {
                    for (name, child) in children {
                        stack.push((*child, paths::join(&path, name)));
                    }
                }
            }
            out.push((cursor, path));
        }
        out.sort_by(|a, b| a.1.cmp(&b.1));
        out
    }

    /// Every path in the mirror with its node type, parents first. Root is
    /// included.
    pub fn all_paths(&self) -> Vec<(String, NodeType)> {
        self.subtree_paths(ROOT_ID)
            .into_iter()
            .filter_map(|(id, path)| self.nodes.get(&id).map(|n| (path, n.node_type())))
            .collect()
    }

    pub fn children(&self, id: NodeId) -> FsResult<Vec<(String, NodeType)>> {
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| FsError::NotFound(id.to_string()))?;
        match &node.kind {
            NodeKind::Directory { children } => Ok(children
                .iter()
                .filter_map(|(name, child_id)| {
                    self.nodes
                        .get(child_id)
                        .map(|child| (name.clone(), child.node_type()))
                })
                .collect()),
            _ => Err(FsError::NotADirectory(node.name.clone())),
        }
    }

    pub fn read(&mut self, id: NodeId, size: u64, offset: u64) -> FsResult<Vec<u8>> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FsError::NotFound(id.to_string()))?;
        node.atime = SystemTime::now();
        let bytes = match &node.kind {
            NodeKind::File { content } => content,
            NodeKind::Symlink { target } => target.as_bytes(),
            NodeKind::Directory { .. } => {
                return Err(FsError::IsADirectory(node.name.clone()));
            }
        };
        let len = bytes.len() as u64;
        if offset >= len {
            return Ok(Vec::new());
        }
        let end = len.min(offset + size) as usize;
        Ok(bytes[offset as usize..end].to_vec())
    }

    pub fn write(&mut self, id: NodeId, data: &[u8], offset: u64) -> FsResult<usize> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FsError::NotFound(id.to_string()))?;
        match &mut node.kind {
            NodeKind::File { content } => {
                let end = offset as usize + data.len();
                if content.len() < end {
                    content.resize(end, 0);
                }
                content[offset as usize..end].copy_from_slice(data);
                node.mtime = SystemTime::now();
                Ok(data.len())
            }
            _ => Err(FsError::IsADirectory(node.name.clone())),
        }
    }

    pub fn truncate(&mut self, id: NodeId, size: u64) -> FsResult<()> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FsError::NotFound(id.to_string()))?;
        match &mut node.kind {
            NodeKind::File { content } => {
                content.resize(size as usize, 0);
                node.mtime = SystemTime::now();
                Ok(())
            }
            _ => Err(FsError::IsADirectory(node.name.clone())),
        }
    }

    /// Replace a file's buffer wholesale. Used by the syncer and the
    /// archiver, which install remote bytes without going through `write`.
    pub fn set_content(&mut self, id: NodeId, content: Vec<u8>) -> FsResult<()> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FsError::NotFound(id.to_string()))?;
        match &mut node.kind {
            NodeKind::File { content: buffer } => {
                *buffer = content;
                node.mtime = SystemTime::now();
                Ok(())
            }
            _ => Err(FsError::IsADirectory(node.name.clone())),
        }
    }

    pub fn content(&self, id: NodeId) -> FsResult<Vec<u8>> {
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| FsError::NotFound(id.to_string()))?;
        match &node.kind {
            NodeKind::File { content } => Ok(content.clone()),
            NodeKind::Symlink { target } => Ok(target.as_bytes().to_vec()),
            NodeKind::Directory { .. } => Ok(Vec::new()),
        }
    }

    pub fn stat(&self, id: NodeId) -> FsResult<FileStat> {
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| FsError::NotFound(id.to_string()))?;
        let size = match &node.kind {
            NodeKind::File { content } => content.len() as u64,
            NodeKind::Symlink { target } => target.len() as u64,
            NodeKind::Directory { .. } => 0,
        };
        Ok(FileStat {
            kind: node.node_type(),
            size,
            atime: node.atime,
            mtime: node.mtime,
        })
    }

    pub fn set_times(&mut self, id: NodeId, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FsError::NotFound(id.to_string()))?;
        node.atime = atime;
        node.mtime = mtime;
        Ok(())
    }

    /// Aggregate byte and file counts for statfs.
    pub fn usage(&self) -> (u64, u64) {
        let mut bytes = 0u64;
        let mut files = 0u64;
        for node in self.nodes.values() {
            if let NodeKind::File { content } = &node.kind {
                bytes += content.len() as u64;
                files += 1;
            }
        }
        (bytes, files)
    }
}

impl Default for Mirror {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_descends_from_root() {
        let mut mirror = Mirror::new();
        let dir = mirror.mkdir(ROOT_ID, "a").unwrap();
        let file = mirror.mkfile(dir, "b.txt").unwrap();

        assert_eq!(mirror.find("/"), Some(ROOT_ID));
        assert_eq!(mirror.find("/a"), Some(dir));
        assert_eq!(mirror.find("/a/b.txt"), Some(file));
        assert_eq!(mirror.find("/a/missing"), None);
        assert_eq!(mirror.find("/a/b.txt/below"), None);
    }

    #[test]
    fn test_names_unique_within_directory() {
        let mut mirror = Mirror::new();
        mirror.mkfile(ROOT_ID, "x.txt").unwrap();
        assert_eq!(
            mirror.mkfile(ROOT_ID, "x.txt"),
            Err(FsError::AlreadyExists("x.txt".to_string()))
        );
        assert_eq!(
            mirror.mkdir(ROOT_ID, "x.txt"),
            Err(FsError::AlreadyExists("x.txt".to_string()))
        );
    }

    #[test]
    fn test_path_of_roundtrips_with_find() {
        let mut mirror = Mirror::new();
        let dir = mirror.mkdir(ROOT_ID, "a").unwrap();
        let sub = mirror.mkdir(dir, "b").unwrap();
        let file = mirror.mkfile(sub, "c.txt").unwrap();

        assert_eq!(mirror.path_of(file), "/a/b/c.txt");
        assert_eq!(mirror.find(&mirror.path_of(file)), Some(file));
        assert_eq!(mirror.path_of(ROOT_ID), "/");
    }

    #[test]
    fn test_write_extends_and_read_bounds() {
        let mut mirror = Mirror::new();
        let file = mirror.mkfile(ROOT_ID, "f.txt").unwrap();

        assert_eq!(mirror.write(file, b"hello", 0).unwrap(), 5);
        assert_eq!(mirror.write(file, b"!!", 7).unwrap(), 2);
        // gap between 5 and 7 is zero-filled
        assert_eq!(mirror.content(file).unwrap(), b"hello\0\0!!".to_vec());

        assert_eq!(mirror.read(file, 5, 0).unwrap(), b"hello".to_vec());
        assert_eq!(mirror.read(file, 100, 7).unwrap(), b"!!".to_vec());
        assert!(mirror.read(file, 10, 100).unwrap().is_empty());
    }

    #[test]
    fn test_truncate_zero_fills_extension() {
        let mut mirror = Mirror::new();
        let file = mirror.mkfile(ROOT_ID, "f.txt").unwrap();
        mirror.write(file, b"abc", 0).unwrap();

        mirror.truncate(file, 5).unwrap();
        assert_eq!(mirror.content(file).unwrap(), b"abc\0\0".to_vec());

        mirror.truncate(file, 1).unwrap();
        assert_eq!(mirror.content(file).unwrap(), b"a".to_vec());
    }

    #[test]
    fn test_detach_attach_moves_subtree() {
        let mut mirror = Mirror::new();
        let src = mirror.mkdir(ROOT_ID, "src").unwrap();
        let dst = mirror.mkdir(ROOT_ID, "dst").unwrap();
        let file = mirror.mkfile(src, "f.txt").unwrap();

        mirror.detach(file).unwrap();
        mirror.attach(file, dst, "g.txt").unwrap();

        assert_eq!(mirror.find("/src/f.txt"), None);
        assert_eq!(mirror.find("/dst/g.txt"), Some(file));
        assert_eq!(mirror.path_of(file), "/dst/g.txt");
    }

    #[test]
    fn test_remove_drops_descendants() {
        let mut mirror = Mirror::new();
        let dir = mirror.mkdir(ROOT_ID, "d").unwrap();
        let file = mirror.mkfile(dir, "f.txt").unwrap();

        mirror.remove(dir).unwrap();
        assert_eq!(mirror.find("/d"), None);
        assert!(mirror.node(dir).is_none());
        assert!(mirror.node(file).is_none());
    }

    #[test]
    fn test_subtree_paths_parents_first() {
        let mut mirror = Mirror::new();
        let dir = mirror.mkdir(ROOT_ID, "d").unwrap();
        mirror.mkfile(dir, "f.txt").unwrap();
        mirror.mkdir(dir, "sub").unwrap();

        let subtree: Vec<String> = mirror
            .subtree_paths(dir)
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        assert_eq!(subtree, vec!["/d", "/d/f.txt", "/d/sub"]);
    }

    #[test]
    fn test_symlink_stat_and_read() {
        let mut mirror = Mirror::new();
        mirror.mkfile(ROOT_ID, "real.txt").unwrap();
        let link = mirror.mksymlink(ROOT_ID, "link.txt", "/real.txt").unwrap();

        let stat = mirror.stat(link).unwrap();
        assert_eq!(stat.kind, NodeType::Symlink);
        assert_eq!(stat.size, "/real.txt".len() as u64);
        assert_eq!(mirror.read(link, 100, 0).unwrap(), b"/real.txt".to_vec());
    }

    #[test]
    fn test_usage_counts_file_bytes() {
        let mut mirror = Mirror::new();
        let a = mirror.mkfile(ROOT_ID, "a.txt").unwrap();
        let b = mirror.mkfile(ROOT_ID, "b.txt").unwrap();
        mirror.write(a, b"12345", 0).unwrap();
        mirror.write(b, b"123", 0).unwrap();
        assert_eq!(mirror.usage(), (8, 2));
    }
}
