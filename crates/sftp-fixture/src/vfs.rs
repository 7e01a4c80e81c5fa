//! In-memory virtual filesystem
//!
//! One [`MemoryFs`] instance backs one managed scope. It is shared by the
//! facade and by every SFTP session of that scope, so the transport layer is
//! never handed the store directly: session teardown closes whatever
//! filesystem handle it was given, and the store has to survive that. The
//! [`UncloseableFs`] wrapper forwards the whole capability set unchanged and
//! turns `close` into a no-op.
//!
//! Paths are absolute, `/`-rooted virtual paths with no relationship to the
//! host filesystem. The root always exists and cannot be removed.

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Kind of a filesystem node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file with byte content
    File,
    /// Directory with zero or more children
    Directory,
}

/// Metadata of a filesystem node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Node kind
    pub kind: NodeKind,
    /// Content length in bytes; 0 for directories
    pub len: u64,
}

impl Metadata {
    /// True iff the node is a directory
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Child name, without any path separator
    pub name: String,
    /// Metadata snapshot taken at listing time
    pub metadata: Metadata,
}

/// The filesystem capability set handed to SFTP sessions.
///
/// Every operation addresses nodes by absolute virtual path. Implementations
/// must be safe to share across concurrently running sessions; the fixture
/// promises last-writer-wins for overlapping writes and nothing more.
pub trait SessionFs: Send + Sync {
    /// Look up the metadata of the node at `path`.
    fn metadata(&self, path: &str) -> Result<Metadata>;

    /// Check whether any node exists at `path`.
    fn exists(&self, path: &str) -> Result<bool>;

    /// Read the full content of the file at `path`.
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Write `content` as the full content of the file at `path`,
    /// overwriting an existing file. The parent directory must exist.
    fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Read up to `len` bytes starting at `offset`. An empty result means
    /// end of file.
    fn read_at(&self, path: &str, offset: u64, len: u32) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, zero-filling any gap beyond the current
    /// end of file.
    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<()>;

    /// Create the directory at `path`. The parent must exist.
    fn create_dir(&self, path: &str) -> Result<()>;

    /// Create the directory at `path` together with all missing ancestors.
    /// Existing directories are fine.
    fn create_dir_all(&self, path: &str) -> Result<()>;

    /// Snapshot the immediate children of the directory at `path`.
    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Remove the file at `path`.
    fn remove_file(&self, path: &str) -> Result<()>;

    /// Remove the empty directory at `path`. The root is never removable.
    fn remove_dir(&self, path: &str) -> Result<()>;

    /// Close the filesystem. A closed filesystem rejects every operation.
    fn close(&self) -> Result<()>;
}

enum Node {
    File(Vec<u8>),
    Dir(BTreeMap<String, Node>),
}

impl Node {
    fn metadata(&self) -> Metadata {
        match self {
            Node::File(content) => Metadata {
                kind: NodeKind::File,
                len: content.len() as u64,
            },
            Node::Dir(_) => Metadata {
                kind: NodeKind::Directory,
                len: 0,
            },
        }
    }
}

struct State {
    root: Node,
    closed: bool,
}

/// In-memory filesystem tree behind a single lock.
pub struct MemoryFs {
    state: RwLock<State>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    /// Create an empty filesystem containing only the root directory.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                root: Node::Dir(BTreeMap::new()),
                closed: false,
            }),
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn ensure_open(state: &State) -> Result<()> {
    if state.closed {
        return Err(Error::FilesystemClosed);
    }
    Ok(())
}

fn lookup<'a>(root: &'a Node, segments: &[String]) -> Option<&'a Node> {
    let mut node = root;
    for segment in segments {
        match node {
            Node::Dir(children) => node = children.get(segment)?,
            Node::File(_) => return None,
        }
    }
    Some(node)
}

/// Walk to the parent directory of `segments` and return it together with
/// the final path component.
fn lookup_parent<'a>(
    root: &'a mut Node,
    segments: &[String],
    path: &str,
) -> Result<(&'a mut BTreeMap<String, Node>, String)> {
    let (name, ancestors) = segments
        .split_last()
        .ok_or_else(|| Error::PermissionDenied(format!("cannot replace the root: {path}")))?;

    let mut node = root;
    for (depth, segment) in ancestors.iter().enumerate() {
        let children = match node {
            Node::Dir(children) => children,
            Node::File(_) => {
                return Err(Error::NotADirectory(canonical_segments(&segments[..depth])))
            }
        };
        node = children
            .get_mut(segment)
            .ok_or_else(|| Error::NotFound(canonical_segments(&segments[..=depth])))?;
    }

    match node {
        Node::Dir(children) => Ok((children, name.clone())),
        Node::File(_) => Err(Error::NotADirectory(canonical_segments(ancestors))),
    }
}

impl SessionFs for MemoryFs {
    fn metadata(&self, path: &str) -> Result<Metadata> {
        let state = self.read_state();
        ensure_open(&state)?;
        let segments = normalize(path);
        lookup(&state.root, &segments)
            .map(Node::metadata)
            .ok_or_else(|| Error::NotFound(canonical(path)))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let state = self.read_state();
        ensure_open(&state)?;
        Ok(lookup(&state.root, &normalize(path)).is_some())
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let state = self.read_state();
        ensure_open(&state)?;
        match lookup(&state.root, &normalize(path)) {
            Some(Node::File(content)) => Ok(content.clone()),
            Some(Node::Dir(_)) => Err(Error::IsADirectory(canonical(path))),
            None => Err(Error::NotFound(canonical(path))),
        }
    }

    fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let mut state = self.write_state();
        ensure_open(&state)?;
        let segments = normalize(path);
        let (children, name) = lookup_parent(&mut state.root, &segments, path)?;
        match children.get_mut(&name) {
            Some(Node::Dir(_)) => Err(Error::IsADirectory(canonical(path))),
            Some(Node::File(existing)) => {
                *existing = content.to_vec();
                Ok(())
            }
            None => {
                children.insert(name, Node::File(content.to_vec()));
                Ok(())
            }
        }
    }

    fn read_at(&self, path: &str, offset: u64, len: u32) -> Result<Vec<u8>> {
        let state = self.read_state();
        ensure_open(&state)?;
        match lookup(&state.root, &normalize(path)) {
            Some(Node::File(content)) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX);
                if start >= content.len() {
                    return Ok(Vec::new());
                }
                let end = start.saturating_add(len as usize).min(content.len());
                Ok(content[start..end].to_vec())
            }
            Some(Node::Dir(_)) => Err(Error::IsADirectory(canonical(path))),
            None => Err(Error::NotFound(canonical(path))),
        }
    }

    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.write_state();
        ensure_open(&state)?;
        let segments = normalize(path);
        match lookup_mut(&mut state.root, &segments) {
            Some(Node::File(content)) => {
                let start = usize::try_from(offset)
                    .map_err(|_| Error::Protocol(format!("write offset out of range: {offset}")))?;
                let end = start.saturating_add(data.len());
                if content.len() < end {
                    content.resize(end, 0);
                }
                content[start..end].copy_from_slice(data);
                Ok(())
            }
            Some(Node::Dir(_)) => Err(Error::IsADirectory(canonical(path))),
            None => Err(Error::NotFound(canonical(path))),
        }
    }

    fn create_dir(&self, path: &str) -> Result<()> {
        let mut state = self.write_state();
        ensure_open(&state)?;
        let segments = normalize(path);
        if segments.is_empty() {
            return Err(Error::AlreadyExists(canonical(path)));
        }
        let (children, name) = lookup_parent(&mut state.root, &segments, path)?;
        if children.contains_key(&name) {
            return Err(Error::AlreadyExists(canonical(path)));
        }
        children.insert(name, Node::Dir(BTreeMap::new()));
        Ok(())
    }

    fn create_dir_all(&self, path: &str) -> Result<()> {
        let mut state = self.write_state();
        ensure_open(&state)?;
        let segments = normalize(path);
        let mut node = &mut state.root;
        for (depth, segment) in segments.iter().enumerate() {
            let children = match node {
                Node::Dir(children) => children,
                Node::File(_) => {
                    return Err(Error::NotADirectory(canonical_segments(&segments[..depth])))
                }
            };
            node = children
                .entry(segment.clone())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
        }
        match node {
            Node::Dir(_) => Ok(()),
            Node::File(_) => Err(Error::NotADirectory(canonical(path))),
        }
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let state = self.read_state();
        ensure_open(&state)?;
        match lookup(&state.root, &normalize(path)) {
            Some(Node::Dir(children)) => Ok(children
                .iter()
                .map(|(name, node)| DirEntry {
                    name: name.clone(),
                    metadata: node.metadata(),
                })
                .collect()),
            Some(Node::File(_)) => Err(Error::NotADirectory(canonical(path))),
            None => Err(Error::NotFound(canonical(path))),
        }
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        let mut state = self.write_state();
        ensure_open(&state)?;
        let segments = normalize(path);
        if segments.is_empty() {
            return Err(Error::IsADirectory(canonical(path)));
        }
        let (children, name) = lookup_parent(&mut state.root, &segments, path)?;
        match children.get(&name) {
            Some(Node::File(_)) => {
                children.remove(&name);
                Ok(())
            }
            Some(Node::Dir(_)) => Err(Error::IsADirectory(canonical(path))),
            None => Err(Error::NotFound(canonical(path))),
        }
    }

    fn remove_dir(&self, path: &str) -> Result<()> {
        let mut state = self.write_state();
        ensure_open(&state)?;
        let segments = normalize(path);
        if segments.is_empty() {
            return Err(Error::PermissionDenied(
                "the filesystem root cannot be removed".into(),
            ));
        }
        let (children, name) = lookup_parent(&mut state.root, &segments, path)?;
        match children.get(&name) {
            Some(Node::Dir(grandchildren)) => {
                if !grandchildren.is_empty() {
                    return Err(Error::DirectoryNotEmpty(canonical(path)));
                }
                children.remove(&name);
                Ok(())
            }
            Some(Node::File(_)) => Err(Error::NotADirectory(canonical(path))),
            None => Err(Error::NotFound(canonical(path))),
        }
    }

    fn close(&self) -> Result<()> {
        let mut state = self.write_state();
        state.closed = true;
        Ok(())
    }
}

fn lookup_mut<'a>(root: &'a mut Node, segments: &[String]) -> Option<&'a mut Node> {
    let mut node = root;
    for segment in segments {
        match node {
            Node::Dir(children) => node = children.get_mut(segment)?,
            Node::File(_) => return None,
        }
    }
    Some(node)
}

/// Pass-through filesystem wrapper whose `close` does nothing.
///
/// The transport layer closes the filesystem handle it was given whenever a
/// client session ends. The shared store must outlive every session of its
/// scope, so each session is handed one of these instead. Everything except
/// `close` is forwarded unchanged, which keeps the wrapper behaviorally
/// transparent to the protocol layer.
pub struct UncloseableFs {
    inner: Arc<dyn SessionFs>,
}

impl UncloseableFs {
    /// Wrap `inner`, shielding it from `close` calls.
    pub fn new(inner: Arc<dyn SessionFs>) -> Self {
        Self { inner }
    }
}

impl SessionFs for UncloseableFs {
    fn metadata(&self, path: &str) -> Result<Metadata> {
        self.inner.metadata(path)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.read_file(path)
    }

    fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        self.inner.write_file(path, content)
    }

    fn read_at(&self, path: &str, offset: u64, len: u32) -> Result<Vec<u8>> {
        self.inner.read_at(path, offset, len)
    }

    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.write_at(path, offset, data)
    }

    fn create_dir(&self, path: &str) -> Result<()> {
        self.inner.create_dir(path)
    }

    fn create_dir_all(&self, path: &str) -> Result<()> {
        self.inner.create_dir_all(path)
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.inner.read_dir(path)
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        self.inner.remove_file(path)
    }

    fn remove_dir(&self, path: &str) -> Result<()> {
        self.inner.remove_dir(path)
    }

    fn close(&self) -> Result<()> {
        // will not be closed
        Ok(())
    }
}

/// Split a virtual path into normalized segments.
///
/// Empty components and `.` are dropped, `..` pops. The result is the
/// path relative to the root; an empty vector is the root itself.
pub fn normalize(path: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            name => segments.push(name.to_string()),
        }
    }
    segments
}

/// Canonical absolute form of a virtual path.
pub fn canonical(path: &str) -> String {
    canonical_segments(&normalize(path))
}

fn canonical_segments(segments: &[String]) -> String {
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Parent directory of `path`, or `None` when the parent is the root
/// (or the path is the root itself). The root always exists, so callers
/// that ensure ancestor directories skip it.
pub fn parent(path: &str) -> Option<String> {
    let segments = normalize(path);
    if segments.len() <= 1 {
        return None;
    }
    Some(canonical_segments(&segments[..segments.len() - 1]))
}

/// Join a child name onto a directory path.
pub fn join(base: &str, name: &str) -> String {
    let mut segments = normalize(base);
    segments.push(name.to_string());
    canonical_segments(&segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert!(normalize("/").is_empty());
        assert!(normalize("").is_empty());
        assert_eq!(normalize("/a/b"), vec!["a", "b"]);
        assert_eq!(normalize("a//b/./c"), vec!["a", "b", "c"]);
        assert_eq!(normalize("/a/../b"), vec!["b"]);
        assert!(normalize("/..").is_empty());
    }

    #[test]
    fn test_canonical_and_parent() {
        assert_eq!(canonical("a//b/"), "/a/b");
        assert_eq!(canonical("."), "/");
        assert_eq!(parent("/a/b/c"), Some("/a/b".to_string()));
        assert_eq!(parent("/a"), None);
        assert_eq!(parent("/"), None);
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }

    #[test]
    fn test_write_and_read_file() {
        let fs = MemoryFs::new();
        fs.write_file("/file.bin", b"content").unwrap();
        assert_eq!(fs.read_file("/file.bin").unwrap(), b"content");

        fs.write_file("/file.bin", b"overwritten").unwrap();
        assert_eq!(fs.read_file("/file.bin").unwrap(), b"overwritten");
    }

    #[test]
    fn test_write_file_requires_parent() {
        let fs = MemoryFs::new();
        let err = fs.write_file("/missing/file.bin", b"x").unwrap_err();
        assert!(err.is_not_found(), "got {err:?}");
    }

    #[test]
    fn test_write_file_onto_directory_fails() {
        let fs = MemoryFs::new();
        fs.create_dir("/dir").unwrap();
        let err = fs.write_file("/dir", b"x").unwrap_err();
        assert!(matches!(err, Error::IsADirectory(_)), "got {err:?}");
    }

    #[test]
    fn test_read_at_and_write_at() {
        let fs = MemoryFs::new();
        fs.write_file("/f", b"0123456789").unwrap();

        assert_eq!(fs.read_at("/f", 2, 4).unwrap(), b"2345");
        assert_eq!(fs.read_at("/f", 8, 100).unwrap(), b"89");
        assert!(fs.read_at("/f", 10, 4).unwrap().is_empty());

        fs.write_at("/f", 3, b"xyz").unwrap();
        assert_eq!(fs.read_file("/f").unwrap(), b"012xyz6789");

        // a gap beyond the end is zero-filled
        fs.write_at("/f", 12, b"!").unwrap();
        assert_eq!(fs.read_file("/f").unwrap(), b"012xyz6789\0\0!");
    }

    #[test]
    fn test_create_dir_semantics() {
        let fs = MemoryFs::new();
        fs.create_dir("/a").unwrap();
        assert!(matches!(
            fs.create_dir("/a"),
            Err(Error::AlreadyExists(_))
        ));
        assert!(fs.create_dir("/missing/b").unwrap_err().is_not_found());

        fs.create_dir_all("/x/y/z").unwrap();
        assert!(fs.metadata("/x/y/z").unwrap().is_dir());
        // repeated calls are fine
        fs.create_dir_all("/x/y/z").unwrap();
    }

    #[test]
    fn test_create_dir_all_through_file_fails() {
        let fs = MemoryFs::new();
        fs.write_file("/f", b"x").unwrap();
        let err = fs.create_dir_all("/f/sub").unwrap_err();
        assert!(matches!(err, Error::NotADirectory(_)), "got {err:?}");
    }

    #[test]
    fn test_read_dir_snapshot_is_sorted() {
        let fs = MemoryFs::new();
        fs.create_dir("/b").unwrap();
        fs.create_dir("/a").unwrap();
        fs.write_file("/c", b"").unwrap();

        let names: Vec<String> = fs
            .read_dir("/")
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_semantics() {
        let fs = MemoryFs::new();
        fs.create_dir("/dir").unwrap();
        fs.write_file("/dir/f", b"x").unwrap();

        assert!(matches!(
            fs.remove_dir("/dir"),
            Err(Error::DirectoryNotEmpty(_))
        ));
        assert!(matches!(
            fs.remove_file("/dir"),
            Err(Error::IsADirectory(_))
        ));

        fs.remove_file("/dir/f").unwrap();
        fs.remove_dir("/dir").unwrap();
        assert!(fs.metadata("/dir").unwrap_err().is_not_found());

        assert!(matches!(
            fs.remove_dir("/"),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_closed_filesystem_rejects_operations() {
        let fs = MemoryFs::new();
        fs.write_file("/f", b"x").unwrap();
        fs.close().unwrap();

        assert!(matches!(fs.read_file("/f"), Err(Error::FilesystemClosed)));
        assert!(matches!(
            fs.write_file("/g", b"y"),
            Err(Error::FilesystemClosed)
        ));
        assert!(matches!(fs.exists("/f"), Err(Error::FilesystemClosed)));
    }

    #[test]
    fn test_uncloseable_wrapper_suppresses_close_only() {
        let fs = Arc::new(MemoryFs::new());
        let wrapper = UncloseableFs::new(fs.clone() as Arc<dyn SessionFs>);

        wrapper.write_file("/f", b"via wrapper").unwrap();
        wrapper.close().unwrap();

        // the shared store is still open and sees the write
        assert_eq!(fs.read_file("/f").unwrap(), b"via wrapper");

        // closing the store itself is still effective
        fs.close().unwrap();
        assert!(matches!(
            wrapper.read_file("/f"),
            Err(Error::FilesystemClosed)
        ));
    }
}
