#![forbid(unsafe_code)]
//! Namespace tree.
//!
//! Entries live in an arena indexed by [`EntryId`]. Each entry stores its
//! parent as an id and each directory keeps a sorted `name -> id` map, so
//! rename is an index rewrite and no entry owns another.
//!
//! Path resolution is iterative. Symbolic links met along the way are
//! spliced into the pending component queue, relative targets resolve
//! against the link's parent directory, and the number of expansions is
//! capped at [`MAX_SYMLINK_HOPS`].

use cfs_error::{CfsError, Result};
use cfs_types::{BlockRange, EntryId, NAME_MAX, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};

/// Maximum number of symlink expansions during one path resolution.
pub const MAX_SYMLINK_HOPS: u32 = 40;

/// Longest symlink target accepted, in bytes.
pub const TARGET_MAX: usize = 4095;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

/// The three timestamps every entry carries, in whole seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Times {
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

impl Times {
    #[must_use]
    pub fn all(at: Timestamp) -> Self {
        Self {
            atime: at,
            mtime: at,
            ctime: at,
        }
    }
}

/// Kind-specific payload of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Directory {
        children: BTreeMap<String, EntryId>,
    },
    File {
        size: u64,
        /// Block ranges in logical order.
        extents: Vec<BlockRange>,
    },
    Symlink {
        target: String,
    },
}

/// What to create in [`Namespace::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewEntry {
    Directory,
    File,
    Symlink(String),
}

/// One namespace node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    id: EntryId,
    parent: EntryId,
    name: String,
    times: Times,
    content: Content,
}

impl Entry {
    /// Build an entry as decoded from a metadata image.
    ///
    /// Directory children are ignored here and relinked from parent ids by
    /// [`Namespace::from_entries`].
    #[must_use]
    pub fn new(id: EntryId, parent: EntryId, name: String, times: Times, content: Content) -> Self {
        Self {
            id,
            parent,
            name,
            times,
            content,
        }
    }

    #[must_use]
    pub fn id(&self) -> EntryId {
        self.id
    }

    #[must_use]
    pub fn parent(&self) -> EntryId {
        self.parent
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn times(&self) -> Times {
        self.times
    }

    #[must_use]
    pub fn content(&self) -> &Content {
        &self.content
    }

    #[must_use]
    pub fn kind(&self) -> EntryKind {
        match self.content {
            Content::Directory { .. } => EntryKind::Directory,
            Content::File { .. } => EntryKind::File,
            Content::Symlink { .. } => EntryKind::Symlink,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self.content, Content::Directory { .. })
    }

    /// Size in bytes: file length, target length for symlinks, 0 for
    /// directories.
    #[must_use]
    pub fn size(&self) -> u64 {
        match &self.content {
            Content::Directory { .. } => 0,
            Content::File { size, .. } => *size,
            Content::Symlink { target } => target.len() as u64,
        }
    }

    /// Block ranges owned by this entry (empty unless it is a file).
    #[must_use]
    pub fn extents(&self) -> &[BlockRange] {
        match &self.content {
            Content::File { extents, .. } => extents,
            _ => &[],
        }
    }
}

/// Reject names that cannot appear as a single directory entry.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CfsError::InvalidArgument("entry name cannot be empty".to_owned()));
    }
    if name == "." || name == ".." {
        return Err(CfsError::InvalidArgument(format!("reserved entry name {name:?}")));
    }
    if name.contains(['/', '\0']) {
        return Err(CfsError::InvalidArgument(format!(
            "entry name contains '/' or NUL: {name:?}"
        )));
    }
    if name.len() > NAME_MAX {
        return Err(CfsError::NameTooLong);
    }
    Ok(())
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

fn slot_of(id: EntryId) -> Option<usize> {
    usize::try_from(id.0.checked_sub(1)?).ok()
}

/// Arena of entries rooted at [`EntryId::ROOT`].
#[derive(Debug, Clone)]
pub struct Namespace {
    slots: Vec<Option<Entry>>,
    /// Free arena ids, popped from the back.
    vacant: Vec<EntryId>,
    live: usize,
}

impl Namespace {
    /// A namespace holding only the root directory.
    #[must_use]
    pub fn new(now: Timestamp) -> Self {
        let root = Entry::new(
            EntryId::ROOT,
            EntryId::ROOT,
            String::new(),
            Times::all(now),
            Content::Directory {
                children: BTreeMap::new(),
            },
        );
        Self {
            slots: vec![Some(root)],
            vacant: Vec::new(),
            live: 1,
        }
    }

    /// Rebuild a namespace from decoded entries.
    ///
    /// Directory child maps are rebuilt from parent ids. Any structural
    /// problem is reported as `Corruption` at `meta_block`: ids above
    /// `max_id`, duplicate ids or names, missing or non-directory parents,
    /// and entries unreachable from the root.
    pub fn from_entries(entries: Vec<Entry>, max_id: u64, meta_block: u64) -> Result<Self> {
        let corrupt = |detail: String| CfsError::corruption(meta_block, detail);

        let highest = entries.iter().map(|e| e.id.0).max().unwrap_or(0);
        if highest > max_id {
            return Err(corrupt(format!("entry id {highest} exceeds limit {max_id}")));
        }
        let slot_count = usize::try_from(highest)
            .map_err(|_| corrupt(format!("entry id {highest} does not fit usize")))?;
        let mut slots: Vec<Option<Entry>> = vec![None; slot_count];
        let mut links = Vec::with_capacity(entries.len());

        for mut entry in entries {
            let Some(slot) = slot_of(entry.id) else {
                return Err(corrupt("entry id 0 is reserved".to_owned()));
            };
            if slots[slot].is_some() {
                return Err(corrupt(format!("duplicate entry id {}", entry.id)));
            }
            if let Content::Directory { children } = &mut entry.content {
                children.clear();
            }
            if entry.id != EntryId::ROOT {
                links.push((entry.parent, entry.name.clone(), entry.id));
            }
            slots[slot] = Some(entry);
        }

        match slots.first() {
            Some(Some(root)) if root.is_dir() && root.parent == EntryId::ROOT => {}
            _ => return Err(corrupt("missing or malformed root directory".to_owned())),
        }

        let live = links.len() + 1;
        for (parent, name, id) in links {
            validate_name(&name).map_err(|e| corrupt(format!("entry {id}: {e}")))?;
            let children = slot_of(parent)
                .and_then(|slot| slots.get_mut(slot))
                .and_then(Option::as_mut)
                .and_then(|p| match &mut p.content {
                    Content::Directory { children } => Some(children),
                    _ => None,
                })
                .ok_or_else(|| {
                    corrupt(format!("entry {id} has missing or non-directory parent {parent}"))
                })?;
            if children.insert(name.clone(), id).is_some() {
                return Err(corrupt(format!("duplicate name {name:?} under entry {parent}")));
            }
        }

        let vacant = slots
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, slot)| slot.is_none())
            .map(|(idx, _)| EntryId(idx as u64 + 1))
            .collect();
        let ns = Self {
            slots,
            vacant,
            live,
        };

        let reachable = ns.walk().len();
        if reachable != live {
            return Err(corrupt(format!(
                "{} entries unreachable from root",
                live - reachable
            )));
        }
        debug!(entries = live, "namespace rebuilt");
        Ok(ns)
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn get(&self, id: EntryId) -> Result<&Entry> {
        slot_of(id)
            .and_then(|slot| self.slots.get(slot))
            .and_then(Option::as_ref)
            .ok_or_else(|| CfsError::NotFound(format!("entry {id}")))
    }

    fn get_mut(&mut self, id: EntryId) -> Result<&mut Entry> {
        slot_of(id)
            .and_then(|slot| self.slots.get_mut(slot))
            .and_then(Option::as_mut)
            .ok_or_else(|| CfsError::NotFound(format!("entry {id}")))
    }

    /// Number of live entries, including the root.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Always false: the root cannot be removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Sorted child map of a directory.
    pub fn children(&self, dir: EntryId) -> Result<&BTreeMap<String, EntryId>> {
        match &self.get(dir)?.content {
            Content::Directory { children } => Ok(children),
            _ => Err(CfsError::NotDirectory),
        }
    }

    fn children_mut(&mut self, dir: EntryId) -> Result<&mut BTreeMap<String, EntryId>> {
        match &mut self.get_mut(dir)?.content {
            Content::Directory { children } => Ok(children),
            _ => Err(CfsError::NotDirectory),
        }
    }

    /// Id of `name` inside directory `parent`, without following symlinks.
    pub fn lookup_child(&self, parent: EntryId, name: &str) -> Result<EntryId> {
        self.children(parent)?
            .get(name)
            .copied()
            .ok_or_else(|| CfsError::NotFound(name.to_owned()))
    }

    // ── Path resolution ─────────────────────────────────────────────────

    /// Resolve an absolute path, following every symlink including the
    /// final component.
    pub fn lookup(&self, path: &str) -> Result<EntryId> {
        self.resolve(path, true)
    }

    /// Resolve an absolute path without following a symlink in the final
    /// component.
    pub fn lookup_nofollow(&self, path: &str) -> Result<EntryId> {
        self.resolve(path, false)
    }

    /// Split `path` into its resolved parent directory and final name.
    ///
    /// Symlinks in the parent portion are followed.
    pub fn resolve_parent<'p>(&self, path: &'p str) -> Result<(EntryId, &'p str)> {
        let trimmed = path.trim_end_matches('/');
        let Some(split) = trimmed.rfind('/') else {
            return Err(CfsError::InvalidArgument(format!(
                "path must be absolute: {path:?}"
            )));
        };
        let (dir, name) = (&trimmed[..=split], &trimmed[split + 1..]);
        if name.is_empty() || name == "." || name == ".." {
            return Err(CfsError::InvalidArgument(format!(
                "path has no final component: {path:?}"
            )));
        }
        let parent = self.resolve(dir, true)?;
        Ok((parent, name))
    }

    fn resolve(&self, path: &str, follow_final: bool) -> Result<EntryId> {
        if !path.starts_with('/') {
            return Err(CfsError::InvalidArgument(format!(
                "path must be absolute: {path:?}"
            )));
        }

        let mut pending: VecDeque<String> = components(path).map(str::to_owned).collect();
        let mut current = EntryId::ROOT;
        let mut hops = 0_u32;

        while let Some(component) = pending.pop_front() {
            if component == "." || component == ".." {
                let dir = self.get(current)?;
                if !dir.is_dir() {
                    return Err(CfsError::NotDirectory);
                }
                if component == ".." {
                    current = dir.parent;
                }
                continue;
            }

            let child = self.lookup_child(current, &component)?;
            if let Content::Symlink { target } = &self.get(child)?.content {
                if follow_final || !pending.is_empty() {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(CfsError::SymlinkLoop);
                    }
                    if target.is_empty() {
                        return Err(CfsError::NotFound(format!("empty symlink {component:?}")));
                    }
                    trace!(link = %component, target = %target, hops, "following symlink");
                    let mut expanded: VecDeque<String> =
                        components(target).map(str::to_owned).collect();
                    expanded.extend(pending.drain(..));
                    pending = expanded;
                    if target.starts_with('/') {
                        current = EntryId::ROOT;
                    }
                    continue;
                }
            }
            current = child;
        }
        Ok(current)
    }

    /// Absolute path of `id`, built by walking parent ids.
    pub fn path_of(&self, id: EntryId) -> Result<String> {
        let mut names = Vec::new();
        let mut cursor = id;
        while cursor != EntryId::ROOT {
            if names.len() > self.live {
                return Err(CfsError::corruption(0, format!("parent cycle at entry {id}")));
            }
            let entry = self.get(cursor)?;
            names.push(entry.name.as_str());
            cursor = entry.parent;
        }
        names.reverse();
        Ok(format!("/{}", names.join("/")))
    }

    /// Depth-first listing of every path, starting with `/`.
    #[must_use]
    pub fn walk(&self) -> Vec<(String, EntryId)> {
        let mut out = Vec::with_capacity(self.live);
        let mut stack = vec![("/".to_owned(), EntryId::ROOT)];
        while let Some((path, id)) = stack.pop() {
            if let Ok(children) = self.children(id) {
                for (name, child) in children.iter().rev() {
                    let child_path = if path == "/" {
                        format!("/{name}")
                    } else {
                        format!("{path}/{name}")
                    };
                    stack.push((child_path, *child));
                }
            }
            out.push((path, id));
        }
        out
    }

    fn is_ancestor_or_self(&self, ancestor: EntryId, node: EntryId) -> Result<bool> {
        let mut cursor = node;
        for _ in 0..=self.live {
            if cursor == ancestor {
                return Ok(true);
            }
            if cursor == EntryId::ROOT {
                return Ok(false);
            }
            cursor = self.get(cursor)?.parent;
        }
        Err(CfsError::corruption(0, format!("parent cycle above entry {node}")))
    }

    // ── Mutations ───────────────────────────────────────────────────────

    fn alloc_id(&mut self) -> EntryId {
        if let Some(id) = self.vacant.pop() {
            return id;
        }
        self.slots.push(None);
        EntryId(self.slots.len() as u64)
    }

    fn put(&mut self, entry: Entry) -> Result<()> {
        let slot = slot_of(entry.id)
            .and_then(|slot| self.slots.get_mut(slot))
            .ok_or_else(|| CfsError::NotFound(format!("entry {}", entry.id)))?;
        *slot = Some(entry);
        self.live += 1;
        Ok(())
    }

    fn take(&mut self, id: EntryId) -> Result<Entry> {
        let entry = slot_of(id)
            .and_then(|slot| self.slots.get_mut(slot))
            .and_then(Option::take)
            .ok_or_else(|| CfsError::NotFound(format!("entry {id}")))?;
        self.vacant.push(id);
        self.live -= 1;
        Ok(entry)
    }

    /// Set mtime and ctime to `now` (content or child-list change).
    pub fn touch(&mut self, id: EntryId, now: Timestamp) -> Result<()> {
        let entry = self.get_mut(id)?;
        entry.times.mtime = now;
        entry.times.ctime = now;
        Ok(())
    }

    /// Create `name` inside `parent`.
    pub fn create(
        &mut self,
        parent: EntryId,
        name: &str,
        new: NewEntry,
        now: Timestamp,
    ) -> Result<EntryId> {
        validate_name(name)?;
        if self.children(parent)?.contains_key(name) {
            return Err(CfsError::Exists);
        }
        let content = match new {
            NewEntry::Directory => Content::Directory {
                children: BTreeMap::new(),
            },
            NewEntry::File => Content::File {
                size: 0,
                extents: Vec::new(),
            },
            NewEntry::Symlink(target) => {
                if target.is_empty() || target.contains('\0') {
                    return Err(CfsError::InvalidArgument(
                        "symlink target must be non-empty and NUL-free".to_owned(),
                    ));
                }
                if target.len() > TARGET_MAX {
                    return Err(CfsError::NameTooLong);
                }
                Content::Symlink { target }
            }
        };

        let id = self.alloc_id();
        let entry = Entry::new(id, parent, name.to_owned(), Times::all(now), content);
        let kind = entry.kind();
        self.put(entry)?;
        self.children_mut(parent)?.insert(name.to_owned(), id);
        self.touch(parent, now)?;
        debug!(id = id.0, parent = parent.0, name, ?kind, "entry created");
        Ok(id)
    }

    /// Detach `name` from `parent` and return the removed entry.
    ///
    /// The caller owns freeing the entry's blocks.
    pub fn remove(&mut self, parent: EntryId, name: &str, now: Timestamp) -> Result<Entry> {
        let id = self.lookup_child(parent, name)?;
        if let Content::Directory { children } = &self.get(id)?.content {
            if !children.is_empty() {
                return Err(CfsError::NotEmpty);
            }
        }
        self.children_mut(parent)?.remove(name);
        let removed = self.take(id)?;
        self.touch(parent, now)?;
        debug!(id = id.0, parent = parent.0, name, "entry removed");
        Ok(removed)
    }

    /// Move `src_parent/src_name` to `dst_parent/dst_name`.
    ///
    /// An existing destination of a compatible kind is replaced and
    /// returned; the caller owns freeing its blocks. The moved entry keeps
    /// its id.
    pub fn rename(
        &mut self,
        src_parent: EntryId,
        src_name: &str,
        dst_parent: EntryId,
        dst_name: &str,
        now: Timestamp,
    ) -> Result<Option<Entry>> {
        validate_name(dst_name)?;
        let src = self.lookup_child(src_parent, src_name)?;
        let existing = self.children(dst_parent)?.get(dst_name).copied();
        if existing == Some(src) {
            return Ok(None);
        }

        let src_is_dir = self.get(src)?.is_dir();
        if src_is_dir && self.is_ancestor_or_self(src, dst_parent)? {
            return Err(CfsError::InvalidArgument(
                "cannot move a directory into its own subtree".to_owned(),
            ));
        }

        if let Some(dst) = existing {
            match (src_is_dir, &self.get(dst)?.content) {
                (false, Content::Directory { .. }) => {
                    return Err(CfsError::Unsupported(
                        "rename of a non-directory onto a directory".to_owned(),
                    ));
                }
                (true, Content::File { .. } | Content::Symlink { .. }) => {
                    return Err(CfsError::Unsupported(
                        "rename of a directory onto a non-directory".to_owned(),
                    ));
                }
                (true, Content::Directory { children }) if !children.is_empty() => {
                    return Err(CfsError::NotEmpty);
                }
                _ => {}
            }
        }

        let replaced = match existing {
            Some(dst) => {
                self.children_mut(dst_parent)?.remove(dst_name);
                Some(self.take(dst)?)
            }
            None => None,
        };
        self.children_mut(src_parent)?.remove(src_name);
        self.children_mut(dst_parent)?
            .insert(dst_name.to_owned(), src);

        let moved = self.get_mut(src)?;
        moved.parent = dst_parent;
        moved.name = dst_name.to_owned();
        moved.times.ctime = now;
        self.touch(src_parent, now)?;
        if dst_parent != src_parent {
            self.touch(dst_parent, now)?;
        }

        debug!(
            id = src.0,
            from = src_name,
            to = dst_name,
            replaced = replaced.as_ref().map(|e| e.id.0),
            "entry renamed"
        );
        Ok(replaced)
    }

    /// Assign all three timestamps explicitly.
    pub fn set_times(&mut self, id: EntryId, times: Times) -> Result<()> {
        self.get_mut(id)?.times = times;
        Ok(())
    }

    /// Size and block list of a regular file.
    pub fn file_content(&self, id: EntryId) -> Result<(u64, &[BlockRange])> {
        match &self.get(id)?.content {
            Content::File { size, extents } => Ok((*size, extents)),
            Content::Directory { .. } => Err(CfsError::IsDirectory),
            Content::Symlink { .. } => Err(CfsError::InvalidArgument(
                "symlink has no file content".to_owned(),
            )),
        }
    }

    /// Replace the size and block list of a regular file.
    pub fn set_file_content(
        &mut self,
        id: EntryId,
        size: u64,
        extents: Vec<BlockRange>,
    ) -> Result<()> {
        match &mut self.get_mut(id)?.content {
            Content::File {
                size: old_size,
                extents: old_extents,
            } => {
                *old_size = size;
                *old_extents = extents;
                Ok(())
            }
            Content::Directory { .. } => Err(CfsError::IsDirectory),
            Content::Symlink { .. } => Err(CfsError::InvalidArgument(
                "symlink has no file content".to_owned(),
            )),
        }
    }

    /// Target of a symlink.
    pub fn readlink(&self, id: EntryId) -> Result<&str> {
        match &self.get(id)?.content {
            Content::Symlink { target } => Ok(target),
            _ => Err(CfsError::InvalidArgument("not a symlink".to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_types::BlockNumber;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    const T0: Timestamp = Timestamp(1_000);
    const T1: Timestamp = Timestamp(2_000);

    fn ns() -> Namespace {
        Namespace::new(T0)
    }

    fn mkdir_p(ns: &mut Namespace, path: &str) -> EntryId {
        let mut cur = EntryId::ROOT;
        for name in components(path) {
            cur = match ns.lookup_child(cur, name) {
                Ok(id) => id,
                Err(_) => ns.create(cur, name, NewEntry::Directory, T0).unwrap(),
            };
        }
        cur
    }

    fn paths(ns: &Namespace) -> Vec<String> {
        ns.walk().into_iter().map(|(p, _)| p).collect()
    }

    #[test]
    fn create_and_lookup_nested() {
        let mut ns = ns();
        let apple = mkdir_p(&mut ns, "/alpha/apple");
        let a = ns.create(apple, "a", NewEntry::Directory, T0).unwrap();
        mkdir_p(&mut ns, "/bravo/banana/b");

        assert_eq!(ns.lookup("/alpha/apple/a").unwrap(), a);
        assert_eq!(ns.lookup("/alpha/./apple/../apple/a").unwrap(), a);
        assert_eq!(ns.lookup("/").unwrap(), EntryId::ROOT);
        assert_eq!(ns.lookup("/..").unwrap(), EntryId::ROOT);
        assert_eq!(ns.len(), 7);
        assert_eq!(
            paths(&ns),
            vec![
                "/",
                "/alpha",
                "/alpha/apple",
                "/alpha/apple/a",
                "/bravo",
                "/bravo/banana",
                "/bravo/banana/b",
            ]
        );
    }

    #[test]
    fn create_rejects_duplicates_and_bad_names() {
        let mut ns = ns();
        ns.create(EntryId::ROOT, "foo", NewEntry::File, T0).unwrap();
        assert!(matches!(
            ns.create(EntryId::ROOT, "foo", NewEntry::Directory, T0),
            Err(CfsError::Exists)
        ));
        assert!(matches!(
            ns.create(EntryId::ROOT, "", NewEntry::File, T0),
            Err(CfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            ns.create(EntryId::ROOT, "a/b", NewEntry::File, T0),
            Err(CfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            ns.create(EntryId::ROOT, "..", NewEntry::File, T0),
            Err(CfsError::InvalidArgument(_))
        ));
        let long = "x".repeat(NAME_MAX + 1);
        assert!(matches!(
            ns.create(EntryId::ROOT, &long, NewEntry::File, T0),
            Err(CfsError::NameTooLong)
        ));
        assert!(ns.create(EntryId::ROOT, &"y".repeat(NAME_MAX), NewEntry::File, T0).is_ok());
    }

    #[test]
    fn create_under_missing_or_file_parent() {
        let mut ns = ns();
        let file = ns.create(EntryId::ROOT, "f", NewEntry::File, T0).unwrap();
        assert!(matches!(
            ns.create(file, "x", NewEntry::File, T0),
            Err(CfsError::NotDirectory)
        ));
        assert!(matches!(
            ns.create(EntryId(99), "x", NewEntry::File, T0),
            Err(CfsError::NotFound(_))
        ));
        assert!(matches!(ns.lookup("/f/x"), Err(CfsError::NotDirectory)));
        assert!(matches!(ns.lookup("/nope"), Err(CfsError::NotFound(_))));
        assert!(matches!(ns.lookup("relative"), Err(CfsError::InvalidArgument(_))));
    }

    #[test]
    fn create_updates_parent_times() {
        let mut ns = ns();
        ns.create(EntryId::ROOT, "d", NewEntry::Directory, T1).unwrap();
        let root = ns.get(EntryId::ROOT).unwrap().times();
        assert_eq!(root.mtime, T1);
        assert_eq!(root.ctime, T1);
        assert_eq!(root.atime, T0);
    }

    #[test]
    fn symlinks_resolve_mid_path_and_final() {
        let mut ns = ns();
        let dir = mkdir_p(&mut ns, "/real/dir");
        let file = ns.create(dir, "foo", NewEntry::File, T0).unwrap();
        let link_dir = ns
            .create(EntryId::ROOT, "ln", NewEntry::Symlink("/real/dir".into()), T0)
            .unwrap();
        ns.create(dir, "rel", NewEntry::Symlink("foo".into()), T0)
            .unwrap();
        let sub = ns.create(dir, "sub", NewEntry::Directory, T0).unwrap();
        ns.create(sub, "up", NewEntry::Symlink("../foo".into()), T0)
            .unwrap();

        assert_eq!(ns.lookup("/ln/foo").unwrap(), file);
        assert_eq!(ns.lookup("/ln/rel").unwrap(), file);
        assert_eq!(ns.lookup("/ln/sub/up").unwrap(), file);
        assert_eq!(ns.lookup("/real/dir/sub/up").unwrap(), file);
        assert_eq!(ns.lookup("/ln").unwrap(), dir);
        assert_eq!(ns.lookup_nofollow("/ln").unwrap(), link_dir);
        assert_eq!(ns.readlink(link_dir).unwrap(), "/real/dir");

        let (parent, name) = ns.resolve_parent("/ln/new").unwrap();
        assert_eq!(parent, dir);
        assert_eq!(name, "new");
    }

    #[test]
    fn symlink_cycles_are_bounded() {
        let mut ns = ns();
        ns.create(EntryId::ROOT, "a", NewEntry::Symlink("/b".into()), T0)
            .unwrap();
        ns.create(EntryId::ROOT, "b", NewEntry::Symlink("a".into()), T0)
            .unwrap();
        ns.create(EntryId::ROOT, "self", NewEntry::Symlink("self/x".into()), T0)
            .unwrap();

        assert!(matches!(ns.lookup("/a"), Err(CfsError::SymlinkLoop)));
        assert!(matches!(ns.lookup("/self"), Err(CfsError::SymlinkLoop)));
        assert!(ns.lookup_nofollow("/a").is_ok());
    }

    #[test]
    fn resolve_parent_rejects_root_and_relative() {
        let ns = ns();
        assert!(matches!(ns.resolve_parent("/"), Err(CfsError::InvalidArgument(_))));
        assert!(matches!(ns.resolve_parent("foo"), Err(CfsError::InvalidArgument(_))));
        assert!(matches!(ns.resolve_parent("/a/.."), Err(CfsError::InvalidArgument(_))));
        assert_eq!(ns.resolve_parent("/foo/").unwrap(), (EntryId::ROOT, "foo"));
    }

    #[test]
    fn remove_non_empty_directory_fails() {
        let mut ns = ns();
        let d = mkdir_p(&mut ns, "/d");
        ns.create(d, "f", NewEntry::File, T0).unwrap();
        assert!(matches!(ns.remove(EntryId::ROOT, "d", T1), Err(CfsError::NotEmpty)));
        let removed = ns.remove(d, "f", T1).unwrap();
        assert_eq!(removed.name(), "f");
        ns.remove(EntryId::ROOT, "d", T1).unwrap();
        assert_eq!(ns.len(), 1);
        assert!(matches!(ns.remove(EntryId::ROOT, "d", T1), Err(CfsError::NotFound(_))));
    }

    #[test]
    fn removed_ids_are_reused() {
        let mut ns = ns();
        let a = ns.create(EntryId::ROOT, "a", NewEntry::File, T0).unwrap();
        ns.remove(EntryId::ROOT, "a", T0).unwrap();
        let b = ns.create(EntryId::ROOT, "b", NewEntry::File, T0).unwrap();
        assert_eq!(a, b);
        assert!(matches!(ns.get(EntryId(50)), Err(CfsError::NotFound(_))));
    }

    #[test]
    fn rename_replaces_file_and_keeps_identity() {
        let mut ns = ns();
        let foo = ns.create(EntryId::ROOT, "foo", NewEntry::File, T0).unwrap();
        let bar = ns.create(EntryId::ROOT, "bar", NewEntry::File, T0).unwrap();
        ns.set_file_content(bar, 10, vec![BlockRange::new(BlockNumber(9), 1)])
            .unwrap();

        let replaced = ns
            .rename(EntryId::ROOT, "foo", EntryId::ROOT, "bar", T1)
            .unwrap()
            .expect("bar replaced");
        assert_eq!(replaced.id(), bar);
        assert_eq!(replaced.extents(), &[BlockRange::new(BlockNumber(9), 1)]);
        assert_eq!(ns.lookup("/bar").unwrap(), foo);
        assert!(matches!(ns.lookup("/foo"), Err(CfsError::NotFound(_))));
        assert_eq!(ns.get(foo).unwrap().times().ctime, T1);
        assert_eq!(ns.len(), 2);
    }

    #[test]
    fn rename_moves_across_directories() {
        let mut ns = ns();
        let a = mkdir_p(&mut ns, "/a");
        let b = mkdir_p(&mut ns, "/b");
        let f = ns.create(a, "f", NewEntry::File, T0).unwrap();
        assert!(ns.rename(a, "f", b, "g", T1).unwrap().is_none());
        assert_eq!(ns.lookup("/b/g").unwrap(), f);
        assert_eq!(ns.path_of(f).unwrap(), "/b/g");
        assert!(ns.children(a).unwrap().is_empty());
        assert_eq!(ns.get(a).unwrap().times().mtime, T1);
        assert_eq!(ns.get(b).unwrap().times().mtime, T1);
    }

    #[test]
    fn rename_kind_mismatch_is_unsupported() {
        let mut ns = ns();
        mkdir_p(&mut ns, "/dir/child");
        mkdir_p(&mut ns, "/empty");
        ns.create(EntryId::ROOT, "file", NewEntry::File, T0).unwrap();

        assert!(matches!(
            ns.rename(EntryId::ROOT, "file", EntryId::ROOT, "dir", T1),
            Err(CfsError::Unsupported(_))
        ));
        assert!(matches!(
            ns.rename(EntryId::ROOT, "empty", EntryId::ROOT, "file", T1),
            Err(CfsError::Unsupported(_))
        ));
        assert!(matches!(
            ns.rename(EntryId::ROOT, "empty", EntryId::ROOT, "dir", T1),
            Err(CfsError::NotEmpty)
        ));
        let empty = ns.lookup("/empty").unwrap();
        let dir = ns.lookup("/dir").unwrap();
        let child = ns.lookup("/dir/child").unwrap();
        let replaced = ns.rename(dir, "child", EntryId::ROOT, "empty", T1).unwrap();
        assert_eq!(replaced.map(|e| e.id()), Some(empty));
        assert_eq!(ns.lookup("/empty").unwrap(), child);
    }

    #[test]
    fn rename_into_own_subtree_is_rejected() {
        let mut ns = ns();
        let inner = mkdir_p(&mut ns, "/a/b");
        assert!(matches!(
            ns.rename(EntryId::ROOT, "a", inner, "a", T1),
            Err(CfsError::InvalidArgument(_))
        ));
        assert!(ns.rename(EntryId::ROOT, "a", EntryId::ROOT, "a", T1).unwrap().is_none());
    }

    #[test]
    fn set_times_and_file_content() {
        let mut ns = ns();
        let f = ns.create(EntryId::ROOT, "f", NewEntry::File, T0).unwrap();
        let times = Times {
            atime: Timestamp(946_702_800),
            mtime: Timestamp(946_702_800),
            ctime: Timestamp(946_702_801),
        };
        ns.set_times(f, times).unwrap();
        assert_eq!(ns.get(f).unwrap().times(), times);

        let d = ns.create(EntryId::ROOT, "d", NewEntry::Directory, T0).unwrap();
        assert!(matches!(ns.file_content(d), Err(CfsError::IsDirectory)));
        assert!(matches!(ns.readlink(f), Err(CfsError::InvalidArgument(_))));
        assert_eq!(ns.file_content(f).unwrap(), (0, &[][..]));
    }

    #[test]
    fn from_entries_round_trip() {
        let mut ns = ns();
        mkdir_p(&mut ns, "/alpha/apple/a");
        let f = ns.create(EntryId::ROOT, "f", NewEntry::File, T0).unwrap();
        ns.set_file_content(f, 3, vec![BlockRange::new(BlockNumber(5), 1)])
            .unwrap();
        ns.create(EntryId::ROOT, "l", NewEntry::Symlink("f".into()), T0)
            .unwrap();
        ns.remove(EntryId::ROOT, "f", T1).unwrap();
        let g = ns.create(EntryId::ROOT, "g", NewEntry::File, T1).unwrap();

        let entries: Vec<Entry> = ns.iter().cloned().collect();
        let rebuilt = Namespace::from_entries(entries, 64, 1).unwrap();
        assert_eq!(paths(&rebuilt), paths(&ns));
        assert_eq!(rebuilt.lookup("/g").unwrap(), g);
        assert_eq!(rebuilt.len(), ns.len());
        for entry in ns.iter() {
            assert_eq!(rebuilt.get(entry.id()).unwrap(), entry);
        }
    }

    #[test]
    fn from_entries_detects_structural_corruption() {
        let root = Entry::new(
            EntryId::ROOT,
            EntryId::ROOT,
            String::new(),
            Times::all(T0),
            Content::Directory {
                children: BTreeMap::new(),
            },
        );
        let file = |id: u64, parent: u64, name: &str| {
            Entry::new(
                EntryId(id),
                EntryId(parent),
                name.to_owned(),
                Times::all(T0),
                Content::File {
                    size: 0,
                    extents: Vec::new(),
                },
            )
        };
        let dir = |id: u64, parent: u64, name: &str| {
            Entry::new(
                EntryId(id),
                EntryId(parent),
                name.to_owned(),
                Times::all(T0),
                Content::Directory {
                    children: BTreeMap::new(),
                },
            )
        };
        let is_corrupt =
            |entries: Vec<Entry>| matches!(
                Namespace::from_entries(entries, 64, 1),
                Err(CfsError::Corruption { block: 1, .. })
            );

        assert!(is_corrupt(vec![file(2, 1, "a"), file(3, 1, "a"), root.clone()]));
        assert!(is_corrupt(vec![root.clone(), file(2, 9, "orphan")]));
        assert!(is_corrupt(vec![root.clone(), file(2, 1, "f"), file(3, 2, "x")]));
        assert!(is_corrupt(vec![root.clone(), dir(2, 3, "x"), dir(3, 2, "y")]));
        assert!(is_corrupt(vec![root.clone(), file(2, 1, "a"), file(2, 1, "b")]));
        assert!(is_corrupt(vec![root.clone(), file(100, 1, "far")]));
        assert!(is_corrupt(vec![file(2, 1, "no-root")]));
        assert!(is_corrupt(vec![root.clone(), file(2, 1, "..")]));
        assert!(Namespace::from_entries(vec![root, file(5, 1, "hole")], 64, 1).is_ok());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create(usize, usize),
        Remove(usize, usize),
        Rename(usize, usize, usize, usize),
    }

    const NAMES: [&str; 4] = ["a", "b", "c", "d"];

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..2_usize, 0..4_usize).prop_map(|(d, n)| Op::Create(d, n)),
            (0..2_usize, 0..4_usize).prop_map(|(d, n)| Op::Remove(d, n)),
            (0..2_usize, 0..4_usize, 0..2_usize, 0..4_usize)
                .prop_map(|(sd, sn, dd, dn)| Op::Rename(sd, sn, dd, dn)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn random_file_churn_matches_model(ops in proptest::collection::vec(op_strategy(), 1..60)) {
            let mut ns = ns();
            let sub = ns.create(EntryId::ROOT, "sub", NewEntry::Directory, T0).unwrap();
            let dirs = [EntryId::ROOT, sub];
            let prefix = ["", "/sub"];
            let mut model: BTreeSet<(usize, usize)> = BTreeSet::new();

            for op in ops {
                match op {
                    Op::Create(d, n) => {
                        let res = ns.create(dirs[d], NAMES[n], NewEntry::File, T1);
                        if model.insert((d, n)) {
                            prop_assert!(res.is_ok());
                        } else {
                            prop_assert!(matches!(res, Err(CfsError::Exists)));
                        }
                    }
                    Op::Remove(d, n) => {
                        let res = ns.remove(dirs[d], NAMES[n], T1);
                        prop_assert_eq!(res.is_ok(), model.remove(&(d, n)));
                    }
                    Op::Rename(sd, sn, dd, dn) => {
                        if (sd, sn) == (dd, dn) {
                            continue;
                        }
                        let res = ns.rename(dirs[sd], NAMES[sn], dirs[dd], NAMES[dn], T1);
                        if model.remove(&(sd, sn)) {
                            prop_assert!(res.is_ok());
                            model.insert((dd, dn));
                        } else {
                            prop_assert!(matches!(res, Err(CfsError::NotFound(_))));
                        }
                    }
                }
            }

            let mut expected: BTreeSet<String> = ["/".to_owned(), "/sub".to_owned()].into();
            for (d, n) in &model {
                expected.insert(format!("{}/{}", prefix[*d], NAMES[*n]));
            }
            let actual: BTreeSet<String> = paths(&ns).into_iter().collect();
            prop_assert_eq!(&actual, &expected);
            prop_assert_eq!(ns.len(), model.len() + 2);

            let rebuilt = Namespace::from_entries(ns.iter().cloned().collect(), 64, 1).unwrap();
            prop_assert_eq!(paths(&rebuilt), paths(&ns));
        }
    }
}
