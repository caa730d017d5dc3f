//! The on-disk hierarchy: root lifecycle, group creation and sidecar files.
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::info;
use serde::{Deserialize, Serialize};
use zarrs::{filesystem::FilesystemStore, group::GroupBuilder};

/// Name of the manifest copied next to written sub-groups.
pub const MANIFEST_NAME: &str = "manifest.csv";

/// Absolute path of a node in the hierarchy, e.g. `/` or `/classes/L23_IT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupPath(String);

impl GroupPath {
    pub fn root() -> Self {
        Self("/".into())
    }

    /// Parse a `/`-separated path; a leading `/` is optional.
    pub fn parse(path: &str) -> crate::Result<Self> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(Self::root(), |acc, name| acc.child(name))
    }

    pub fn child(&self, name: &str) -> crate::Result<Self> {
        validate_node_name(name)?;
        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path component, or None for the root.
    pub fn name(&self) -> Option<&str> {
        self.0.rsplit('/').next().filter(|s| !s.is_empty())
    }

    /// Location relative to the store root directory.
    pub fn relative_dir(&self) -> PathBuf {
        self.0.split('/').filter(|s| !s.is_empty()).collect()
    }
}

impl fmt::Display for GroupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for GroupPath {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<GroupPath> for String {
    fn from(value: GroupPath) -> Self {
        value.0
    }
}

/// Check that `name` can name a child node.
pub fn validate_node_name(name: &str) -> crate::Result<()> {
    if name.is_empty()
        || name.contains(['/', '\\'])
        || name.chars().all(|c| c == '.')
        || name.starts_with("__")
    {
        return Err(crate::Error::config(format!("invalid node name {name:?}")));
    }
    Ok(())
}

/// Remove `path` if `clobber`, fail if it still exists, then create it.
pub(crate) fn prepare_root(path: &Path, clobber: bool) -> crate::Result<()> {
    if path.exists() {
        if !clobber {
            return Err(crate::Error::StoreExists(path.to_path_buf()));
        }
        info!("cleaning out {}", path.display());
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
    }
    fs::create_dir_all(path)?;
    Ok(())
}

/// Handle on the root directory of a hierarchical store.
///
/// Handles are cheap to open; each worker process opens its own.
#[derive(Clone)]
pub struct StoreRoot {
    path: PathBuf,
    store: Arc<FilesystemStore>,
}

impl fmt::Debug for StoreRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRoot").field("path", &self.path).finish()
    }
}

impl StoreRoot {
    /// Create a new store root with an empty root group.
    ///
    /// An existing directory is deleted first if `clobber` is set,
    /// otherwise this fails with [crate::Error::StoreExists] without touching it.
    pub fn create(path: impl AsRef<Path>, clobber: bool) -> crate::Result<Self> {
        let path = path.as_ref();
        prepare_root(path, clobber)?;
        let root = Self::open(path)?;
        GroupBuilder::new()
            .build(root.store.clone(), GroupPath::root().as_str())
            .map_err(crate::Error::wrap)?
            .store_metadata()?;
        Ok(root)
    }

    /// Open an existing store root.
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(crate::Error::general(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        let store = FilesystemStore::new(path).map_err(crate::Error::wrap)?;
        Ok(Self {
            path: path.to_path_buf(),
            store: Arc::new(store),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&self) -> Arc<FilesystemStore> {
        self.store.clone()
    }

    /// Directory holding the node at `group`.
    pub fn node_dir(&self, group: &GroupPath) -> PathBuf {
        self.path.join(group.relative_dir())
    }

    /// Create a new child group with the given attributes.
    ///
    /// The node directory is claimed with a single `mkdir`, so of several
    /// processes creating the same name exactly one succeeds; the rest get
    /// [crate::Error::DuplicateName].
    pub fn create_group(
        &self,
        parent: &GroupPath,
        name: &str,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> crate::Result<GroupPath> {
        let node = parent.child(name)?;
        let parent_dir = self.node_dir(parent);
        if !parent_dir.is_dir() {
            return Err(crate::Error::general(format!(
                "parent group {parent} does not exist"
            )));
        }
        match fs::create_dir(self.node_dir(&node)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(crate::Error::DuplicateName(node.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        let mut group = GroupBuilder::new()
            .build(self.store.clone(), node.as_str())
            .map_err(crate::Error::wrap)?;
        group.attributes_mut().extend(attributes);
        group.store_metadata()?;
        Ok(node)
    }

    /// Names of the child nodes of `group`, sorted.
    pub fn children(&self, group: &GroupPath) -> crate::Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.node_dir(group))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Copy a manifest verbatim into the directory of `group`.
    ///
    /// Fails if a manifest already exists there.
    pub fn copy_manifest(&self, group: &GroupPath, manifest: &Path) -> crate::Result<PathBuf> {
        let destination = self.node_dir(group).join(MANIFEST_NAME);
        let mut src = File::open(manifest)?;
        let mut dst = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&destination)
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(crate::Error::general(format!(
                    "{} already exists",
                    destination.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        io::copy(&mut src, &mut dst)?;
        Ok(destination)
    }
}
