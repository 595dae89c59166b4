//! Generation identity, artifact snapshots and the generation registry.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{Error, Result};

/// Identifier of one generation. Generation 0 is the first boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationId(u64);

impl GenerationId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Lifecycle state of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Ordered set of build outputs a generation runs from.
///
/// Every generation owns its own copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSet {
    paths: Vec<PathBuf>,
}

impl ArtifactSet {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(PathBuf::as_path)
    }

    /// First artifact whose file name or file stem equals `name`.
    pub fn find(&self, name: &str) -> Option<&Path> {
        self.iter().find(|path| {
            path.file_name().is_some_and(|n| n == name) || path.file_stem().is_some_and(|s| s == name)
        })
    }

    /// Newest modification time among the artifacts, walking directories.
    ///
    /// Missing paths are skipped; `None` when nothing could be read.
    pub fn latest_modified(&self) -> Option<SystemTime> {
        self.iter().filter_map(newest_mtime).max()
    }
}

fn newest_mtime(path: &Path) -> Option<SystemTime> {
    let metadata = std::fs::metadata(path).ok()?;
    let own = metadata.modified().ok();
    if !metadata.is_dir() {
        return own;
    }

    let children = std::fs::read_dir(path)
        .ok()
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| newest_mtime(&entry.path()));

    children.chain(own).max()
}

impl FromIterator<PathBuf> for ArtifactSet {
    fn from_iter<I: IntoIterator<Item = PathBuf>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Snapshot of one generation as seen through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRecord {
    pub id: GenerationId,
    pub entry_point: String,
    pub artifacts: usize,
    pub endpoint: SocketAddr,
    pub state: GenerationState,
}

/// Arena of every generation ever created, indexed by id.
#[derive(Debug, Default)]
pub(crate) struct GenerationRegistry {
    records: BTreeMap<GenerationId, GenerationRecord>,
}

impl GenerationRegistry {
    pub(crate) fn insert(&mut self, record: GenerationRecord) {
        self.records.insert(record.id, record);
    }

    pub(crate) fn set_state(&mut self, id: GenerationId, state: GenerationState) {
        if let Some(record) = self.records.get_mut(&id) {
            tracing::trace!(generation = %id, from = %record.state, to = %state, "generation state");
            record.state = state;
        }
    }

    pub(crate) fn get(&self, id: GenerationId) -> Option<&GenerationRecord> {
        self.records.get(&id)
    }

    pub(crate) fn snapshot(&self) -> Vec<GenerationRecord> {
        self.records.values().cloned().collect()
    }
}

/// Pick the address a generation will listen on.
///
/// Port `0` asks the OS for a free port, which is released again
/// immediately so the generation can bind it.
pub fn allocate_endpoint(host: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = if host == "localhost" {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        host.parse()
            .map_err(|_| Error::Config(format!("invalid http host: {}", host)))?
    };

    if port != 0 {
        return Ok(SocketAddr::new(ip, port));
    }

    let listener = TcpListener::bind(SocketAddr::new(ip, 0))?;
    Ok(listener.local_addr()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_generation_id_display() {
        assert_eq!(GenerationId::new(3).to_string(), "v3");
        assert!(GenerationId::new(1) < GenerationId::new(2));
    }

    #[test]
    fn test_artifact_find_by_name_or_stem() {
        let set: ArtifactSet = [
            PathBuf::from("/target/debug/libfoo.rlib"),
            PathBuf::from("/target/debug/server.exe"),
        ]
        .into_iter()
        .collect();

        assert_eq!(set.find("server"), Some(Path::new("/target/debug/server.exe")));
        assert_eq!(set.find("libfoo.rlib"), Some(Path::new("/target/debug/libfoo.rlib")));
        assert!(set.find("client").is_none());
    }

    #[test]
    fn test_latest_modified_walks_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let set = ArtifactSet::new(vec![dir.path().to_path_buf()]);
        let before = set.latest_modified().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(nested.join("b.txt"), "b").unwrap();
        let after = set.latest_modified().unwrap();
        assert!(after > before);
    }

    #[test]
    fn test_latest_modified_missing_paths() {
        let set = ArtifactSet::new(vec![PathBuf::from("/definitely/not/here")]);
        assert!(set.latest_modified().is_none());
    }

    #[test]
    fn test_registry_keeps_creation_order() {
        let mut registry = GenerationRegistry::default();
        let endpoint: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        for id in [2, 0, 1] {
            registry.insert(GenerationRecord {
                id: GenerationId::new(id),
                entry_point: "app".into(),
                artifacts: 0,
                endpoint,
                state: GenerationState::Starting,
            });
        }
        registry.set_state(GenerationId::new(1), GenerationState::Running);

        let ids: Vec<_> = registry.snapshot().iter().map(|r| r.id.as_u64()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(
            registry.get(GenerationId::new(1)).map(|r| r.state),
            Some(GenerationState::Running)
        );
    }

    #[test]
    fn test_allocate_endpoint() {
        let fixed = allocate_endpoint("127.0.0.1", 8123).unwrap();
        assert_eq!(fixed.port(), 8123);

        let ephemeral = allocate_endpoint("localhost", 0).unwrap();
        assert_ne!(ephemeral.port(), 0);

        assert!(matches!(allocate_endpoint("not a host", 0), Err(Error::Config(_))));
    }
}
