use std::borrow::Cow;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::PipelineConfig;

/// A 32-byte BLAKE3 hash used for content-addressing.
///
/// Image compression results are cached under the hex form of this hash, so
/// the same input with the same transform maps to the same cache entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// Hash a buffer together with a description of the work applied to it.
    pub(crate) fn hash_with(buffer: impl AsRef<[u8]>, salt: &str) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .update(&[0])
            .update(salt.as_bytes())
            .finalize()
            .into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// The mode in which the pipeline is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A one-time build, compile errors fail the run.
    Build,
    /// A long running watch loop, compile errors are only reported.
    Watch,
}

/// Immutable state shared with every task of a run.
///
/// This replaces any kind of global switch: the compression flag and the
/// deployment environment live in [`PipelineConfig`], and a deploy run simply
/// gets a different `Environment` than a development build.
#[derive(Debug, Clone)]
pub struct Environment {
    /// The current mode (Build or Watch).
    pub mode: Mode,
    /// The port of the live reload socket, if one is running.
    pub port: Option<u16>,
    /// Project configuration.
    pub config: Arc<PipelineConfig>,
}

impl Environment {
    pub fn new(mode: Mode, config: impl Into<Arc<PipelineConfig>>) -> Self {
        Self {
            mode,
            port: None,
            config: config.into(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Returns a script tag that reloads the page whenever the live reload
    /// socket broadcasts a message.
    pub fn get_refresh_script(&self) -> Option<String> {
        self.port.map(|port| {
            format!(
                r#"<script>
const socket = new WebSocket("ws://localhost:{port}");
socket.addEventListener("message", () => window.location.reload());
</script>"#
            )
        })
    }
}

/// Content of a single file flowing between tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Bytes produced in memory by a task.
    Bytes(Arc<[u8]>),
    /// The file was passed through untouched, this points at its location.
    Source(Utf8PathBuf),
}

impl Content {
    pub fn read(&self) -> std::io::Result<Cow<'_, [u8]>> {
        match self {
            Content::Bytes(bytes) => Ok(Cow::Borrowed(bytes)),
            Content::Source(path) => fs::read(path).map(Cow::Owned),
        }
    }
}

impl From<Vec<u8>> for Content {
    fn from(value: Vec<u8>) -> Self {
        Content::Bytes(value.into())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Bytes(value.into_bytes().into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Path relative to the directory the owning task writes into.
    pub path: Utf8PathBuf,
    pub content: Content,
}

impl FileRecord {
    pub fn new(path: impl Into<Utf8PathBuf>, content: impl Into<Content>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn source(path: impl Into<Utf8PathBuf>, from: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            content: Content::Source(from.into()),
        }
    }
}

/// An ordered collection of files, the unit of data passed between tasks.
///
/// Records are kept sorted by path and a path occurs at most once, the last
/// insert wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet {
    records: Vec<FileRecord>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: FileRecord) {
        match self
            .records
            .binary_search_by(|entry| entry.path.cmp(&record.path))
        {
            Ok(i) => self.records[i] = record,
            Err(i) => self.records.insert(i, record),
        }
    }

    pub fn merge(&mut self, other: FileSet) {
        for record in other.records {
            self.insert(record);
        }
    }

    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Option<&FileRecord> {
        let path = path.as_ref();
        self.records
            .binary_search_by(|entry| entry.path.as_path().cmp(path))
            .ok()
            .map(|i| &self.records[i])
    }

    pub fn contains(&self, path: impl AsRef<Utf8Path>) -> bool {
        self.get(path).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileRecord> {
        self.records.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.records.iter().map(|r| r.path.as_path())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write every record below `root`, creating directories as needed.
    pub fn write_to(&self, root: &Utf8Path) -> std::io::Result<()> {
        for record in &self.records {
            let path = root.join(&record.path);
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }

            match &record.content {
                Content::Bytes(bytes) => fs::write(&path, bytes)?,
                Content::Source(from) => {
                    fs::copy(from, &path)?;
                }
            }
        }

        Ok(())
    }
}

impl FromIterator<FileRecord> for FileSet {
    fn from_iter<I: IntoIterator<Item = FileRecord>>(iter: I) -> Self {
        let mut set = FileSet::new();
        for record in iter {
            set.insert(record);
        }
        set
    }
}

impl<'a> IntoIterator for &'a FileSet {
    type Item = &'a FileRecord;
    type IntoIter = std::slice::Iter<'a, FileRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
