//! Bundle container codec.
//!
//! A container is a flat archive of named entries preceded by a manifest of
//! SHA-256 digests. The manifest comes first so a reader can check every
//! entry while streaming it, without buffering the whole container.
//!
//! ## Layout
//!
//! ```text
//! magic    "BNDL"            4 bytes
//! version  u8                1 byte
//! count    u16 BE            2 bytes
//! manifest count × { name_len u16 BE | name utf8 | len u64 BE | sha256 [32] }
//! body     count × entry bytes, in manifest order
//! ```
//!
//! All integers are big-endian and unsigned.

use std::collections::{BTreeMap, HashSet};
use std::io::{ErrorKind, Read, Write};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::crypto::Sha256Digest;
use crate::error::{CoreError, Result};

/// Container magic bytes.
pub const MAGIC: [u8; 4] = *b"BNDL";

/// Current container format version.
pub const FORMAT_VERSION: u8 = 1;

/// Structural limits enforced on read and write.
pub mod limits {
    /// Max entries in one container.
    pub const MAX_ENTRIES: usize = 4096;
    /// Max entry name length in bytes.
    pub const MAX_NAME_LEN: usize = 255;
    /// Read granularity while hashing an entry.
    pub const READ_CHUNK: usize = 64 * 1024;
}

/// One manifest record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub len: u64,
    pub digest: Sha256Digest,
}

/// The ordered manifest of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Digest over every manifest record except `excluded`.
    ///
    /// Used as the signing input for a detached signature stored in the
    /// container itself under the excluded name.
    pub fn digest_excluding(&self, excluded: &str) -> Sha256Digest {
        let mut hasher = Sha256::new();
        for entry in self.entries.iter().filter(|e| e.name != excluded) {
            hasher.update((entry.name.len() as u16).to_be_bytes());
            hasher.update(entry.name.as_bytes());
            hasher.update(entry.len.to_be_bytes());
            hasher.update(entry.digest.as_bytes());
        }
        Sha256Digest::from_hasher(hasher)
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > limits::MAX_NAME_LEN {
        return Err(CoreError::MalformedContainer(format!(
            "entry name length {} out of range",
            name.len()
        )));
    }
    Ok(())
}

/// Builds a container from named entries.
#[derive(Debug, Default, Clone)]
pub struct ContainerBuilder {
    entries: Vec<(String, Bytes)>,
    names: HashSet<String>,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Names must be unique within a container.
    pub fn add(&mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Result<&mut Self> {
        let name = name.into();
        check_name(&name)?;
        if self.entries.len() >= limits::MAX_ENTRIES {
            return Err(CoreError::MalformedContainer("too many entries".into()));
        }
        if !self.names.insert(name.clone()) {
            return Err(CoreError::DuplicateEntry(name));
        }
        self.entries.push((name, data.into()));
        Ok(self)
    }

    /// Compute the manifest for the entries added so far.
    pub fn manifest(&self) -> Manifest {
        Manifest {
            entries: self
                .entries
                .iter()
                .map(|(name, data)| ManifestEntry {
                    name: name.clone(),
                    len: data.len() as u64,
                    digest: Sha256Digest::hash(data),
                })
                .collect(),
        }
    }

    /// Serialize into a byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let manifest = self.manifest();
        let body_len: usize = self.entries.iter().map(|(_, d)| d.len()).sum();
        let mut out = Vec::with_capacity(7 + manifest.entries.len() * 48 + body_len);
        encode_header(&manifest, &mut out);
        for (_, data) in &self.entries {
            out.extend_from_slice(data);
        }
        out
    }

    /// Serialize into a writer.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        let manifest = self.manifest();
        let mut header = Vec::new();
        encode_header(&manifest, &mut header);
        writer.write_all(&header)?;
        for (_, data) in &self.entries {
            writer.write_all(data)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn encode_header(manifest: &Manifest, out: &mut Vec<u8>) {
    out.extend_from_slice(&MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&(manifest.entries.len() as u16).to_be_bytes());
    for entry in &manifest.entries {
        out.extend_from_slice(&(entry.name.len() as u16).to_be_bytes());
        out.extend_from_slice(entry.name.as_bytes());
        out.extend_from_slice(&entry.len.to_be_bytes());
        out.extend_from_slice(entry.digest.as_bytes());
    }
}

/// Pack a list of named entries into container bytes.
///
/// Fails with [`CoreError::DuplicateEntry`] if a name repeats.
pub fn pack<N, D>(entries: impl IntoIterator<Item = (N, D)>) -> Result<Vec<u8>>
where
    N: Into<String>,
    D: Into<Bytes>,
{
    let mut builder = ContainerBuilder::new();
    for (name, data) in entries {
        builder.add(name, data)?;
    }
    Ok(builder.to_bytes())
}

/// A verified container entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub data: Bytes,
}

/// Streaming container reader.
///
/// Reads the manifest eagerly and the body one entry at a time. An entry is
/// returned only after its digest has been checked.
pub struct ContainerReader<R> {
    reader: R,
    manifest: Manifest,
    next: usize,
}

fn map_eof(e: std::io::Error, what: &str) -> CoreError {
    if e.kind() == ErrorKind::UnexpectedEof {
        CoreError::MalformedContainer(format!("truncated {what}"))
    } else {
        CoreError::Io(e)
    }
}

fn read_array<R: Read, const N: usize>(reader: &mut R, what: &str) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(|e| map_eof(e, what))?;
    Ok(buf)
}

impl<R: Read> ContainerReader<R> {
    /// Parse the header and manifest.
    pub fn new(mut reader: R) -> Result<Self> {
        let magic: [u8; 4] = read_array(&mut reader, "header")?;
        if magic != MAGIC {
            return Err(CoreError::MalformedContainer("bad magic".into()));
        }
        let [version] = read_array::<_, 1>(&mut reader, "header")?;
        if version != FORMAT_VERSION {
            return Err(CoreError::MalformedContainer(format!(
                "unsupported version {version}"
            )));
        }
        let count = u16::from_be_bytes(read_array(&mut reader, "header")?) as usize;
        if count > limits::MAX_ENTRIES {
            return Err(CoreError::MalformedContainer("too many entries".into()));
        }

        let mut seen = HashSet::with_capacity(count);
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let name_len = u16::from_be_bytes(read_array(&mut reader, "manifest")?) as usize;
            if name_len == 0 || name_len > limits::MAX_NAME_LEN {
                return Err(CoreError::MalformedContainer(format!(
                    "entry name length {name_len} out of range"
                )));
            }
            let mut name = vec![0u8; name_len];
            reader
                .read_exact(&mut name)
                .map_err(|e| map_eof(e, "manifest"))?;
            let name = String::from_utf8(name)
                .map_err(|_| CoreError::MalformedContainer("entry name is not utf-8".into()))?;
            let len = u64::from_be_bytes(read_array(&mut reader, "manifest")?);
            let digest = Sha256Digest::from_bytes(read_array(&mut reader, "manifest")?);
            if !seen.insert(name.clone()) {
                return Err(CoreError::MalformedContainer(format!(
                    "duplicate entry {name:?}"
                )));
            }
            entries.push(ManifestEntry { name, len, digest });
        }

        Ok(Self {
            reader,
            manifest: Manifest { entries },
            next: 0,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Read and verify the next entry.
    ///
    /// Returns `Ok(None)` once every manifest entry has been read.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        let Some(meta) = self.manifest.entries.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;

        let mut hasher = Sha256::new();
        let mut data = Vec::with_capacity((meta.len as usize).min(limits::READ_CHUNK));
        let mut buf = vec![0u8; limits::READ_CHUNK];
        let mut remaining = meta.len;
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            self.reader
                .read_exact(&mut buf[..n])
                .map_err(|e| map_eof(e, "entry"))?;
            hasher.update(&buf[..n]);
            data.extend_from_slice(&buf[..n]);
            remaining -= n as u64;
        }

        if Sha256Digest::from_hasher(hasher) != meta.digest {
            return Err(CoreError::Integrity {
                entry: meta.name.clone(),
            });
        }

        Ok(Some(Entry {
            name: meta.name.clone(),
            data: Bytes::from(data),
        }))
    }

    /// Read every remaining entry and check that nothing trails the body.
    pub fn read_all(mut self) -> Result<Container> {
        let mut entries = BTreeMap::new();
        while let Some(entry) = self.next_entry()? {
            entries.insert(entry.name, entry.data);
        }
        let mut probe = [0u8; 1];
        loop {
            match self.reader.read(&mut probe) {
                Ok(0) => break,
                Ok(_) => {
                    return Err(CoreError::MalformedContainer(
                        "trailing bytes after body".into(),
                    ))
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(CoreError::Io(e)),
            }
        }
        Ok(Container {
            manifest: self.manifest,
            entries,
        })
    }
}

/// A fully verified container, entries addressed by name.
#[derive(Debug, Clone)]
pub struct Container {
    manifest: Manifest,
    entries: BTreeMap<String, Bytes>,
}

impl Container {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries.get(name)
    }

    /// Get an entry or fail with [`CoreError::MissingEntry`].
    pub fn require(&self, name: &str) -> Result<&Bytes> {
        self.entries
            .get(name)
            .ok_or_else(|| CoreError::MissingEntry(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> BTreeMap<String, Bytes> {
        self.entries
    }

    /// Re-encode in manifest order. The layout is canonical, so this yields
    /// exactly the bytes the container was read from.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body_len: u64 = self.manifest.entries.iter().map(|e| e.len).sum();
        let mut out = Vec::with_capacity(
            7 + self.manifest.entries.len() * 48 + usize::try_from(body_len).unwrap_or(0),
        );
        encode_header(&self.manifest, &mut out);
        for entry in &self.manifest.entries {
            if let Some(data) = self.entries.get(&entry.name) {
                out.extend_from_slice(data);
            }
        }
        out
    }
}

/// Unpack and verify container bytes.
pub fn unpack(bytes: &[u8]) -> Result<Container> {
    ContainerReader::new(bytes)?.read_all()
}
