//! Cookie-keyed session registry.
//!
//! Each session owns the list of files it has uploaded; ownership checks
//! gate deletes. The whole registry can be serialized to a framed binary
//! file at shutdown and read back at startup. Session state is advisory:
//! the server keeps running when persistence fails.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context};

const COOKIE_KEY: &str = "sessionId=";

const MAGIC: &[u8; 4] = b"SBSS";
const FORMAT_VERSION: u32 = 1;

/// Sanity limits applied when loading a persisted registry. A file that
/// violates them is treated as corrupt and the registry is cleared.
const MAX_ID_LEN: u64 = 4096;
const MAX_NAME_LEN: u64 = 4096;
const MAX_FILE_COUNT: u64 = 10_000;

/// Process-wide map from session id to the files that session uploaded.
///
/// All operations serialize on one mutex; lookups may come in from worker
/// threads while the reactor mutates.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Vec<String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves the session named by a `Cookie` header, creating a fresh
    /// one when the header carries no known id. Returns the id and
    /// whether it was newly created.
    pub fn resolve_or_create(&self, cookie_header: Option<&str>) -> (String, bool) {
        let mut sessions = self.sessions.lock().unwrap();

        if let Some(header) = cookie_header {
            if let Some(pos) = header.find(COOKIE_KEY) {
                let value = &header[pos + COOKIE_KEY.len()..];
                let id = match value.find(';') {
                    Some(end) => &value[..end],
                    None => value,
                };
                if sessions.contains_key(id) {
                    return (id.to_string(), false);
                }
            }
        }

        let id = generate_session_id();
        sessions.insert(id.clone(), Vec::new());
        tracing::debug!(session = %id, "created session");
        (id, true)
    }

    pub fn add_uploaded_file(&self, id: &str, name: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(id.to_string())
            .or_default()
            .push(name.to_string());
    }

    pub fn owns_file(&self, id: &str, name: &str) -> bool {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(id)
            .map(|files| files.iter().any(|f| f == name))
            .unwrap_or(false)
    }

    /// Removes one occurrence of `name` from the session's file list.
    pub fn remove_file(&self, id: &str, name: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        let files = match sessions.get_mut(id) {
            Some(f) => f,
            None => return false,
        };
        match files.iter().position(|f| f == name) {
            Some(i) => {
                files.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(id)
    }

    /// Inserts an id with an empty file list. Mostly useful to seed
    /// fixtures.
    pub fn insert(&self, id: &str) {
        self.sessions
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default();
    }

    /// Rewrites `path` with the full registry in the framed binary
    /// format: `SBSS`, format version, then length-prefixed ids and file
    /// names, all little-endian. Sessions are written in sorted id order
    /// so equal registries produce byte-equal dumps.
    pub fn serialize(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let sessions = self.sessions.lock().unwrap();
        let path = path.as_ref();
        let mut file = File::create(path)
            .with_context(|| format!("creating session file {}", path.display()))?;

        file.write_all(MAGIC)?;
        file.write_all(&FORMAT_VERSION.to_le_bytes())?;
        file.write_all(&(sessions.len() as u64).to_le_bytes())?;

        let mut ordered: Vec<_> = sessions.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(b.0));

        for (id, files) in ordered {
            write_frame(&mut file, id.as_bytes())?;
            file.write_all(&(files.len() as u64).to_le_bytes())?;
            for name in files {
                write_frame(&mut file, name.as_bytes())?;
            }
        }
        file.flush()?;
        Ok(())
    }

    /// Replaces the registry with the contents of `path`. Any short read,
    /// sanity-limit violation or I/O error clears the registry and
    /// reports the failure.
    pub fn deserialize(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.clear();

        let path = path.as_ref();
        let mut file = File::open(path)
            .with_context(|| format!("opening session file {}", path.display()))?;

        match self.read_all(&mut file) {
            Ok(loaded) => {
                *sessions = loaded;
                Ok(())
            }
            Err(e) => {
                sessions.clear();
                Err(e).with_context(|| format!("loading session file {}", path.display()))
            }
        }
    }

    fn read_all(&self, file: &mut File) -> anyhow::Result<HashMap<String, Vec<String>>> {
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic).context("reading magic")?;
        if &magic != MAGIC {
            bail!("bad magic");
        }
        let version = read_u32(file).context("reading version")?;
        if version != FORMAT_VERSION {
            bail!("unsupported format version {version}");
        }

        let mut sessions = HashMap::new();
        let session_count = read_u64(file).context("reading session count")?;
        for _ in 0..session_count {
            let id = read_frame(file, MAX_ID_LEN).context("reading session id")?;
            let file_count = read_u64(file).context("reading file count")?;
            if file_count > MAX_FILE_COUNT {
                bail!("file count {file_count} exceeds sanity limit");
            }
            let mut files = Vec::with_capacity(file_count as usize);
            for _ in 0..file_count {
                files.push(read_frame(file, MAX_NAME_LEN).context("reading file name")?);
            }
            sessions.insert(id, files);
        }
        Ok(sessions)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One request's view of its session: the resolved id plus the registry
/// operations a request handler is allowed to perform.
pub struct SessionHandle {
    id: String,
    is_new: bool,
    registry: std::sync::Arc<SessionRegistry>,
}

impl SessionHandle {
    pub fn resolve(
        registry: std::sync::Arc<SessionRegistry>,
        cookie_header: Option<&str>,
    ) -> Self {
        let (id, is_new) = registry.resolve_or_create(cookie_header);
        Self {
            id,
            is_new,
            registry,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this request minted the session, i.e. a `Set-Cookie` is due.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn add_uploaded_file(&self, name: &str) {
        self.registry.add_uploaded_file(&self.id, name);
    }

    pub fn owns_file(&self, name: &str) -> bool {
        self.registry.owns_file(&self.id, name)
    }

    pub fn remove_file(&self, name: &str) -> bool {
        self.registry.remove_file(&self.id, name)
    }
}

/// 16 lowercase hex digits from an entropy-seeded 64-bit generator.
fn generate_session_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

fn write_frame(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(&(bytes.len() as u64).to_le_bytes())?;
    file.write_all(bytes)
}

fn read_u32(file: &mut File) -> anyhow::Result<u32> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(file: &mut File) -> anyhow::Result<u64> {
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_frame(file: &mut File, max_len: u64) -> anyhow::Result<String> {
    let len = read_u64(file)?;
    if len > max_len {
        bail!("frame length {len} exceeds sanity limit {max_len}");
    }
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    String::from_utf8(buf).context("frame is not valid UTF-8")
}
