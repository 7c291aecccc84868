use crate::error::{Error, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Client launch parameters, forwarded to the container as environment variables.
///
/// Tests usually define common parameters once and customize them per client,
/// so `set` and `bundle` return modified copies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the parameters with `key` set to `value`.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Params {
        let mut cpy = self.clone();
        cpy.0.insert(key.into(), value.into());
        cpy
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Merges `other` on top of these parameters.
    pub fn bundle(&self, other: &Params) -> Params {
        let mut cpy = self.clone();
        cpy.0
            .extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        cpy
    }

    /// Prefixes every key with `HIVE_` unless it already carries it. Used when
    /// a nested configuration group is flattened into client parameters.
    pub fn hive_prefixed(&self) -> Params {
        Params(
            self.0
                .iter()
                .map(|(k, v)| {
                    let key = if k.starts_with("HIVE_") {
                        k.clone()
                    } else {
                        format!("HIVE_{k}")
                    };
                    (key, v.clone())
                })
                .collect(),
        )
    }

    /// Loads a flat JSON object of parameters, such as a fork environment file.
    /// Numbers and booleans are converted to their decimal text.
    pub fn from_json(text: &str) -> Result<Params> {
        let value: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
        let mut params = Params::new();
        for (k, v) in value {
            let v = match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            params.insert(k, v);
        }
        Ok(params)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Params> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("can't read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn into_env(self) -> HashMap<String, String> {
        self.0.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Params(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<HashMap<String, String>> for Params {
    fn from(map: HashMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

pub type FileProducer = Arc<dyn Fn() -> Result<Bytes> + Send + Sync>;

/// Where the content of a file uploaded into a client container comes from.
#[derive(Clone)]
pub enum FileSource {
    /// Literal content.
    Bytes(Bytes),
    /// Produced anew on every client start.
    Dynamic(FileProducer),
    /// A file on the simulator's filesystem. Content is cached by hash.
    Path(PathBuf),
    /// A directory on the simulator's filesystem, uploaded as a tar archive.
    TarDir(PathBuf),
}

impl FileSource {
    pub fn bytes(content: impl Into<Bytes>) -> Self {
        FileSource::Bytes(content.into())
    }

    pub fn dynamic(producer: impl Fn() -> Result<Bytes> + Send + Sync + 'static) -> Self {
        FileSource::Dynamic(Arc::new(producer))
    }
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            FileSource::Dynamic(_) => write!(f, "Dynamic"),
            FileSource::Path(p) => write!(f, "Path({})", p.display()),
            FileSource::TarDir(p) => write!(f, "TarDir({})", p.display()),
        }
    }
}

/// Everything needed to launch a client besides its type.
#[derive(Clone, Debug, Default)]
pub struct ClientOptions {
    pub params: Params,
    /// destination path -> content
    pub files: BTreeMap<String, FileSource>,
    /// networks the client joins before its entry point runs
    pub networks: Vec<String>,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = self.params.bundle(&params);
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key, value);
        self
    }

    pub fn file(mut self, path: impl Into<String>, source: FileSource) -> Self {
        self.files.insert(path.into(), source);
        self
    }

    /// Adds host files. Map: destination path -> source path.
    pub fn static_files<I, K, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: Into<PathBuf>,
    {
        for (dst, src) in files {
            self.files.insert(dst.into(), FileSource::Path(src.into()));
        }
        self
    }

    pub fn networks(mut self, networks: Vec<String>) -> Self {
        self.networks = networks;
        self
    }

    /// Combines two option sets, `other` wins on conflicts.
    pub fn bundle(mut self, other: ClientOptions) -> Self {
        self.params = self.params.bundle(&other.params);
        self.files.extend(other.files);
        self.networks.extend(other.networks);
        self
    }
}

/// Content cache for files read from the simulator's filesystem. Identical
/// contents share one buffer.
#[derive(Clone, Debug, Default)]
pub struct FileCache {
    inner: Arc<Mutex<CacheInner>>,
}

#[derive(Debug, Default)]
struct CacheInner {
    by_path: HashMap<PathBuf, String>,
    by_hash: HashMap<String, Bytes>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(&self, path: &Path) -> Result<Bytes> {
        {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(content) = inner
                .by_path
                .get(path)
                .and_then(|hash| inner.by_hash.get(hash))
            {
                return Ok(content.clone());
            }
        }

        let content = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Config(format!("can't read {}: {e}", path.display())))?;
        let hash = content_hash(&content);

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let content = inner
            .by_hash
            .entry(hash.clone())
            .or_insert_with(|| Bytes::from(content))
            .clone();
        inner.by_path.insert(path.to_path_buf(), hash);
        Ok(content)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_hash
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves a file source into the bytes that get uploaded.
    pub async fn resolve(&self, source: &FileSource) -> Result<Bytes> {
        match source {
            FileSource::Bytes(b) => Ok(b.clone()),
            FileSource::Dynamic(produce) => produce(),
            FileSource::Path(path) => self.load(path).await,
            FileSource::TarDir(dir) => {
                let dir = dir.clone();
                tokio::task::spawn_blocking(move || tar_directory(&dir))
                    .await
                    .map_err(|e| Error::Config(format!("tar task failed: {e}")))?
            }
        }
    }
}

pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn tar_directory(dir: &Path) -> Result<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", dir)
        .map_err(|e| Error::Config(format!("can't archive {}: {e}", dir.display())))?;
    let archive = builder
        .into_inner()
        .map_err(|e| Error::Config(format!("can't archive {}: {e}", dir.display())))?;
    Ok(Bytes::from(archive))
}
