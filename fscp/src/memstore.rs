//! In-memory prefix store: objects addressed by host (bucket) and key, directories implied by key
//! prefixes.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, bail};
use remote::cancel::CancelScope;
use remote::streams::Writer;
use remote::tarstream::{EntryMeta, TarSource};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::backend::{self, FileShare};
use crate::connection::{Connection, FileCopyOpts, FileInfo, MEM_SCHEME};
use crate::copy::PolicyError;

const DEFAULT_MODE: u32 = 0o644;

#[derive(Clone, Debug)]
struct Object {
    data: Arc<[u8]>,
    mtime: u64,
}

#[derive(Debug, Default)]
pub struct MemStore {
    // (host, key)
    objects: std::sync::Mutex<BTreeMap<(String, String), Object>>,
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

fn key_of(path: &str) -> anyhow::Result<String> {
    common::path::clean_path_prefix(path).with_context(|| format!("invalid key {path:?}"))
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), Object>> {
        self.objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Stores `data` under `key`, replacing any previous object.
    pub fn insert(&self, host: &str, key: &str, data: impl Into<Arc<[u8]>>) -> anyhow::Result<()> {
        let key = key_of(key)?;
        if key.is_empty() {
            bail!("cannot store an object at the root of {:?}", host);
        }
        self.objects().insert(
            (host.to_string(), key),
            Object {
                data: data.into(),
                mtime: now(),
            },
        );
        Ok(())
    }

    pub fn get(&self, host: &str, key: &str) -> Option<Arc<[u8]>> {
        let key = key_of(key).ok()?;
        self.objects()
            .get(&(host.to_string(), key))
            .map(|object| object.data.clone())
    }

    /// All keys of `host` in order.
    pub fn keys(&self, host: &str) -> Vec<String> {
        self.objects()
            .keys()
            .filter(|(object_host, _)| object_host == host)
            .map(|(_, key)| key.clone())
            .collect()
    }

    // Objects of `host` whose key starts with `prefix`, in key order.
    fn scan(&self, host: &str, prefix: &str) -> Vec<(String, Object)> {
        self.objects()
            .range((host.to_string(), prefix.to_string())..)
            .take_while(|((object_host, key), _)| object_host == host && key.starts_with(prefix))
            .map(|((_, key), object)| (key.clone(), object.clone()))
            .collect()
    }
}

fn dir_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{key}/")
    }
}

#[async_trait::async_trait]
impl FileShare for MemStore {
    fn connection_type(&self) -> &str {
        MEM_SCHEME
    }

    async fn stat(&self, conn: &Connection) -> anyhow::Result<FileInfo> {
        let key = key_of(&conn.path)?;
        let dir_info = |path: &str| FileInfo {
            path: path.to_string(),
            name: common::path::base(path).to_string(),
            mode: 0o755,
            is_dir: true,
            ..Default::default()
        };
        if key.is_empty() {
            return Ok(dir_info(&key));
        }
        if let Some(object) = self.objects().get(&(conn.host.clone(), key.clone())) {
            return Ok(FileInfo {
                path: key.clone(),
                name: common::path::base(&key).to_string(),
                size: object.data.len() as u64,
                mode: DEFAULT_MODE,
                mtime: object.mtime,
                is_dir: false,
                not_found: false,
            });
        }
        if self.scan(&conn.host, &dir_prefix(&key)).is_empty() {
            return Ok(FileInfo::not_found(&key));
        }
        Ok(dir_info(&key))
    }

    async fn delete(&self, conn: &Connection, recursive: bool) -> anyhow::Result<usize> {
        let key = key_of(&conn.path)?;
        let mut objects = self.objects();
        if !key.is_empty() && objects.remove(&(conn.host.clone(), key.clone())).is_some() {
            return Ok(1);
        }
        let prefix = dir_prefix(&key);
        let doomed: Vec<(String, String)> = objects
            .keys()
            .filter(|(host, object_key)| *host == conn.host && object_key.starts_with(&prefix))
            .cloned()
            .collect();
        if doomed.is_empty() {
            bail!("file not found: {}", conn);
        }
        if !recursive {
            return Err(PolicyError::RecursiveRequired.into());
        }
        for id in &doomed {
            objects.remove(id);
        }
        tracing::debug!("deleted {} objects below {}", doomed.len(), conn);
        Ok(doomed.len())
    }

    async fn list_entries_prefix(&self, host: &str, prefix: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .scan(host, prefix)
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn read_tar_stream(
        &self,
        conn: &Connection,
        opts: &FileCopyOpts,
        writer: Arc<Writer>,
        scope: CancelScope,
    ) -> anyhow::Result<()> {
        let info = self.stat(conn).await?;
        if info.not_found {
            bail!("file not found: {}", conn);
        }
        if info.is_dir && !opts.recursive {
            return Err(PolicyError::RecursiveRequired.into());
        }
        let key = info.path;
        if !info.is_dir {
            let mut source = TarSource::new(writer, common::path::parent(&key), scope);
            let result = write_object(&mut source, &key, self.get(&conn.host, &key)).await;
            return backend::finish_tar_source(source, result).await;
        }
        let prefix = dir_prefix(&key);
        let objects = self.scan(&conn.host, &prefix);
        let mut tree = common::pathtree::Tree::new(&prefix, "/");
        for (object_key, _) in &objects {
            tree.add(object_key);
        }
        let mut nodes = Vec::new();
        tree.walk(|path, children| {
            nodes.push((path.to_string(), children > 0));
            Ok::<(), anyhow::Error>(())
        })?;
        let objects: BTreeMap<String, Object> = objects.into_iter().collect();
        let mut source = TarSource::new(writer, &key, scope);
        let result = async {
            let root = EntryMeta {
                is_dir: true,
                mode: 0o755,
                ..Default::default()
            };
            source.write_header(&root, &key).await?;
            for (path, is_dir) in &nodes {
                if *is_dir {
                    source.write_header(&root, path).await?;
                } else {
                    let data = objects.get(path).map(|object| object.data.clone());
                    write_object(&mut source, path, data).await?;
                }
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;
        backend::finish_tar_source(source, result).await
    }

    async fn put_file(
        &self,
        host: &str,
        path: &str,
        size: u64,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> anyhow::Result<u64> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .with_context(|| format!("failed reading content of {path:?}"))?;
        if data.len() as u64 != size {
            bail!(
                "size mismatch for {:?}: expected {} bytes, got {}",
                path,
                size,
                data.len()
            );
        }
        self.insert(host, path, data)?;
        Ok(size)
    }

    async fn copy_file_internal(&self, host: &str, src: &str, dest: &str) -> anyhow::Result<u64> {
        let Some(data) = self.get(host, src) else {
            bail!("file not found: {}://{}/{}", MEM_SCHEME, host, src);
        };
        let size = data.len() as u64;
        self.insert(host, dest, data)?;
        Ok(size)
    }
}

async fn write_object(
    source: &mut TarSource,
    key: &str,
    data: Option<Arc<[u8]>>,
) -> anyhow::Result<()> {
    let Some(data) = data else {
        bail!("object {:?} disappeared while reading it", key);
    };
    let meta = EntryMeta {
        size: data.len() as u64,
        is_dir: false,
        mode: DEFAULT_MODE,
        mtime: now(),
    };
    source.write_header(&meta, key).await?;
    source.write_content(&data).await
}
