//! Local asset store.
//!
//! Maps [`AssetPath`]s to regular files under one namespace root. Reads are
//! range-aware and streamed; writes go to a colocated temp file and are
//! renamed into place only once complete, so readers never observe a
//! partially written asset.

pub mod mime;
pub mod range;

use crate::asset_path::{AssetPath, TEMP_SUFFIX};
use crate::error::{Result, VcServeError};
use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use range::{ByteRange, RangeSpec};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter, SeekFrom, Take};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Filesystem-backed store for one namespace.
#[derive(Clone, Debug)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    /// Canonical root; every resolved path must stay below it.
    root: PathBuf,
    temp_counter: AtomicU64,
}

/// An opened asset ready to stream.
#[derive(Debug)]
pub struct LocalAsset {
    pub content_type: &'static str,
    /// Bytes that will be streamed (the range length for partial reads).
    pub content_length: u64,
    /// Full size of the file on disk.
    pub size: u64,
    /// Resolved range, `None` for a full read.
    pub range: Option<ByteRange>,
    reader: Take<File>,
}

impl LocalAsset {
    pub fn into_stream(self) -> ReaderStream<Take<File>> {
        ReaderStream::new(self.reader)
    }
}

fn write_failed(e: impl Display) -> VcServeError {
    VcServeError::WriteFailed(e.to_string())
}

impl LocalStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).await.map_err(|e| {
            VcServeError::Config(format!("cannot create {}: {}", root.display(), e))
        })?;
        let root = fs::canonicalize(root).await.map_err(|e| {
            VcServeError::Config(format!("cannot resolve {}: {}", root.display(), e))
        })?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                temp_counter: AtomicU64::new(0),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Resolve to a regular file inside the root, following symlinks.
    async fn locate(&self, path: &AssetPath) -> Option<PathBuf> {
        let candidate = self.inner.root.join(path.to_relative_path());
        let resolved = fs::canonicalize(&candidate).await.ok()?;
        if !resolved.starts_with(&self.inner.root) {
            warn!(
                "Asset {} resolves outside store root: {}",
                path,
                resolved.display()
            );
            return None;
        }
        let meta = fs::metadata(&resolved).await.ok()?;
        meta.is_file().then_some(resolved)
    }

    pub async fn exists(&self, path: &AssetPath) -> bool {
        self.locate(path).await.is_some()
    }

    /// Open an asset for streaming, optionally restricted to a byte range.
    ///
    /// Returns `Ok(None)` when the asset is absent.
    pub async fn open_for_read(
        &self,
        path: &AssetPath,
        range: Option<RangeSpec>,
    ) -> Result<Option<LocalAsset>> {
        let Some(file_path) = self.locate(path).await else {
            return Ok(None);
        };

        let mut file = match File::open(&file_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();

        let range = range.map(|spec| spec.resolve(size)).transpose()?;
        let (offset, length) = match range {
            Some(r) => (r.start, r.byte_len()),
            None => (0, size),
        };
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }

        Ok(Some(LocalAsset {
            content_type: mime::content_type_for(path),
            content_length: length,
            size,
            range,
            reader: file.take(length),
        }))
    }

    /// Start an atomic write of `path`.
    ///
    /// The returned [`PendingWrite`] owns a temp file next to the target;
    /// nothing is visible under the final name until [`PendingWrite::commit`].
    pub async fn begin_write(&self, path: &AssetPath) -> Result<PendingWrite> {
        let target = self.inner.root.join(path.to_relative_path());
        let parent = target
            .parent()
            .ok_or_else(|| VcServeError::PathRejected(path.to_string()))?;
        fs::create_dir_all(parent).await.map_err(write_failed)?;

        let parent = fs::canonicalize(parent).await.map_err(write_failed)?;
        if !parent.starts_with(&self.inner.root) {
            return Err(VcServeError::PathRejected(path.to_string()));
        }

        let n = self.inner.temp_counter.fetch_add(1, Ordering::Relaxed);
        let name = path.file_name();
        let temp_path = parent.join(format!(
            "{}.{}.{}{}",
            name,
            std::process::id(),
            n,
            TEMP_SUFFIX
        ));
        let target_path = parent.join(name);

        let file = File::create(&temp_path).await.map_err(write_failed)?;
        debug!("Writing {} via {}", path, temp_path.display());

        Ok(PendingWrite {
            file: BufWriter::new(file),
            temp_path,
            target_path,
            written: 0,
        })
    }

    /// Consume `stream` into `path`, renaming into place only if every chunk
    /// was written. Returns the number of bytes stored.
    pub async fn write_atomically<S, E>(&self, path: &AssetPath, stream: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        let mut pending = self.begin_write(path).await?;
        let mut stream = std::pin::pin!(stream);

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    pending.abort().await;
                    return Err(write_failed(format!("source stream failed: {}", e)));
                }
            };
            if let Err(e) = pending.write(&chunk).await {
                pending.abort().await;
                return Err(e);
            }
        }

        pending.commit().await
    }

    /// Remove temp files left behind by an interrupted process.
    pub async fn sweep_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        let mut dirs = vec![self.inner.root.clone()];

        while let Some(dir) = dirs.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    dirs.push(entry.path());
                } else if file_type.is_file()
                    && entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX)
                {
                    match fs::remove_file(entry.path()).await {
                        Ok(()) => removed += 1,
                        Err(e) => warn!(
                            "Failed to remove stale temp file {}: {}",
                            entry.path().display(),
                            e
                        ),
                    }
                }
            }
        }

        Ok(removed)
    }
}

/// A cache write in progress. Dropping it without `commit` or `abort`
/// leaves the temp file for the next startup sweep.
#[derive(Debug)]
pub struct PendingWrite {
    file: BufWriter<File>,
    temp_path: PathBuf,
    target_path: PathBuf,
    written: u64,
}

impl PendingWrite {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await.map_err(write_failed)?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush, sync and rename into place. On failure the temp file is
    /// removed and any previous target is left untouched.
    pub async fn commit(mut self) -> Result<u64> {
        match finish(&mut self.file, &self.temp_path, &self.target_path).await {
            Ok(()) => Ok(self.written),
            Err(e) => {
                let _ = fs::remove_file(&self.temp_path).await;
                Err(write_failed(e))
            }
        }
    }

    /// Discard the temp file.
    pub async fn abort(self) {
        let PendingWrite {
            file, temp_path, ..
        } = self;
        drop(file);
        if let Err(e) = fs::remove_file(&temp_path).await {
            warn!("Failed to remove temp file {}: {}", temp_path.display(), e);
        }
    }
}

async fn finish(file: &mut BufWriter<File>, temp: &Path, target: &Path) -> std::io::Result<()> {
    file.flush().await?;
    file.get_ref().sync_all().await?;
    fs::rename(temp, target).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn asset(raw: &str) -> AssetPath {
        AssetPath::parse(raw).unwrap()
    }

    async fn read_all(asset: LocalAsset) -> Vec<u8> {
        let mut out = Vec::new();
        let mut stream = asset.into_stream();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    fn ok_chunks(parts: &[&'static [u8]]) -> Vec<std::result::Result<Bytes, std::io::Error>> {
        parts.iter().map(|p| Ok(Bytes::from_static(p))).collect()
    }

    #[tokio::test]
    async fn open_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("vcsky");
        let store = LocalStore::open(&root).await.unwrap();
        assert!(root.is_dir());
        assert!(store.root().is_absolute());
    }

    #[tokio::test]
    async fn missing_asset_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        assert!(!store.exists(&asset("nope.bin")).await);
        assert!(
            store
                .open_for_read(&asset("nope.bin"), None)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn directories_are_not_assets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("models")).unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        assert!(!store.exists(&asset("models")).await);
    }

    #[tokio::test]
    async fn full_read_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/main.img"), &data).unwrap();

        let store = LocalStore::open(dir.path()).await.unwrap();
        let opened = store
            .open_for_read(&asset("data/main.img"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opened.size, 70_000);
        assert_eq!(opened.content_length, 70_000);
        assert!(opened.range.is_none());
        assert_eq!(opened.content_type, mime::OCTET_STREAM);
        assert_eq!(read_all(opened).await, data);
    }

    #[tokio::test]
    async fn ranged_read_returns_slice() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("file.bin"), &data).unwrap();

        let store = LocalStore::open(dir.path()).await.unwrap();
        let range = RangeSpec::parse("bytes=100-199");
        let opened = store
            .open_for_read(&asset("file.bin"), range)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opened.content_length, 100);
        assert_eq!(opened.range.unwrap().content_range(opened.size), "bytes 100-199/1000");
        assert_eq!(read_all(opened).await, &data[100..200]);
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("small.bin"), b"abc").unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        let err = store
            .open_for_read(&asset("small.bin"), Some(RangeSpec::From { start: 10 }))
            .await
            .unwrap_err();
        assert_eq!(err, VcServeError::RangeNotSatisfiable { size: 3 });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escaping_root_is_absent() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"secret").unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("link.txt"),
        )
        .unwrap();

        let store = LocalStore::open(dir.path()).await.unwrap();
        assert!(!store.exists(&asset("link.txt")).await);
    }

    #[tokio::test]
    async fn write_atomically_materializes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let path = asset("nested/dir/file.bin");

        let written = store
            .write_atomically(&path, stream::iter(ok_chunks(&[b"hello ", b"world"])))
            .await
            .unwrap();

        assert_eq!(written, 11);
        assert_eq!(
            std::fs::read(dir.path().join("nested/dir/file.bin")).unwrap(),
            b"hello world"
        );
        assert_eq!(store.sweep_temp_files().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_target_and_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let path = asset("broken.bin");

        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
        ];
        let err = store
            .write_atomically(&path, stream::iter(chunks))
            .await
            .unwrap_err();

        assert!(matches!(err, VcServeError::WriteFailed(_)));
        assert!(!dir.path().join("broken.bin").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.bin"), b"original").unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"new")), Err(std::io::Error::other("eof"))];
        assert!(
            store
                .write_atomically(&asset("keep.bin"), stream::iter(chunks))
                .await
                .is_err()
        );
        assert_eq!(std::fs::read(dir.path().join("keep.bin")).unwrap(), b"original");
    }

    #[tokio::test]
    async fn pending_write_is_invisible_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let path = asset("big.img");

        let mut pending = store.begin_write(&path).await.unwrap();
        pending.write(b"chunk-1").await.unwrap();
        assert!(!store.exists(&path).await);

        pending.write(b"chunk-2").await.unwrap();
        assert_eq!(pending.written(), 14);
        assert_eq!(pending.commit().await.unwrap(), 14);
        assert!(store.exists(&path).await);
    }

    #[tokio::test]
    async fn sweep_removes_stale_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/x.bin.1.0.vcpart"), b"junk").unwrap();
        std::fs::write(dir.path().join("y.bin.1.1.vcpart"), b"junk").unwrap();
        std::fs::write(dir.path().join("a/keep.bin"), b"real").unwrap();

        let store = LocalStore::open(dir.path()).await.unwrap();
        assert_eq!(store.sweep_temp_files().await.unwrap(), 2);
        assert!(dir.path().join("a/keep.bin").exists());
        assert!(!dir.path().join("y.bin.1.1.vcpart").exists());
    }
}
