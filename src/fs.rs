//! Static file serving with a reference-counted handle cache.
//!
//! Compiled file metadata (size, mime, mtime, compressed sidecar state) is
//! cached per path. Every response streaming a file holds a reader
//! reference; the cache sweeper only releases an entry once it has expired
//! *and* no reader remains.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant, SystemTime};

use flate2::write::GzEncoder;
use flate2::Compression;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, ReadBuf};
use tracing::{debug, trace, warn};

use crate::body::Body;
use crate::common::BoxFuture;
use crate::context::{Context, Handler, HandlerFn};
use crate::headers;

/// Options for a filesystem handler.
#[derive(Clone, Debug)]
pub struct FsOptions {
    pub root: PathBuf,
    /// File names probed when the path resolves to a directory.
    pub index_names: Vec<String>,
    pub accept_byte_range: bool,
    /// Serve gzip-compressed sidecar files to clients that accept them,
    /// creating the sidecars on first demand.
    pub compress: bool,
    /// Suffix of compressed sidecar files, created adjacent to originals.
    pub compressed_file_suffix: String,
    pub cache_duration: Duration,
}

impl Default for FsOptions {
    fn default() -> FsOptions {
        FsOptions {
            root: PathBuf::from("."),
            index_names: vec!["index.html".to_owned()],
            accept_byte_range: true,
            compress: false,
            compressed_file_suffix: ".gale.gz".to_owned(),
            cache_duration: Duration::from_secs(10),
        }
    }
}

struct FileHandle {
    path: PathBuf,
    mime: String,
    content_length: u64,
    last_modified: Option<SystemTime>,
    /// Serving a compressed sidecar; adds `Content-Encoding: gzip`.
    compressed: bool,
    acquired_at: Instant,
}

struct CacheSlot {
    handle: FileHandle,
    /// Responses currently streaming from this entry.
    readers: Arc<AtomicI64>,
}

/// Serves files under a root directory.
pub struct FsHandler {
    options: FsOptions,
    cache: Mutex<HashMap<String, CacheSlot>>,
    sweeper_started: AtomicBool,
}

impl FsHandler {
    pub fn new(options: FsOptions) -> Arc<FsHandler> {
        Arc::new(FsHandler {
            options,
            cache: Mutex::new(HashMap::new()),
            sweeper_started: AtomicBool::new(false),
        })
    }

    /// A route handler serving the `*filepath` parameter (or, absent one,
    /// the request path) under the configured root.
    pub fn handler(self: &Arc<FsHandler>) -> Handler {
        self.start_sweeper();
        Arc::new(FsRoute { fs: self.clone() })
    }

    fn start_sweeper(self: &Arc<FsHandler>) {
        if self
            .sweeper_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = self.options.cache_duration / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(fs) => fs.sweep(),
                    None => return,
                }
            }
        });
    }

    /// Releases expired cache entries, deferring any with active readers.
    fn sweep(&self) {
        let now = Instant::now();
        let max_age = self.options.cache_duration;
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.retain(|path, slot| {
            let expired = now.duration_since(slot.handle.acquired_at) > max_age;
            if !expired {
                return true;
            }
            let readers = slot.readers.load(Ordering::Acquire);
            if readers > 0 {
                trace!("deferring release of {:?}: {} readers", path, readers);
                return true;
            }
            trace!("releasing cached file handle {:?}", path);
            false
        });
    }

    async fn serve(&self, cx: &mut Context) {
        let rel = if !cx.param("filepath").is_empty() {
            cx.param("filepath").to_owned()
        } else {
            cx.request().path().trim_start_matches('/').to_owned()
        };
        if !is_path_safe(&rel) {
            cx.response_mut().set_status(StatusCode::BAD_REQUEST);
            return;
        }

        let wants_gzip = self.options.compress
            && cx
                .request()
                .headers()
                .get_str(headers::ACCEPT_ENCODING)
                .split(',')
                .any(|enc| enc.trim().eq_ignore_ascii_case("gzip"));

        let (handle, readers) = match self.lookup(&rel, wants_gzip).await {
            Ok(found) => found,
            Err(status) => {
                cx.response_mut().set_status(status);
                return;
            }
        };

        // Conditional request.
        if let Some(modified) = handle.last_modified {
            let since = cx.request().headers().get_str(headers::IF_MODIFIED_SINCE);
            if !since.is_empty() {
                if let Ok(since) = httpdate::parse_http_date(since) {
                    if !newer_than(modified, since) {
                        cx.response_mut().set_status(StatusCode::NOT_MODIFIED);
                        return;
                    }
                }
            }
        }

        let total = handle.content_length;
        let mut start = 0u64;
        let mut end = total.saturating_sub(1);
        let mut partial = false;
        if self.options.accept_byte_range {
            cx.response_mut()
                .headers_mut()
                .set(headers::ACCEPT_RANGES, "bytes");
            let range = cx.request().headers().get_str(headers::RANGE).to_owned();
            if !range.is_empty() {
                match parse_range(&range, total) {
                    Some((s, e)) => {
                        start = s;
                        end = e;
                        partial = true;
                    }
                    None => {
                        let resp = cx.response_mut();
                        resp.set_status(StatusCode::RANGE_NOT_SATISFIABLE);
                        resp.headers_mut().set(
                            headers::CONTENT_RANGE,
                            format!("bytes */{}", total),
                        );
                        return;
                    }
                }
            }
        }

        let mut file = match tokio::fs::File::open(&handle.path).await {
            Ok(file) => file,
            Err(err) => {
                warn!("open {:?} failed: {}", handle.path, err);
                cx.response_mut()
                    .set_status(StatusCode::INTERNAL_SERVER_ERROR);
                return;
            }
        };
        if partial && start > 0 {
            if file.seek(SeekFrom::Start(start)).await.is_err() {
                cx.response_mut()
                    .set_status(StatusCode::INTERNAL_SERVER_ERROR);
                return;
            }
        }

        let len = if total == 0 { 0 } else { end - start + 1 };
        let resp = cx.response_mut();
        resp.set_content_type(&handle.mime);
        if let Some(modified) = handle.last_modified {
            resp.headers_mut()
                .set(headers::LAST_MODIFIED, httpdate::fmt_http_date(modified));
        }
        if handle.compressed {
            resp.headers_mut().set(headers::CONTENT_ENCODING, "gzip");
        }
        if partial {
            resp.set_status(StatusCode::PARTIAL_CONTENT);
            resp.headers_mut().set(
                headers::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, total),
            );
        }

        readers.fetch_add(1, Ordering::AcqRel);
        let reader = CountedReader {
            inner: file.take(len),
            readers,
        };
        resp.set_body(Body::sized_reader(reader, len));
    }

    /// Looks up or builds the cached handle for `rel`, preparing the gzip
    /// sidecar when asked.
    async fn lookup(
        &self,
        rel: &str,
        wants_gzip: bool,
    ) -> Result<(ArcHandle, Arc<AtomicI64>), StatusCode> {
        let cache_key = if wants_gzip {
            format!("gz:{}", rel)
        } else {
            rel.to_owned()
        };
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = cache.get(&cache_key) {
                if slot.handle.acquired_at.elapsed() <= self.options.cache_duration {
                    return Ok((slot.handle.snapshot(), slot.readers.clone()));
                }
            }
        }

        let mut path = self.options.root.join(rel);
        let mut meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| StatusCode::NOT_FOUND)?;
        if meta.is_dir() {
            let mut found = None;
            for index in &self.options.index_names {
                let candidate = path.join(index);
                if let Ok(m) = tokio::fs::metadata(&candidate).await {
                    if m.is_file() {
                        found = Some((candidate, m));
                        break;
                    }
                }
            }
            match found {
                Some((p, m)) => {
                    path = p;
                    meta = m;
                }
                None => return Err(StatusCode::NOT_FOUND),
            }
        }

        let mime = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_owned();
        let last_modified = meta.modified().ok();
        let mut compressed = false;
        let mut content_length = meta.len();

        if wants_gzip && compressible(&mime) {
            match self
                .ensure_sidecar(&path, last_modified)
                .await
            {
                Ok((sidecar, len)) => {
                    path = sidecar;
                    content_length = len;
                    compressed = true;
                }
                Err(err) => {
                    debug!("sidecar for {:?} unavailable: {}", path, err);
                }
            }
        }

        let handle = FileHandle {
            path,
            mime,
            content_length,
            last_modified,
            compressed,
            acquired_at: Instant::now(),
        };
        let snapshot = handle.snapshot();
        let readers = {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            match cache.get_mut(&cache_key) {
                Some(slot) => {
                    slot.handle = handle;
                    slot.readers.clone()
                }
                None => {
                    let readers = Arc::new(AtomicI64::new(0));
                    cache.insert(
                        cache_key,
                        CacheSlot {
                            handle,
                            readers: readers.clone(),
                        },
                    );
                    readers
                }
            }
        };
        Ok((snapshot, readers))
    }

    /// Creates (or reuses) the gzip sidecar next to `path`.
    async fn ensure_sidecar(
        &self,
        path: &Path,
        source_modified: Option<SystemTime>,
    ) -> std::io::Result<(PathBuf, u64)> {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(&self.options.compressed_file_suffix);
        let sidecar = PathBuf::from(sidecar);

        if let Ok(meta) = tokio::fs::metadata(&sidecar).await {
            let fresh = match (meta.modified().ok(), source_modified) {
                (Some(side), Some(orig)) => side >= orig,
                _ => true,
            };
            if fresh {
                return Ok((sidecar, meta.len()));
            }
        }

        debug!("compressing {:?} -> {:?}", path, sidecar);
        let raw = tokio::fs::read(path).await?;
        let compressed = tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&raw)?;
            enc.finish()
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        let len = compressed.len() as u64;
        tokio::fs::write(&sidecar, compressed).await?;
        Ok((sidecar, len))
    }
}

/// An owned copy of the cacheable handle fields.
struct ArcHandle {
    path: PathBuf,
    mime: String,
    content_length: u64,
    last_modified: Option<SystemTime>,
    compressed: bool,
}

impl FileHandle {
    fn snapshot(&self) -> ArcHandle {
        ArcHandle {
            path: self.path.clone(),
            mime: self.mime.clone(),
            content_length: self.content_length,
            last_modified: self.last_modified,
            compressed: self.compressed,
        }
    }
}

struct FsRoute {
    fs: Arc<FsHandler>,
}

impl HandlerFn for FsRoute {
    fn call<'a>(&'a self, cx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.fs.serve(cx).await })
    }
}

/// A body reader that releases its cache reference when dropped.
struct CountedReader {
    inner: tokio::io::Take<tokio::fs::File>,
    readers: Arc<AtomicI64>,
}

impl AsyncRead for CountedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for CountedReader {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Rejects traversal outside the root.
fn is_path_safe(rel: &str) -> bool {
    !rel.split('/').any(|seg| seg == "..") && !rel.contains('\0')
}

fn newer_than(modified: SystemTime, since: SystemTime) -> bool {
    // HTTP dates have one-second resolution.
    match modified.duration_since(since) {
        Ok(delta) => delta >= Duration::from_secs(1),
        Err(_) => false,
    }
}

fn compressible(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime == "application/json"
        || mime == "application/javascript"
        || mime == "image/svg+xml"
}

/// Parses a single-range `Range` header against `total` bytes.
///
/// Returns the inclusive byte window, or `None` when unsatisfiable.
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let ranges = value.strip_prefix("bytes=")?;
    let mut parts = ranges.splitn(2, '-');
    let start = parts.next()?.trim();
    let end = parts.next()?.trim();
    if total == 0 {
        return None;
    }
    match (start.is_empty(), end.is_empty()) {
        // "-N": the last N bytes.
        (true, false) => {
            let n: u64 = end.parse().ok()?;
            if n == 0 {
                return None;
            }
            let n = n.min(total);
            Some((total - n, total - 1))
        }
        // "N-": from N to the end.
        (false, true) => {
            let s: u64 = start.parse().ok()?;
            if s >= total {
                return None;
            }
            Some((s, total - 1))
        }
        (false, false) => {
            let s: u64 = start.parse().ok()?;
            let e: u64 = end.parse().ok()?;
            if s > e || s >= total {
                return None;
            }
            Some((s, e.min(total - 1)))
        }
        (true, true) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range("bytes=0-4", 10), Some((0, 4)));
        assert_eq!(parse_range("bytes=5-", 10), Some((5, 9)));
        assert_eq!(parse_range("bytes=-3", 10), Some((7, 9)));
        assert_eq!(parse_range("bytes=0-99", 10), Some((0, 9)));
        assert_eq!(parse_range("bytes=10-", 10), None);
        assert_eq!(parse_range("bytes=4-2", 10), None);
        assert_eq!(parse_range("bytes=-", 10), None);
        assert_eq!(parse_range("bites=0-4", 10), None);
        assert_eq!(parse_range("bytes=-0", 10), None);
    }

    #[test]
    fn path_safety() {
        assert!(is_path_safe("a/b/c.txt"));
        assert!(is_path_safe(""));
        assert!(!is_path_safe("../etc/passwd"));
        assert!(!is_path_safe("a/../../b"));
    }

    #[test]
    fn compressible_mimes() {
        assert!(compressible("text/html"));
        assert!(compressible("application/json"));
        assert!(!compressible("image/png"));
    }

    #[tokio::test]
    async fn lookup_caches_and_counts_readers() {
        let dir = std::env::temp_dir().join(format!("gale-fs-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("hello.txt"), b"hello world")
            .await
            .unwrap();

        let fs = FsHandler::new(FsOptions {
            root: dir.clone(),
            cache_duration: Duration::from_secs(60),
            ..FsOptions::default()
        });

        let (handle, readers) = fs.lookup("hello.txt", false).await.unwrap();
        assert_eq!(handle.content_length, 11);
        assert_eq!(handle.mime, "text/plain");
        assert_eq!(readers.load(Ordering::Acquire), 0);

        readers.fetch_add(1, Ordering::AcqRel);
        // Expired entries with readers survive the sweep.
        {
            let mut cache = fs.cache.lock().unwrap();
            for slot in cache.values_mut() {
                slot.handle.acquired_at = Instant::now() - Duration::from_secs(3600);
            }
        }
        fs.sweep();
        assert_eq!(fs.cache.lock().unwrap().len(), 1);

        readers.fetch_sub(1, Ordering::AcqRel);
        fs.sweep();
        assert_eq!(fs.cache.lock().unwrap().len(), 0);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let fs = FsHandler::new(FsOptions {
            root: std::env::temp_dir(),
            ..FsOptions::default()
        });
        let err = fs
            .lookup("definitely-not-here-gale.txt", false)
            .await
            .err();
        assert_eq!(err, Some(StatusCode::NOT_FOUND));
    }
}
