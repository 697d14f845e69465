//! Static file controller with a bounded in-memory cache

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::config::StaticFilesConfig;
use crate::http::Response;
use crate::server::{RequestHandler, ServiceParams};

/// Read granularity for streaming files into the response
const READ_CHUNK_SIZE: usize = 65_536;

struct CacheEntry {
    document: Vec<u8>,
    filename: String,
    created: Instant,
}

struct StaticInner {
    config: StaticFilesConfig,
    cache: DashMap<String, CacheEntry>,
    cache_cost: AtomicUsize,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

/// Request handler serving files from a document root.
///
/// Files up to `max_cached_file_size` are kept in an in-memory cache with a
/// total budget of `cache_size` bytes; entries expire after `cache_time`.
/// Larger files are streamed in 64 KiB chunks. Paths trying to escape the
/// docroot are refused, and directories fall back to their `index.html`.
pub struct StaticFileController {
    inner: Arc<StaticInner>,
}

impl StaticFileController {
    /// Create a controller for the configured docroot
    #[must_use]
    pub fn new(config: StaticFilesConfig) -> Self {
        debug!(
            "static files: docroot={}, encoding={}, max_age={}",
            config.path.display(),
            config.encoding,
            config.max_age
        );
        Self {
            inner: Arc::new(StaticInner {
                config,
                cache: DashMap::new(),
                cache_cost: AtomicUsize::new(0),
                hits: AtomicUsize::new(0),
                misses: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of cache hits served
    #[must_use]
    pub fn cache_hits(&self) -> usize {
        self.inner.hits.load(Ordering::Relaxed)
    }

    /// Number of cache misses
    #[must_use]
    pub fn cache_misses(&self) -> usize {
        self.inner.misses.load(Ordering::Relaxed)
    }

    /// Bytes currently held in the cache
    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        self.inner.cache_cost.load(Ordering::Relaxed)
    }
}

impl RequestHandler for StaticFileController {
    fn service(&self, params: ServiceParams) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.handle(&params).await;
            params.finish().await;
        });
    }
}

impl StaticInner {
    async fn handle(&self, params: &ServiceParams) {
        let path = params.request.path().to_string();
        let response = &params.response;

        if let Some(document) = self.cache_lookup(&path, response) {
            let _ = response.write(&document, false).await;
            return;
        }

        // Forbid access to files outside the docroot
        if path.contains("/..") || path.contains("\\..") {
            warn!("detected forbidden characters in path {path}");
            response.set_status(403, "forbidden");
            let _ = response.write(b"403 forbidden", true).await;
            return;
        }

        let mut file_path = self.config.path.join(path.trim_start_matches('/'));
        if is_dir(&file_path).await {
            file_path.push("index.html");
        }

        debug!("open file {}", file_path.display());
        match tokio::fs::File::open(&file_path).await {
            Ok(file) => {
                self.stream_file(file, &file_path, &path, response).await;
            }
            Err(_) if tokio::fs::metadata(&file_path).await.is_ok() => {
                warn!(
                    "cannot open existing file {} for reading",
                    file_path.display()
                );
                response.set_status(403, "forbidden");
                let _ = response.write(b"403 forbidden", true).await;
            }
            Err(_) => {
                response.set_status(404, "not found");
                let _ = response.write(b"404 not found", true).await;
            }
        }
    }

    /// Serve from the cache. Returns a copy of the document so eviction can
    /// proceed while the response is still being written.
    fn cache_lookup(&self, path: &str, response: &Response) -> Option<Vec<u8>> {
        let entry = self.cache.get(path)?;
        let lifetime = Duration::from_millis(self.config.cache_time);
        if self.config.cache_time != 0 && entry.created.elapsed() > lifetime {
            let size = entry.document.len();
            drop(entry);
            self.cache.remove(path);
            self.cache_cost.fetch_sub(size, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!("cache hit for {path}");
        let document = entry.document.clone();
        let filename = entry.filename.clone();
        drop(entry);

        self.set_content_type(&filename, response);
        self.set_cache_control(response);
        Some(document)
    }

    async fn stream_file(
        &self,
        mut file: tokio::fs::File,
        file_path: &Path,
        cache_key: &str,
        response: &Response,
    ) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("cache miss for {cache_key}");

        let filename = file_path.to_string_lossy().into_owned();
        self.set_content_type(&filename, response);
        self.set_cache_control(response);

        let size = file.metadata().await.map(|m| m.len()).unwrap_or(u64::MAX);
        let cacheable = size <= self.config.max_cached_file_size as u64;
        let mut document = Vec::new();

        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if response.write(&buf[..n], false).await.is_err() {
                        return;
                    }
                    if cacheable {
                        document.extend_from_slice(&buf[..n]);
                    }
                }
                Err(e) => {
                    warn!("error reading {}: {e}", file_path.display());
                    return;
                }
            }
        }

        if cacheable {
            self.cache_insert(cache_key, filename, document);
        }
    }

    fn cache_insert(&self, path: &str, filename: String, document: Vec<u8>) {
        let size = document.len();
        if self.cache_cost.load(Ordering::Relaxed) + size > self.config.cache_size {
            self.evict_expired();
        }
        if self.cache_cost.load(Ordering::Relaxed) + size > self.config.cache_size {
            debug!("cache budget exhausted, not caching {path}");
            return;
        }

        let old = self.cache.insert(
            path.to_string(),
            CacheEntry {
                document,
                filename,
                created: Instant::now(),
            },
        );
        if let Some(old) = old {
            self.cache_cost
                .fetch_sub(old.document.len(), Ordering::Relaxed);
        }
        self.cache_cost.fetch_add(size, Ordering::Relaxed);
    }

    fn evict_expired(&self) {
        if self.config.cache_time == 0 {
            return;
        }
        let lifetime = Duration::from_millis(self.config.cache_time);
        self.cache.retain(|_, entry| {
            if entry.created.elapsed() > lifetime {
                self.cache_cost
                    .fetch_sub(entry.document.len(), Ordering::Relaxed);
                false
            } else {
                true
            }
        });
    }

    fn set_cache_control(&self, response: &Response) {
        response.set_header(
            "Cache-Control",
            format!("max-age={}", self.config.max_age / 1000),
        );
    }

    fn set_content_type(&self, filename: &str, response: &Response) {
        let content_type = match filename.rsplit_once('.').map(|(_, ext)| ext) {
            Some("png") => "image/png".to_string(),
            Some("jpg" | "jpeg") => "image/jpeg".to_string(),
            Some("gif") => "image/gif".to_string(),
            Some("pdf") => "application/pdf".to_string(),
            Some("txt") => format!("text/plain; charset={}", self.config.encoding),
            Some("html" | "htm") => format!("text/html; charset={}", self.config.encoding),
            Some("css") => "text/css".to_string(),
            Some("js") => "text/javascript".to_string(),
            Some("svg") => "image/svg+xml".to_string(),
            Some("woff") => "font/woff".to_string(),
            Some("woff2") => "font/woff2".to_string(),
            Some("ttf") => "application/x-font-ttf".to_string(),
            Some("eot") => "application/vnd.ms-fontobject".to_string(),
            Some("otf") => "application/font-otf".to_string(),
            Some("json") => "application/json".to_string(),
            Some("xml") => "text/xml".to_string(),
            _ => {
                debug!("unknown MIME type for filename {filename}");
                return;
            }
        };
        response.set_header("Content-Type", content_type);
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

impl std::fmt::Debug for StaticFileController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticFileController")
            .field("docroot", &self.inner.config.path)
            .field("cached_bytes", &self.cached_bytes())
            .finish()
    }
}
