//! Persistent tier: rendered pages stored as PNG files
//!
//! Layout under the tier root:
//!
//! ```text
//! <root>/<md5(document identity)>/<page>.png
//! <root>/<md5(document identity)>/.last_used
//! ```
//!
//! Paths depend only on the document identity and page index, so a later
//! session for the same document finds the pages again. The tier keeps a
//! bounded number of documents and evicts whole documents, least recently
//! used first.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::pool::PixelBuffer;
use crate::types::{PageImage, PageIndex};

const STAMP_FILE: &str = ".last_used";
const PAGE_EXTENSION: &str = "png";

/// Errors from the persistent tier
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O: {0}")]
    Io(#[from] io::Error),

    #[error("cache image codec: {0}")]
    Codec(#[from] image::ImageError),

    #[error("cached page {page} has inconsistent pixel data")]
    Corrupt { page: PageIndex },
}

/// Directory name for a document identity
#[must_use]
pub fn document_key(identity: &str) -> String {
    format!("{:x}", md5::compute(identity.as_bytes()))
}

/// Strictly increasing recency stamp, even for writes within one clock tick
fn next_stamp() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// On-disk page store keyed by (document identity, page index)
#[derive(Debug, Clone)]
pub struct DiskTier {
    root: PathBuf,
    max_documents: usize,
}

impl DiskTier {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, max_documents: usize) -> Self {
        Self {
            root: root.into(),
            max_documents: max_documents.max(1),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_dir(&self, identity: &str) -> PathBuf {
        self.root.join(document_key(identity))
    }

    /// File a page of a document is stored in
    #[must_use]
    pub fn page_path(&self, identity: &str, page: PageIndex) -> PathBuf {
        self.document_dir(identity)
            .join(format!("{page}.{PAGE_EXTENSION}"))
    }

    #[must_use]
    pub fn contains(&self, identity: &str, page: PageIndex) -> bool {
        self.page_path(identity, page).is_file()
    }

    /// Load a stored page. `Ok(None)` when the page was never stored.
    pub fn load(&self, identity: &str, page: PageIndex) -> Result<Option<PageImage>, CacheError> {
        let path = self.page_path(identity, page);
        if !path.is_file() {
            return Ok(None);
        }

        let decoded = image::open(&path)?.into_rgba8();
        let (width, height) = decoded.dimensions();
        let pixels = decoded.into_raw();
        if pixels.len() != crate::pool::byte_len(width, height) {
            return Err(CacheError::Corrupt { page });
        }

        self.touch(&self.document_dir(identity))?;
        Ok(Some(PageImage::new(
            page,
            PixelBuffer::detached(width, height, pixels),
        )))
    }

    /// Write a page, evicting old documents if this one is new
    pub fn store(&self, identity: &str, image: &PageImage) -> Result<(), CacheError> {
        let dir = self.document_dir(identity);
        let new_document = !dir.is_dir();
        fs::create_dir_all(&dir)?;

        let path = self.page_path(identity, image.page());
        let partial = path.with_extension("partial");
        image::save_buffer_with_format(
            &partial,
            image.pixels(),
            image.width(),
            image.height(),
            image::ColorType::Rgba8,
            image::ImageFormat::Png,
        )?;
        fs::rename(&partial, &path)?;
        self.touch(&dir)?;

        if new_document {
            self.enforce_document_limit(&dir)?;
        }
        Ok(())
    }

    pub fn remove_page(&self, identity: &str, page: PageIndex) -> Result<(), CacheError> {
        match fs::remove_file(self.page_path(identity, page)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove_document(&self, identity: &str) -> Result<(), CacheError> {
        remove_dir_if_exists(&self.document_dir(identity))
    }

    /// Remove every stored document
    pub fn clear(&self) -> Result<(), CacheError> {
        for dir in self.document_dirs()? {
            remove_dir_if_exists(&dir)?;
        }
        Ok(())
    }

    /// Document directories, least recently used first
    pub fn documents(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut stamped: Vec<(u64, PathBuf)> = self
            .document_dirs()?
            .into_iter()
            .map(|dir| (read_stamp(&dir), dir))
            .collect();
        stamped.sort();
        Ok(stamped.into_iter().map(|(_, dir)| dir).collect())
    }

    fn document_dirs(&self) -> Result<Vec<PathBuf>, CacheError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        Ok(dirs)
    }

    fn touch(&self, dir: &Path) -> Result<(), CacheError> {
        fs::write(dir.join(STAMP_FILE), next_stamp().to_string())?;
        Ok(())
    }

    fn enforce_document_limit(&self, keep: &Path) -> Result<(), CacheError> {
        let documents = self.documents()?;
        let excess = documents.len().saturating_sub(self.max_documents);
        for dir in documents.iter().filter(|d| d.as_path() != keep).take(excess) {
            debug!("Evicting cached document {dir:?}");
            if let Err(e) = remove_dir_if_exists(dir) {
                warn!("Failed to evict cached document {dir:?}: {e}");
            }
        }
        Ok(())
    }
}

fn read_stamp(dir: &Path) -> u64 {
    fs::read_to_string(dir.join(STAMP_FILE))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn remove_dir_if_exists(dir: &Path) -> Result<(), CacheError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
