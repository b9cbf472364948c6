//! Document sources and their resolution into handles

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use log::{debug, error};

use super::{DocumentError, DocumentHandle};

/// Bytes every accepted document must contain near its start
pub const SIGNATURE: &[u8] = b"%PDF";

/// How far into the file the signature is searched for
pub const SIGNATURE_WINDOW: usize = 1024;

/// Where a document comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DocumentSource {
    /// A file on the local filesystem
    File(PathBuf),
    /// A named asset inside a bundled asset directory
    Asset { root: PathBuf, name: String },
    /// A local copy of remote content, produced by a content fetcher
    Fetched { locator: String, path: PathBuf },
}

impl DocumentSource {
    /// Local path the document is read from
    #[must_use]
    pub fn path(&self) -> PathBuf {
        match self {
            DocumentSource::File(path) | DocumentSource::Fetched { path, .. } => path.clone(),
            DocumentSource::Asset { root, name } => root.join(name),
        }
    }

    /// Cache identity of the document.
    ///
    /// Files and assets are identified by file name; fetched content by a
    /// hash of its locator so that query strings and long URLs stay usable
    /// as directory names.
    #[must_use]
    pub fn identity(&self) -> String {
        match self {
            DocumentSource::File(path) => file_name(path),
            DocumentSource::Asset { name, .. } => file_name(Path::new(name)),
            DocumentSource::Fetched { locator, .. } => {
                format!("{:x}.pdf", md5::compute(locator.as_bytes()))
            }
        }
    }

    fn check(&self) -> Result<(), DocumentError> {
        if let DocumentSource::Asset { name, .. } = self {
            let escapes = Path::new(name)
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
            if name.is_empty() || escapes {
                return Err(DocumentError::InvalidSource(format!(
                    "asset name {name:?} must be a relative path inside the asset root"
                )));
            }
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Turns a [`DocumentSource`] into an open, validated [`DocumentHandle`]
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, source: &DocumentSource) -> Result<Box<dyn DocumentHandle>, DocumentError>;
}

/// Resolver for file-backed sources: validates the signature, opens the file
/// with a backend-specific function and insists on at least one page.
pub struct FileResolver<F> {
    open: F,
}

impl<F> FileResolver<F>
where
    F: Fn(&Path) -> Result<Box<dyn DocumentHandle>, DocumentError> + Send + Sync,
{
    pub fn new(open: F) -> Self {
        Self { open }
    }
}

impl<F> SourceResolver for FileResolver<F>
where
    F: Fn(&Path) -> Result<Box<dyn DocumentHandle>, DocumentError> + Send + Sync,
{
    fn resolve(&self, source: &DocumentSource) -> Result<Box<dyn DocumentHandle>, DocumentError> {
        source.check()?;
        let path = source.path();
        validate_signature(&path)?;
        let handle = (self.open)(&path)?;
        ensure_pages(handle.as_ref())?;
        Ok(handle)
    }
}

/// Offset of the signature within `bytes`, if present
#[must_use]
pub fn find_signature(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(SIGNATURE.len())
        .position(|window| window == SIGNATURE)
}

/// Check that a file exists and carries the signature within its first
/// [`SIGNATURE_WINDOW`] bytes
pub fn validate_signature(path: &Path) -> Result<(), DocumentError> {
    let invalid = || DocumentError::InvalidSignature {
        path: path.display().to_string(),
    };

    let file = File::open(path)?;
    if file.metadata()?.len() < SIGNATURE.len() as u64 {
        error!("Validation failed: {path:?} is too small");
        return Err(invalid());
    }

    let mut head = Vec::with_capacity(SIGNATURE_WINDOW);
    file.take(SIGNATURE_WINDOW as u64).read_to_end(&mut head)?;
    match find_signature(&head) {
        Some(offset) => {
            debug!("Signature found at byte offset {offset} in {path:?}");
            Ok(())
        }
        None => {
            error!("Validation failed: signature not found in first {SIGNATURE_WINDOW} bytes of {path:?}");
            Err(invalid())
        }
    }
}

/// Reject handles that expose no pages
pub fn ensure_pages(handle: &dyn DocumentHandle) -> Result<(), DocumentError> {
    if handle.page_count() == 0 {
        return Err(DocumentError::NoPages);
    }
    Ok(())
}
