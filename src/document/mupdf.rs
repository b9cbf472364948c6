//! MuPDF document backend
//!
//! MuPDF documents must stay on the thread that opened them, so the handle
//! owns a dedicated backend thread holding the `mupdf::Document` and talks to
//! it over channels. Page geometry and rasterization requests are answered in
//! the order they are sent.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use flume::{Receiver, Sender};
use log::{debug, error};
use mupdf::{Colorspace, Document, Matrix, Pixmap};

use super::{DocumentError, DocumentHandle, FileResolver, OpenPage, SourceResolver, check_page};
use crate::pool::{BYTES_PER_PIXEL, PixelBuffer};
use crate::types::{PageIndex, PageSize};

impl From<mupdf::error::Error> for DocumentError {
    fn from(err: mupdf::error::Error) -> Self {
        DocumentError::Backend(err.to_string())
    }
}

enum BackendCall {
    Size {
        page: PageIndex,
        reply: Sender<Result<PageSize, DocumentError>>,
    },
    Render {
        page: PageIndex,
        target: PageSize,
        reply: Sender<Result<Vec<u8>, DocumentError>>,
    },
}

/// Document handle backed by MuPDF
pub struct MupdfDocument {
    calls: Option<Sender<BackendCall>>,
    page_count: usize,
    worker: Option<JoinHandle<()>>,
}

impl MupdfDocument {
    pub fn open(path: &Path) -> Result<Self, DocumentError> {
        let (ready_tx, ready_rx) = flume::bounded(1);
        let (calls_tx, calls_rx) = flume::unbounded();
        let owned_path = path.to_path_buf();

        let worker = std::thread::Builder::new()
            .name("folio-mupdf".into())
            .spawn(move || backend_thread(owned_path, calls_rx, ready_tx))?;

        let page_count = ready_rx
            .recv()
            .map_err(|_| DocumentError::Backend("MuPDF backend thread exited".into()))??;
        debug!("Opened {path:?} with MuPDF: {page_count} pages");

        Ok(Self {
            calls: Some(calls_tx),
            page_count,
            worker: Some(worker),
        })
    }

    fn call<T>(
        &self,
        make: impl FnOnce(Sender<Result<T, DocumentError>>) -> BackendCall,
    ) -> Result<T, DocumentError> {
        let calls = self.calls.as_ref().ok_or(DocumentError::Closed)?;
        let (reply_tx, reply_rx) = flume::bounded(1);
        calls
            .send(make(reply_tx))
            .map_err(|_| DocumentError::Closed)?;
        reply_rx.recv().map_err(|_| DocumentError::Closed)?
    }
}

impl DocumentHandle for MupdfDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn open_page(&mut self, page: PageIndex) -> Result<Box<dyn OpenPage + '_>, DocumentError> {
        check_page(page, self.page_count)?;
        let size = self.call(|reply| BackendCall::Size { page, reply })?;
        Ok(Box::new(MupdfPage {
            document: self,
            page,
            size,
        }))
    }

    fn close(&mut self) {
        self.calls = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("MuPDF backend thread panicked");
            }
        }
    }
}

impl Drop for MupdfDocument {
    fn drop(&mut self) {
        self.close();
    }
}

struct MupdfPage<'a> {
    document: &'a MupdfDocument,
    page: PageIndex,
    size: PageSize,
}

impl OpenPage for MupdfPage<'_> {
    fn size(&self) -> PageSize {
        self.size
    }

    fn render(&mut self, target: &mut PixelBuffer) -> Result<(), DocumentError> {
        let page = self.page;
        let dims = PageSize::new(target.width(), target.height());
        let pixels = self.document.call(|reply| BackendCall::Render {
            page,
            target: dims,
            reply,
        })?;

        let out = target.as_mut_slice();
        if pixels.len() != out.len() {
            return Err(DocumentError::render(page, "pixmap size mismatch"));
        }
        out.copy_from_slice(&pixels);
        Ok(())
    }
}

fn backend_thread(
    path: PathBuf,
    calls: Receiver<BackendCall>,
    ready: Sender<Result<usize, DocumentError>>,
) {
    let doc = match Document::open(path.to_string_lossy().as_ref()) {
        Ok(doc) => doc,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let page_count = match doc.page_count() {
        Ok(count) => count.max(0) as usize,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let _ = ready.send(Ok(page_count));

    for call in calls {
        match call {
            BackendCall::Size { page, reply } => {
                let _ = reply.send(page_size(&doc, page));
            }
            BackendCall::Render {
                page,
                target,
                reply,
            } => {
                let _ = reply.send(render_rgba(&doc, page, target));
            }
        }
    }
    debug!("MuPDF backend for {path:?} shut down");
}

fn page_size(doc: &Document, page: PageIndex) -> Result<PageSize, DocumentError> {
    let bounds = doc.load_page(page as i32)?.bounds()?;
    Ok(PageSize::new(
        (bounds.x1 - bounds.x0).round().max(1.0) as u32,
        (bounds.y1 - bounds.y0).round().max(1.0) as u32,
    ))
}

fn render_rgba(doc: &Document, page: PageIndex, target: PageSize) -> Result<Vec<u8>, DocumentError> {
    let loaded = doc.load_page(page as i32)?;
    let bounds = loaded.bounds()?;
    let page_width = (bounds.x1 - bounds.x0).max(1.0);
    let page_height = (bounds.y1 - bounds.y0).max(1.0);

    let transform = Matrix::new_scale(
        target.width as f32 / page_width,
        target.height as f32 / page_height,
    );
    let pixmap = loaded.to_pixmap(&transform, &Colorspace::device_rgb(), false, false)?;
    pixmap_to_rgba(&pixmap, page, target)
}

/// Copy a pixmap into a tightly packed RGBA buffer of exactly `target` size.
///
/// Rounding in MuPDF can make the pixmap a pixel larger or smaller than
/// requested; missing pixels are left white and extra ones are cropped.
fn pixmap_to_rgba(pixmap: &Pixmap, page: PageIndex, target: PageSize) -> Result<Vec<u8>, DocumentError> {
    let n = pixmap.n() as usize;
    if n < 3 {
        return Err(DocumentError::render(
            page,
            format!("unsupported pixmap format: {n} channels"),
        ));
    }

    let src_width = pixmap.width() as usize;
    let src_height = pixmap.height() as usize;
    let stride = pixmap.stride() as usize;
    let samples = pixmap.samples();
    if samples.len() < stride.saturating_mul(src_height) || src_width * n > stride {
        return Err(DocumentError::render(page, "pixmap buffer size mismatch"));
    }

    let width = target.width as usize;
    let height = target.height as usize;
    let mut out = vec![255u8; width * height * BYTES_PER_PIXEL];
    for y in 0..height.min(src_height) {
        let src_row = &samples[y * stride..y * stride + src_width * n];
        let dst_row = &mut out[y * width * BYTES_PER_PIXEL..(y + 1) * width * BYTES_PER_PIXEL];
        for (src, dst) in src_row
            .chunks_exact(n)
            .zip(dst_row.chunks_exact_mut(BYTES_PER_PIXEL))
        {
            dst[..3].copy_from_slice(&src[..3]);
            dst[3] = 255;
        }
    }
    Ok(out)
}

/// Resolver opening validated files with MuPDF
#[must_use]
pub fn resolver() -> impl SourceResolver {
    FileResolver::new(|path: &Path| {
        Ok(Box::new(MupdfDocument::open(path)?) as Box<dyn DocumentHandle>)
    })
}
