//! Procedurally generated documents
//!
//! Used by the demo binary and for benchmarking the engine without a real
//! document backend. Every page is a vertical gradient tinted by its index,
//! with a dark band whose position encodes the page number.

use super::{DocumentError, DocumentHandle, OpenPage, check_page};
use crate::pool::{BYTES_PER_PIXEL, PixelBuffer};
use crate::types::{PageIndex, PageSize};

/// A document whose pages are drawn on demand
#[derive(Debug, Clone)]
pub struct SyntheticDocument {
    pages: Vec<PageSize>,
    closed: bool,
}

impl SyntheticDocument {
    #[must_use]
    pub fn new(pages: Vec<PageSize>) -> Self {
        Self {
            pages,
            closed: false,
        }
    }

    /// `count` pages of the same size
    #[must_use]
    pub fn uniform(count: usize, size: PageSize) -> Self {
        Self::new(vec![size; count])
    }
}

impl DocumentHandle for SyntheticDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn open_page(&mut self, page: PageIndex) -> Result<Box<dyn OpenPage + '_>, DocumentError> {
        if self.closed {
            return Err(DocumentError::Closed);
        }
        check_page(page, self.pages.len())?;
        Ok(Box::new(SyntheticPage {
            page,
            size: self.pages[page],
            page_count: self.pages.len(),
        }))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

struct SyntheticPage {
    page: PageIndex,
    size: PageSize,
    page_count: usize,
}

impl OpenPage for SyntheticPage {
    fn size(&self) -> PageSize {
        self.size
    }

    fn render(&mut self, target: &mut PixelBuffer) -> Result<(), DocumentError> {
        let width = target.width() as usize;
        let height = target.height() as usize;
        if width == 0 || height == 0 {
            return Err(DocumentError::render(self.page, "empty render target"));
        }

        let tint = ((self.page * 37) % 256) as u8;
        let band_center = height * (self.page + 1) / (self.page_count + 1);
        let band_half = (height / 40).max(1);
        let stride = target.stride();

        for (y, row) in target.as_mut_slice().chunks_exact_mut(stride).enumerate() {
            let shade = (255 - (y * 96 / height)) as u8;
            let in_band = y.abs_diff(band_center) <= band_half;
            for px in row.chunks_exact_mut(BYTES_PER_PIXEL) {
                if in_band {
                    px.copy_from_slice(&[32, 32, 48, 255]);
                } else {
                    px.copy_from_slice(&[shade, shade.saturating_sub(tint / 4), tint, 255]);
                }
            }
        }
        Ok(())
    }
}
