//! Instrumented document handle for tests
//!
//! [`FakeDocument`] records every call made into it through a shared
//! [`FakeProbe`], can fail chosen pages, and can hold a page mid-render until
//! the test releases it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use flume::{Receiver, Sender};

use crate::document::{DocumentError, DocumentHandle, OpenPage};
use crate::pool::PixelBuffer;
use crate::types::{PageIndex, PageSize};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct GateHalf {
    entered: Sender<()>,
    release: Receiver<()>,
}

/// Test side of a held page
pub struct PageGate {
    entered: Receiver<()>,
    release: Option<Sender<()>>,
}

impl PageGate {
    /// Wait until a render of the held page has started
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        self.entered.recv_timeout(timeout).is_ok()
    }

    /// Let the held render finish
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(());
        }
    }
}

/// Counters and switches shared between a test and its [`FakeDocument`]
#[derive(Default)]
pub struct FakeProbe {
    opens: AtomicUsize,
    renders: AtomicUsize,
    dimension_reads: AtomicUsize,
    renders_by_page: Mutex<HashMap<PageIndex, usize>>,
    failing: Mutex<HashSet<PageIndex>>,
    gates: Mutex<HashMap<PageIndex, GateHalf>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    closed: AtomicBool,
}

impl FakeProbe {
    /// Every call into the handle, of any kind
    pub fn calls(&self) -> usize {
        self.opens() + self.renders() + self.dimension_reads()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn dimension_reads(&self) -> usize {
        self.dimension_reads.load(Ordering::SeqCst)
    }

    pub fn renders_of(&self, page: PageIndex) -> usize {
        lock(&self.renders_by_page).get(&page).copied().unwrap_or(0)
    }

    /// Most operations ever observed running at the same time
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make every render of `page` fail
    pub fn fail_page(&self, page: PageIndex) {
        lock(&self.failing).insert(page);
    }

    /// Block the next render of `page` until the returned gate is released
    /// or dropped
    pub fn hold_page(&self, page: PageIndex) -> PageGate {
        let (entered_tx, entered_rx) = flume::bounded(1);
        let (release_tx, release_rx) = flume::bounded(1);
        lock(&self.gates).insert(
            page,
            GateHalf {
                entered: entered_tx,
                release: release_rx,
            },
        );
        PageGate {
            entered: entered_rx,
            release: Some(release_tx),
        }
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Document handle that draws each page as a solid fill of its index
pub struct FakeDocument {
    pages: Vec<PageSize>,
    probe: Arc<FakeProbe>,
}

impl FakeDocument {
    pub fn new(pages: Vec<PageSize>) -> (Self, Arc<FakeProbe>) {
        let probe = Arc::new(FakeProbe::default());
        (
            Self {
                pages,
                probe: Arc::clone(&probe),
            },
            probe,
        )
    }

    pub fn uniform(count: usize, size: PageSize) -> (Self, Arc<FakeProbe>) {
        Self::new(vec![size; count])
    }

    /// Boxed handle plus its probe, ready for a session
    pub fn boxed(count: usize, size: PageSize) -> (Box<dyn DocumentHandle>, Arc<FakeProbe>) {
        let (doc, probe) = Self::uniform(count, size);
        (Box::new(doc), probe)
    }
}

/// Fill byte a page is drawn with
pub fn fill_byte(page: PageIndex) -> u8 {
    (page % 251) as u8 + 1
}

impl DocumentHandle for FakeDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn open_page(&mut self, page: PageIndex) -> Result<Box<dyn OpenPage + '_>, DocumentError> {
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        if self.probe.is_closed() {
            return Err(DocumentError::Closed);
        }
        let size = *self
            .pages
            .get(page)
            .ok_or(DocumentError::PageOutOfRange {
                page,
                page_count: self.pages.len(),
            })?;
        Ok(Box::new(FakePage {
            page,
            size,
            probe: &self.probe,
        }))
    }

    fn close(&mut self) {
        self.probe.closed.store(true, Ordering::SeqCst);
    }
}

struct FakePage<'a> {
    page: PageIndex,
    size: PageSize,
    probe: &'a FakeProbe,
}

impl OpenPage for FakePage<'_> {
    fn size(&self) -> PageSize {
        self.probe.dimension_reads.fetch_add(1, Ordering::SeqCst);
        self.size
    }

    fn render(&mut self, target: &mut PixelBuffer) -> Result<(), DocumentError> {
        self.probe.enter();
        self.probe.renders.fetch_add(1, Ordering::SeqCst);
        *lock(&self.probe.renders_by_page).entry(self.page).or_default() += 1;

        let gate = lock(&self.probe.gates).remove(&self.page);
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            // returns on release or when the test drops the gate
            let _ = gate.release.recv();
        }

        let result = if lock(&self.probe.failing).contains(&self.page) {
            Err(DocumentError::render(self.page, "injected failure"))
        } else {
            target.as_mut_slice().fill(fill_byte(self.page));
            Ok(())
        };
        self.probe.leave();
        result
    }
}
