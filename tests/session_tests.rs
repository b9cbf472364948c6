use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use folio::cache::CacheStrategy;
use folio::document::{DocumentError, DocumentHandle, DocumentSource, FileResolver};
use folio::events::{ChannelSink, NullSink, SessionEvent, drain};
use folio::render::{Priority, RenderError};
use folio::session::{DocumentSession, SessionError, SessionHost, SessionOptions};
use folio::test_utils::FakeDocument;
use folio::types::PageSize;

const NATIVE: PageSize = PageSize::new(100, 150);
const WAIT: Duration = Duration::from_secs(5);

fn options(strategy: CacheStrategy) -> SessionOptions {
    SessionOptions::default()
        .with_strategy(strategy)
        .with_sink(Arc::new(NullSink))
}

fn fake_resolver(pages: usize) -> FileResolver<impl Fn(&Path) -> Result<Box<dyn DocumentHandle>, DocumentError> + Send + Sync> {
    FileResolver::new(move |_path: &Path| Ok(FakeDocument::boxed(pages, NATIVE).0))
}

fn write_document(dir: &Path, name: &str, contents: &[u8]) -> DocumentSource {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents).unwrap();
    DocumentSource::File(path)
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// A file carrying the signature opens and reports its pages
#[test]
fn test_open_validated_file() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_document(dir.path(), "report.pdf", b"%PDF-1.7\n...");
    let (sink, events) = ChannelSink::new();

    let session = DocumentSession::open(
        &source,
        &fake_resolver(4),
        options(CacheStrategy::Disable).with_sink(Arc::new(sink)),
    )
    .unwrap();

    assert_eq!(session.identity(), "report.pdf");
    assert_eq!(session.page_count(), 4);
    assert_eq!(
        drain(&events),
        vec![
            SessionEvent::LoadStarted {
                identity: "report.pdf".into()
            },
            SessionEvent::LoadSucceeded {
                identity: "report.pdf".into(),
                page_count: 4
            },
        ]
    );
}

/// Files without the signature in their first KiB are refused
#[test]
fn test_open_rejects_missing_signature() {
    let dir = tempfile::tempdir().unwrap();
    let (sink, events) = ChannelSink::new();

    let mut late = vec![b' '; 1100];
    late.extend_from_slice(b"%PDF");
    for (name, contents) in [("plain.pdf", b"hello world".to_vec()), ("late.pdf", late)] {
        let source = write_document(dir.path(), name, &contents);
        let result = DocumentSession::open(
            &source,
            &fake_resolver(4),
            options(CacheStrategy::Disable).with_sink(Arc::new(sink.clone())),
        );
        assert!(matches!(
            result,
            Err(SessionError::HandleUnavailable(DocumentError::InvalidSignature { .. }))
        ));
    }

    let failures = drain(&events)
        .into_iter()
        .filter(|event| matches!(event, SessionEvent::LoadFailed { .. }))
        .count();
    assert_eq!(failures, 2);
}

/// A document without pages cannot back a session
#[test]
fn test_open_rejects_empty_document() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_document(dir.path(), "empty.pdf", b"%PDF-1.4");

    let result = DocumentSession::open(&source, &fake_resolver(0), options(CacheStrategy::Disable));
    assert!(matches!(
        result,
        Err(SessionError::HandleUnavailable(DocumentError::NoPages))
    ));
}

/// Opening a second document closes the first
#[test]
fn test_session_host_keeps_one_active_session() {
    let mut host = SessionHost::new(Box::new(fake_resolver(2)), options(CacheStrategy::MaximizePerformance));

    let (first, first_probe) = FakeDocument::boxed(3, NATIVE);
    host.open_handle("first.pdf", first, CacheStrategy::MaximizePerformance)
        .unwrap()
        .request_render(0, 10, 15, Priority::OnScreen)
        .wait()
        .unwrap();

    let (second, second_probe) = FakeDocument::boxed(5, NATIVE);
    let active = host
        .open_handle("second.pdf", second, CacheStrategy::MaximizePerformance)
        .unwrap();
    assert_eq!(active.identity(), "second.pdf");
    assert_eq!(active.page_count(), 5);

    assert!(first_probe.is_closed());
    assert!(!second_probe.is_closed());

    host.close();
    assert!(host.active().is_none());
    assert!(second_probe.is_closed());
}

/// The persistent tier serves a later session of the same document
#[test]
fn test_persistent_pages_survive_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(CacheStrategy::MaximizePerformance).with_cache_dir(dir.path());

    let (document, _) = FakeDocument::boxed(3, NATIVE);
    let first = DocumentSession::from_handle("kept.pdf", document, opts.clone()).unwrap();
    let rendered = first
        .request_render(2, 30, 45, Priority::OnScreen)
        .wait()
        .unwrap();
    first.close();

    let (document, probe) = FakeDocument::boxed(3, NATIVE);
    let second = DocumentSession::from_handle("kept.pdf", document, opts).unwrap();
    let ticket = second.request_render(2, 30, 45, Priority::OnScreen);
    assert!(ticket.is_ready());
    let reloaded = ticket.wait().unwrap();

    assert_eq!(reloaded.size(), rendered.size());
    assert_eq!(reloaded.pixels(), rendered.pixels());
    assert_eq!(probe.calls(), 0);
    assert_eq!(second.cache_stats().disk_hits, 1);
}

/// Minimize-memory keeps only the most recent page
#[test]
fn test_minimize_memory_keeps_last_page() {
    let (document, _) = FakeDocument::boxed(3, NATIVE);
    let session =
        DocumentSession::from_handle("small.pdf", document, options(CacheStrategy::MinimizeMemory)).unwrap();

    session.request_render(0, 10, 10, Priority::OnScreen).wait().unwrap();
    session.request_render(1, 10, 10, Priority::OnScreen).wait().unwrap();

    assert!(session.get_cached_page(0).is_none());
    assert_eq!(session.get_cached_page(1).unwrap().page(), 1);
}

/// With caching disabled every request renders
#[test]
fn test_disabled_cache_always_renders() {
    let (document, probe) = FakeDocument::boxed(3, NATIVE);
    let session =
        DocumentSession::from_handle("nocache.pdf", document, options(CacheStrategy::Disable)).unwrap();

    for _ in 0..2 {
        let image = session.request_render(0, 10, 10, Priority::OnScreen).wait().unwrap();
        assert_eq!(image.page(), 0);
    }
    assert_eq!(probe.renders_of(0), 2);
    assert!(session.cached_pages().is_empty());
    assert!(session.get_cached_page(0).is_none());
}

/// Every pooled buffer is back once the session is closed
#[test]
fn test_close_returns_all_buffers() {
    let (document, _) = FakeDocument::boxed(4, NATIVE);
    let session = DocumentSession::from_handle(
        "buffers.pdf",
        document,
        options(CacheStrategy::MaximizePerformance),
    )
    .unwrap();

    for page in 0..4 {
        session.request_render(page, 12, 18, Priority::OnScreen).wait().unwrap();
    }
    assert_eq!(session.cached_pages().len(), 4);
    assert!(session.buffer_pool_stats().outstanding > 0);

    session.close();
    assert_eq!(session.buffer_pool_stats().outstanding, 0);
    assert!(matches!(
        session.request_render(0, 12, 18, Priority::OnScreen).wait(),
        Err(RenderError::SessionClosed)
    ));
}

/// Moving to a page announces it and prefetches ahead of the reader
#[test]
fn test_set_current_page_prefetches_in_direction_of_travel() {
    let (sink, events) = ChannelSink::new();
    let mut opts = options(CacheStrategy::MaximizePerformance).with_sink(Arc::new(sink));
    opts.prefetch_debounce = Duration::from_millis(10);

    let (document, probe) = FakeDocument::boxed(20, NATIVE);
    let session = DocumentSession::from_handle("reading.pdf", document, opts).unwrap();

    session.request_render(5, 40, 60, Priority::OnScreen).wait().unwrap();
    assert!(session.set_current_page(5));

    assert!(eventually(|| {
        session.get_cached_page(6).is_some() && session.get_cached_page(7).is_some()
    }));
    assert_eq!(probe.renders_of(4), 0);
    assert!(!session.set_current_page(20));

    let events = drain(&events);
    assert!(events.contains(&SessionEvent::PageChanged {
        current: 5,
        total: 20
    }));
    assert!(events.contains(&SessionEvent::PrefetchPlanned {
        current: 5,
        pages: vec![6, 7]
    }));
}

/// Preloading fills in every page size without rendering
#[test]
fn test_preload_page_dimensions() {
    let sizes = vec![PageSize::new(100, 100), PageSize::new(200, 100), PageSize::new(50, 400)];
    let (document, probe) = FakeDocument::new(sizes.clone());
    let session = DocumentSession::from_handle(
        "sizes.pdf",
        Box::new(document),
        options(CacheStrategy::Disable),
    )
    .unwrap();

    assert_eq!(session.preload_page_dimensions(), 3);
    for (page, expected) in sizes.into_iter().enumerate() {
        assert_eq!(session.page_dimensions(page).wait().unwrap(), expected);
    }
    assert_eq!(probe.renders(), 0);
}
