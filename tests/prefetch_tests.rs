use std::sync::Arc;
use std::time::{Duration, Instant};

use serial_test::serial;

use folio::cache::CacheStrategy;
use folio::events::{ChannelSink, SessionEvent, drain};
use folio::prefetch::ScrollDirection;
use folio::render::Priority;
use folio::session::{DocumentSession, SessionOptions};
use folio::test_utils::{FakeDocument, FakeProbe};
use folio::types::PageSize;

const WAIT: Duration = Duration::from_secs(5);

fn session(
    pages: Vec<PageSize>,
    debounce: Duration,
) -> (DocumentSession, Arc<FakeProbe>, flume::Receiver<SessionEvent>) {
    let (sink, events) = ChannelSink::new();
    let mut options = SessionOptions::default()
        .with_strategy(CacheStrategy::MaximizePerformance)
        .with_sink(Arc::new(sink));
    options.prefetch_debounce = debounce;

    let (document, probe) = FakeDocument::new(pages);
    let session = DocumentSession::from_handle("prefetch.pdf", Box::new(document), options).unwrap();
    (session, probe, events)
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

fn planned(events: &flume::Receiver<SessionEvent>) -> Vec<(usize, Vec<usize>)> {
    drain(events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::PrefetchPlanned { current, pages } => Some((current, pages)),
            _ => None,
        })
        .collect()
}

/// A burst of scroll events prefetches only around the last page
#[test]
#[serial]
fn test_debounce_keeps_only_latest_plan() {
    let (session, probe, events) = session(vec![PageSize::new(100, 100); 50], Duration::from_millis(150));
    session.set_viewport(20, 20);

    session.schedule_prefetch(10, ScrollDirection::Forward);
    session.schedule_prefetch(20, ScrollDirection::Forward);
    session.schedule_prefetch(30, ScrollDirection::Forward);

    assert!(eventually(|| {
        session.get_cached_page(31).is_some() && session.get_cached_page(32).is_some()
    }));
    assert_eq!(planned(&events), vec![(30, vec![31, 32])]);
    assert_eq!(probe.renders_of(11), 0);
    assert_eq!(probe.renders_of(21), 0);
}

/// Pages already cached are left out of the plan
#[test]
#[serial]
fn test_cached_pages_are_not_prefetched() {
    let (session, probe, events) = session(vec![PageSize::new(100, 100); 20], Duration::from_millis(20));

    session.request_render(11, 20, 20, Priority::OnScreen).wait().unwrap();
    session.schedule_prefetch(10, ScrollDirection::Stationary);

    assert!(eventually(|| [9, 8, 12].iter().all(|&p| session.get_cached_page(p).is_some())));
    assert_eq!(planned(&events), vec![(10, vec![9, 8, 12])]);
    assert_eq!(probe.renders_of(11), 1);
}

/// Prefetched pages keep the viewport width and their own aspect ratio
#[test]
#[serial]
fn test_prefetch_size_follows_page_aspect() {
    let mut pages = vec![PageSize::new(100, 100); 10];
    pages[4] = PageSize::new(100, 200);
    let (session, _, _) = session(pages, Duration::from_millis(20));

    assert_eq!(session.page_dimensions(4).wait().unwrap(), PageSize::new(100, 200));
    session.set_viewport(50, 50);
    session.schedule_prefetch(3, ScrollDirection::Forward);

    assert!(eventually(|| session.get_cached_page(4).is_some()));
    assert_eq!(session.get_cached_page(4).unwrap().size(), PageSize::new(50, 100));
}

/// Without a known viewport nothing is prefetched
#[test]
#[serial]
fn test_no_prefetch_before_viewport_is_known() {
    let (session, probe, events) = session(vec![PageSize::new(100, 100); 10], Duration::from_millis(10));

    session.schedule_prefetch(3, ScrollDirection::Stationary);
    std::thread::sleep(Duration::from_millis(100));

    assert!(planned(&events).is_empty());
    assert_eq!(probe.renders(), 0);
}

/// Closing the session stops the prefetcher
#[test]
#[serial]
fn test_close_discards_pending_plan() {
    let (session, probe, _) = session(vec![PageSize::new(100, 100); 10], Duration::from_millis(200));
    session.set_viewport(10, 10);

    session.schedule_prefetch(3, ScrollDirection::Forward);
    session.close();
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(probe.renders(), 0);
}
