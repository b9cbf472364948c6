use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::info;
use simplelog::{Config, LevelFilter, WriteLogger};

use folio::document::SyntheticDocument;
use folio::events::drain;
use folio::{
    CacheStrategy, ChannelSink, DocumentSession, PageSize, Priority, SessionEvent, SessionOptions,
    Settings,
};

#[derive(Parser, Debug)]
#[command(name = "folio")]
#[command(about = "Render document pages through the folio cache and prefetcher")]
#[command(version)]
struct Cli {
    /// Document to render (needs a build with the `mupdf` feature)
    file: Option<PathBuf>,

    /// Render a generated document with this many pages instead of a file
    #[arg(long, conflicts_with = "file")]
    synthetic: Option<usize>,

    /// First page to render, zero-based
    #[arg(long, default_value_t = 0)]
    first: usize,

    /// Number of pages to render
    #[arg(long, default_value_t = 3)]
    count: usize,

    /// Target width in pixels; height follows the page's aspect ratio
    #[arg(long, default_value_t = 600)]
    width: u32,

    /// Directory the PNG files are written to
    #[arg(long, short = 'o', default_value = "folio-out")]
    out: PathBuf,

    /// Cache strategy, overriding the config file
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Config file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbosity of folio.log
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    MinimizeMemory,
    MaximizePerformance,
    Disable,
}

impl From<StrategyArg> for CacheStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::MinimizeMemory => CacheStrategy::MinimizeMemory,
            StrategyArg::MaximizePerformance => CacheStrategy::MaximizePerformance,
            StrategyArg::Disable => CacheStrategy::Disable,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    WriteLogger::init(
        cli.log_level.into(),
        Config::default(),
        File::create("folio.log")?,
    )?;
    info!("Starting folio");

    let mut settings = Settings::load_or_default(cli.config.as_deref());
    if let Some(strategy) = cli.strategy {
        settings.cache_strategy = strategy.into();
    }

    let (sink, events) = ChannelSink::new();
    let options = settings.session_options(Arc::new(sink));
    let session = open_session(&cli, options)?;
    println!(
        "{}: {} pages, {} cache",
        session.identity(),
        session.page_count(),
        session.cache_strategy().as_str()
    );

    std::fs::create_dir_all(&cli.out)
        .with_context(|| format!("creating output directory {:?}", cli.out))?;

    let last = cli.first.saturating_add(cli.count).min(session.page_count());
    for page in cli.first..last {
        let native = session.page_dimensions(page).wait()?;
        let height = native.height_for_width(cli.width);
        let image = session
            .request_render(page, cli.width, height, Priority::OnScreen)
            .wait()
            .with_context(|| format!("rendering page {}", page + 1))?;
        session.set_current_page(page);

        let path = cli.out.join(format!("page-{:04}.png", page + 1));
        write_png(&path, image.pixels(), image.size())?;
        println!("page {} -> {} ({}x{})", page + 1, path.display(), image.width(), image.height());
    }

    // let the last prefetch plan run before reporting
    std::thread::sleep(settings.prefetch_debounce() * 3);

    let cache = session.cache_stats();
    let pool = session.buffer_pool_stats();
    println!(
        "cache: {} memory hits, {} disk hits, {} misses, {} writes, {} evictions",
        cache.memory_hits, cache.disk_hits, cache.misses, cache.writes, cache.evictions
    );
    println!(
        "buffers: {} allocated, {} recycled, {} outstanding",
        pool.allocated, pool.recycled, pool.outstanding
    );

    session.close();
    print_event_summary(&drain(&events));
    info!("Shutting down folio");
    Ok(())
}

fn open_session(cli: &Cli, options: SessionOptions) -> Result<DocumentSession> {
    if let Some(pages) = cli.synthetic {
        let document = SyntheticDocument::uniform(pages, PageSize::new(612, 792));
        return Ok(DocumentSession::from_handle(
            format!("synthetic-{pages}.pdf"),
            Box::new(document),
            options,
        )?);
    }

    let Some(path) = cli.file.as_deref() else {
        anyhow::bail!("either a document path or --synthetic <pages> is required");
    };
    open_file(path, options)
}

#[cfg(feature = "mupdf")]
fn open_file(path: &Path, options: SessionOptions) -> Result<DocumentSession> {
    let source = folio::DocumentSource::File(path.to_path_buf());
    let resolver = folio::document::mupdf::resolver();
    DocumentSession::open(&source, &resolver, options)
        .with_context(|| format!("opening {}", path.display()))
}

#[cfg(not(feature = "mupdf"))]
fn open_file(path: &Path, _options: SessionOptions) -> Result<DocumentSession> {
    anyhow::bail!(
        "cannot open {}: built without the `mupdf` feature, use --synthetic",
        path.display()
    )
}

fn write_png(path: &Path, pixels: &[u8], size: PageSize) -> Result<()> {
    image::save_buffer_with_format(
        path,
        pixels,
        size.width,
        size.height,
        image::ColorType::Rgba8,
        image::ImageFormat::Png,
    )
    .with_context(|| format!("writing {}", path.display()))
}

fn print_event_summary(events: &[SessionEvent]) {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for event in events {
        let name = match event {
            SessionEvent::LoadStarted { .. } => "load started",
            SessionEvent::LoadSucceeded { .. } => "load succeeded",
            SessionEvent::LoadFailed { .. } => "load failed",
            SessionEvent::PageChanged { .. } => "page changed",
            SessionEvent::RenderStarted { .. } => "render started",
            SessionEvent::RenderCompleted { from_cache: true, .. } => "served from cache",
            SessionEvent::RenderCompleted { .. } => "render completed",
            SessionEvent::RenderCancelled { .. } => "render cancelled",
            SessionEvent::RenderFailed { .. } => "render failed",
            SessionEvent::PrefetchPlanned { .. } => "prefetch planned",
            SessionEvent::SessionClosed { .. } => "session closed",
        };
        *counts.entry(name).or_default() += 1;
    }
    for (name, count) in counts {
        println!("{name}: {count}");
    }
}
