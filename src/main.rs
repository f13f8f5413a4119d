use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::info;
use simplelog::{Config, LevelFilter, WriteLogger};

use slide_cache::render::{
    BudgetedCache, CacheManager, DocumentLayout, ExternalRenderer, FitMode, PageIndex, PagePart,
    PageRenderer, PageSize, RasterImage, RenderError, SolidRenderer, StaticLayout, ViewportSize,
    distribute_memory, total_used_memory,
};
use slide_cache::settings::{self, RendererSettings, Settings};

#[derive(Debug, Parser)]
#[command(name = "slide-cache")]
#[command(about = "Prefetching render cache for presentation slides")]
struct Cli {
    /// Settings file (default: config dir/slide-cache/config.yaml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "FILE", default_value = "slide-cache.log")]
    log_file: PathBuf,

    /// Log debug messages
    #[arg(short, long)]
    verbose: bool,

    /// Number of slides in the simulated document
    #[arg(long, default_value_t = 30)]
    pages: usize,

    /// Slide size in points
    #[arg(long, value_name = "WxH", value_parser = parse_size, default_value = "400x300")]
    page_size: Size,

    /// Presentation area in pixels
    #[arg(long, value_name = "WxH", value_parser = parse_size, default_value = "1600x1200")]
    viewport: Size,

    /// Also keep a cache for a next-slide preview of this size
    #[arg(long, value_name = "WxH", value_parser = parse_size)]
    preview: Option<Size>,

    #[arg(long)]
    threads: Option<usize>,

    /// Memory for all caches together, -1 for unlimited
    #[arg(long, allow_negative_numbers = true)]
    memory_mib: Option<i64>,

    /// Frames per cache, -1 for unlimited
    #[arg(long, allow_negative_numbers = true)]
    cache_pages: Option<i32>,

    #[arg(long, value_parser = parse_fit)]
    fit: Option<FitMode>,

    /// External rendering program; the solid colour renderer is used otherwise
    #[arg(long = "command", value_name = "CMD")]
    render_command: Option<String>,

    /// Argument for the rendering program (repeatable, supports placeholders)
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    render_args: Vec<String>,

    /// Document passed to the rendering program as %file
    #[arg(long, value_name = "FILE")]
    file: Option<PathBuf>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Step through the slides and report what the cache holds after each step
    Browse {
        #[arg(long, default_value_t = 0)]
        start: PageIndex,
        #[arg(long, default_value_t = 10)]
        steps: usize,
        #[arg(long)]
        backwards: bool,
        /// How long to let the workers run after each step
        #[arg(long, default_value_t = 2000)]
        settle_ms: u64,
    },
    /// Render one slide synchronously and write it as PNG
    Export {
        #[arg(long, default_value_t = 0)]
        page: PageIndex,
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Size {
    width: f64,
    height: f64,
}

impl From<Size> for ViewportSize {
    fn from(size: Size) -> Self {
        ViewportSize::new(size.width, size.height)
    }
}

fn parse_size(s: &str) -> Result<Size, String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
    let width: f64 = w.trim().parse().map_err(|e| format!("bad width '{w}': {e}"))?;
    let height: f64 = h.trim().parse().map_err(|e| format!("bad height '{h}': {e}"))?;
    if !(width > 0.0 && height > 0.0) {
        return Err(format!("size must be positive, got '{s}'"));
    }
    Ok(Size { width, height })
}

fn parse_fit(s: &str) -> Result<FitMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "page" => Ok(FitMode::Page),
        "width" => Ok(FitMode::Width),
        "height" => Ok(FitMode::Height),
        _ => Err(format!("unknown fit mode '{s}' (page, width, height)")),
    }
}

/// Renderer chosen at startup
enum SlideRenderer {
    Solid(SolidRenderer),
    External(ExternalRenderer),
}

impl PageRenderer for SlideRenderer {
    fn render(&self, page: PageIndex, resolution: f64) -> Result<RasterImage, RenderError> {
        match self {
            Self::Solid(r) => r.render(page, resolution),
            Self::External(r) => r.render(page, resolution),
        }
    }

    fn render_compressed(&self, page: PageIndex, resolution: f64) -> Result<Vec<u8>, RenderError> {
        match self {
            Self::Solid(r) => r.render_compressed(page, resolution),
            Self::External(r) => r.render_compressed(page, resolution),
        }
    }
}

fn renderer_factory(
    layout: Arc<dyn DocumentLayout>,
    external: Option<RendererSettings>,
    file: Option<PathBuf>,
) -> Result<impl Fn(PagePart) -> Result<SlideRenderer, RenderError>> {
    if external.is_some() && file.is_none() {
        bail!("an external renderer needs --file");
    }
    if let (Some(renderer), Some(file)) = (&external, &file) {
        // fail early on bad placeholders instead of once per worker
        ExternalRenderer::new(&renderer.command, &renderer.arguments, file, Arc::clone(&layout))
            .context("invalid renderer settings")?;
    }

    Ok(move |part: PagePart| match (&external, &file) {
        (Some(renderer), Some(file)) => ExternalRenderer::new(
            &renderer.command,
            &renderer.arguments,
            file,
            Arc::clone(&layout),
        )
        .map(SlideRenderer::External),
        _ => Ok(SlideRenderer::Solid(SolidRenderer::new(Arc::clone(&layout), part))),
    })
}

fn apply_overrides(settings: &mut Settings, cli: &Cli) {
    if let Some(threads) = cli.threads {
        settings.render_threads = threads;
    }
    if let Some(memory) = cli.memory_mib {
        settings.memory_mib = memory;
    }
    if let Some(pages) = cli.cache_pages {
        settings.cache_pages = pages;
    }
    if let Some(fit) = cli.fit {
        settings.fit_mode = fit;
    }
    if let Some(command) = &cli.render_command {
        settings.renderer = Some(RendererSettings {
            command: command.clone(),
            arguments: cli.render_args.clone(),
        });
    }
}

fn init_logging(path: &Path, verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let file = File::create(path).with_context(|| format!("creating log file {path:?}"))?;
    WriteLogger::init(level, Config::default(), file)?;
    Ok(())
}

/// Compact list of pages, e.g. `2-5, 8`
fn format_ranges(pages: &[PageIndex]) -> String {
    let mut parts = Vec::new();
    let mut iter = pages.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        parts.push(if start == end {
            start.to_string()
        } else {
            format!("{start}-{end}")
        });
    }
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join(", ")
    }
}

fn browse(
    cli: &Cli,
    settings: &Settings,
    start: PageIndex,
    steps: usize,
    backwards: bool,
    settle: Duration,
) -> Result<()> {
    let layout: Arc<dyn DocumentLayout> = Arc::new(StaticLayout::uniform(
        cli.pages,
        PageSize::new(cli.page_size.width, cli.page_size.height),
    ));
    let page_count = layout.page_count();
    if page_count == 0 {
        bail!("document has no pages");
    }
    let factory = renderer_factory(Arc::clone(&layout), settings.renderer.clone(), cli.file.clone())?;

    let mut slides = CacheManager::new(
        Arc::clone(&layout),
        settings.render_threads,
        settings.render_config(cli.viewport.into()),
        &factory,
    )?;
    slides.set_budget(settings.budget());
    let mut preview = match cli.preview {
        Some(size) => {
            let mut cache = CacheManager::new(
                Arc::clone(&layout),
                settings.render_threads,
                settings.render_config(size.into()),
                &factory,
            )?;
            cache.set_budget(settings.budget());
            Some(cache)
        }
        None => None,
    };

    if let Some(total) = settings.memory_bytes() {
        let mut caches: Vec<&mut dyn BudgetedCache> = vec![&mut slides];
        if let Some(cache) = preview.as_mut() {
            caches.push(cache);
        }
        distribute_memory(total, &mut caches);
    }

    let frames = slides.subscribe();
    let mut page = start.min(page_count - 1);
    for step in 0..=steps {
        slides.on_current_page_changed(page);
        if let Some(cache) = preview.as_mut() {
            cache.on_current_page_changed((page + 1).min(page_count - 1));
        }

        let settled = slides.run_until_idle(settle);
        if let Some(cache) = preview.as_mut() {
            cache.run_until_idle(settle);
        }

        let shown = slides
            .lookup(page, None)
            .with_context(|| format!("rendering page {page}"))?;
        println!(
            "step {step:>3}  page {page:>3}  {:>7} bytes shown  cache [{}]  {} KiB{}",
            shown.size(),
            format_ranges(&slides.cached_pages()),
            slides.used_memory_bytes() / 1024,
            if settled { "" } else { "  (still rendering)" }
        );

        let next = if backwards {
            page.checked_sub(1)
        } else {
            Some(page + 1).filter(|p| *p < page_count)
        };
        match next {
            Some(next) => page = next,
            None => break,
        }
    }

    let delivered = frames.try_iter().count();
    let mut all: Vec<&dyn BudgetedCache> = vec![&slides];
    if let Some(cache) = preview.as_ref() {
        all.push(cache);
    }
    println!(
        "{delivered} frames rendered in the background, {} bytes cached",
        total_used_memory(&all)
    );
    info!("Browse finished after {steps} steps");
    Ok(())
}

fn export(cli: &Cli, settings: &Settings, page: PageIndex, out: &Path) -> Result<()> {
    let layout: Arc<dyn DocumentLayout> = Arc::new(StaticLayout::uniform(
        cli.pages,
        PageSize::new(cli.page_size.width, cli.page_size.height),
    ));
    let factory = renderer_factory(Arc::clone(&layout), settings.renderer.clone(), cli.file.clone())?;
    let cache = CacheManager::new(layout, 0, settings.render_config(cli.viewport.into()), &factory)?;

    let frame = cache
        .lookup_handle()
        .lookup(page, None)
        .with_context(|| format!("rendering page {page}"))?;
    fs::write(out, frame.bytes()).with_context(|| format!("writing {out:?}"))?;
    println!(
        "Wrote page {page} at {:.3} px/pt ({} bytes) to {}",
        frame.resolution(),
        frame.size(),
        out.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    better_panic::install();
    let cli = Cli::parse();
    init_logging(&cli.log_file, cli.verbose)?;

    let mut settings = settings::load_settings(cli.config.as_deref());
    apply_overrides(&mut settings, &cli);
    info!("Starting slide-cache with {settings:?}");

    match &cli.action {
        Action::Browse {
            start,
            steps,
            backwards,
            settle_ms,
        } => browse(
            &cli,
            &settings,
            *start,
            *steps,
            *backwards,
            Duration::from_millis(*settle_ms),
        ),
        Action::Export { page, out } => export(&cli, &settings, *page, out),
    }
}
