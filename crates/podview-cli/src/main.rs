//! Podview CLI — terminal viewer for live camera feeds

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;

use crossterm::event::{self, DisableFocusChange, EnableFocusChange, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::ExecutableCommand;
use ratatui::prelude::*;
use ratatui::widgets::*;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use podview::settings::Settings;
use podview::viewer::{
    DisplayState, FeedId, FeedStats, Panel, SharedStats, ViewerEngine, ViewerEvent,
};

#[derive(Parser)]
#[command(name = "podview", about = "Terminal viewer for live camera feeds", version)]
struct Cli {
    /// Stream URLs to show (absolute, or relative to --base-url)
    feeds: Vec<String>,

    /// Base URL for relative stream and endpoint URLs
    #[arg(long)]
    base_url: Option<String>,

    /// Warmup endpoint hit once before the first attempt
    #[arg(long)]
    warmup: Option<String>,

    /// Relay-status endpoint polled by the health check
    #[arg(long)]
    relay_status: Option<String>,

    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the merged settings back to the settings file
    #[arg(long)]
    save_config: bool,

    /// Log viewer events to stderr instead of drawing a TUI
    #[arg(long)]
    headless: bool,

    /// Log file used while the TUI is active
    #[arg(long, default_value = "podview.log")]
    log_file: PathBuf,
}

/// What the TUI shows for one feed
struct FeedView {
    stats: FeedStats,
    last_error: Option<String>,
}

struct App {
    feeds: Vec<FeedView>,
    selected: usize,
    page_visible: bool,
    window_focused: bool,
    status: String,
    tick: u64,
    running: bool,
}

impl App {
    fn new(sources: &[String]) -> Self {
        Self {
            feeds: sources
                .iter()
                .map(|url| FeedView {
                    stats: FeedStats::new(url.as_str()),
                    last_error: None,
                })
                .collect(),
            selected: 0,
            page_visible: true,
            window_focused: true,
            status: "Connecting...".to_string(),
            tick: 0,
            running: true,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let settings_path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => Settings::default_path().ok(),
    };
    let mut settings = match &settings_path {
        Some(path) => match Settings::load_from(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        None => Settings::default(),
    };
    apply_cli(&cli, &mut settings);

    if settings.feeds.is_empty() {
        eprintln!("Error: no feeds given (pass FEED_URL arguments or add \"feeds\" to the settings file)");
        std::process::exit(2);
    }

    if cli.save_config {
        if let Some(path) = &settings_path {
            settings.save_to(path)?;
            eprintln!("Saved settings to {}", path.display());
        }
    }

    init_tracing(cli.headless, &cli.log_file)?;
    info!(feeds = settings.feeds.len(), "Starting podview");

    let engine = match ViewerEngine::new(settings.engine_options()) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if cli.headless {
        run_headless(&engine);
        return Ok(());
    }

    let mut app = App::new(&settings.feeds);
    let shared_stats = engine.shared_stats();
    let event_rx = engine.event_receiver().clone();

    terminal::enable_raw_mode()?;
    io::stdout().execute(EnterAlternateScreen)?;
    io::stdout().execute(EnableFocusChange)?;
    let backend = CrosstermBackend::new(io::stdout());
    let mut terminal = Terminal::new(backend)?;

    let tick_rate = Duration::from_millis(33); // ~30fps
    let mut last_tick = Instant::now();

    while app.running {
        terminal.draw(|f| draw_ui(f, &app))?;

        let timeout = tick_rate.saturating_sub(last_tick.elapsed());
        if event::poll(timeout)? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    handle_key(key.code, &mut app, &engine);
                }
                Event::FocusGained => {
                    app.window_focused = true;
                    engine.set_window_focused(true);
                }
                Event::FocusLost => {
                    app.window_focused = false;
                    engine.set_window_focused(false);
                }
                _ => {}
            }
        }

        if last_tick.elapsed() >= tick_rate {
            last_tick = Instant::now();
            app.tick = app.tick.wrapping_add(1);

            while let Ok(event) = event_rx.try_recv() {
                handle_event(event, &mut app);
            }
            update_stats(&shared_stats, &mut app);
        }
    }

    drop(engine);

    io::stdout().execute(DisableFocusChange)?;
    terminal::disable_raw_mode()?;
    io::stdout().execute(LeaveAlternateScreen)?;

    Ok(())
}

/// Command-line values win over the settings file
fn apply_cli(cli: &Cli, settings: &mut Settings) {
    if !cli.feeds.is_empty() {
        settings.feeds = cli.feeds.clone();
    }
    if cli.base_url.is_some() {
        settings.base_url = cli.base_url.clone();
    }
    if cli.warmup.is_some() {
        settings.warmup_url = cli.warmup.clone();
    }
    if cli.relay_status.is_some() {
        settings.relay_status_url = cli.relay_status.clone();
    }
}

/// Log to stderr in headless mode, to a file while the TUI owns the terminal
fn init_tracing(headless: bool, log_file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true);
    if headless {
        builder.with_writer(io::stderr).try_init().map_err(boxed)?;
    } else {
        let file = File::create(log_file)?;
        builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
            .map_err(boxed)?;
    }
    Ok(())
}

fn boxed(e: Box<dyn std::error::Error + Send + Sync>) -> Box<dyn std::error::Error> {
    e
}

fn run_headless(engine: &ViewerEngine) {
    log_events(&engine.event_bus().subscribe());
}

/// Log events until every sender is gone
fn log_events(events: &crossbeam_channel::Receiver<ViewerEvent>) {
    loop {
        match events.recv_timeout(Duration::from_secs(1)) {
            Ok(event) => log_event(&event),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn log_event(event: &ViewerEvent) {
    match event {
        ViewerEvent::PanelChanged { feed, panel } => info!(%feed, %panel, "Panel changed"),
        ViewerEvent::StateChanged { feed, state } => match state {
            DisplayState::Error => error!(%feed, "Feed unavailable, retries exhausted"),
            _ => info!(%feed, %state, "State changed"),
        },
        ViewerEvent::FrameError { feed, message } => warn!(%feed, "Frame error: {message}"),
        ViewerEvent::Restarted { feed, attempt } => info!(%feed, %attempt, "New attempt"),
    }
}

fn handle_key(code: KeyCode, app: &mut App, engine: &ViewerEngine) {
    match code {
        KeyCode::Char('q') | KeyCode::Esc => {
            app.running = false;
        }
        KeyCode::Char('r') => {
            engine.retry_all();
            app.status = "Retrying all feeds".to_string();
        }
        KeyCode::Char(c @ '1'..='9') => {
            let index = c as usize - '1' as usize;
            if index < app.feeds.len() {
                engine.retry_feed(FeedId(index));
                app.status = format!("Retrying feed {}", index + 1);
            }
        }
        KeyCode::Char('p') => {
            app.page_visible = !app.page_visible;
            engine.set_page_visible(app.page_visible);
            if app.page_visible {
                engine.page_shown(false);
            }
            app.status = if app.page_visible {
                "Page visible".to_string()
            } else {
                "Page hidden".to_string()
            };
        }
        KeyCode::Tab => {
            if !app.feeds.is_empty() {
                app.selected = (app.selected + 1) % app.feeds.len();
            }
        }
        KeyCode::Char('h') => {
            if let Some(view) = app.feeds.get(app.selected) {
                let in_viewport = !view.stats.in_viewport;
                engine.set_in_viewport(FeedId(app.selected), in_viewport);
                app.status = format!(
                    "Feed {} {}",
                    app.selected + 1,
                    if in_viewport { "scrolled into view" } else { "scrolled out of view" }
                );
            }
        }
        KeyCode::Char('s') => {
            app.status = save_frames(engine);
        }
        _ => {}
    }
}

fn handle_event(event: ViewerEvent, app: &mut App) {
    match event {
        ViewerEvent::FrameError { feed, message } => {
            if let Some(view) = app.feeds.get_mut(feed.0) {
                view.last_error = Some(message);
            }
        }
        ViewerEvent::PanelChanged {
            feed,
            panel: Panel::Stream,
        } => {
            if let Some(view) = app.feeds.get_mut(feed.0) {
                view.last_error = None;
            }
            app.status = format!("Feed {} live", feed.0 + 1);
        }
        ViewerEvent::StateChanged {
            feed,
            state: DisplayState::Error,
        } => {
            app.status = format!("Feed {} unavailable", feed.0 + 1);
        }
        _ => {}
    }
}

fn update_stats(shared_stats: &SharedStats, app: &mut App) {
    if let Ok(stats) = shared_stats.lock() {
        for (view, fresh) in app.feeds.iter_mut().zip(stats.feeds.iter()) {
            view.stats = fresh.clone();
        }
    }
}

/// Write the latest frame of every feed to the working directory
fn save_frames(engine: &ViewerEngine) -> String {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut saved = 0;
    for i in 0..engine.feed_count() {
        let Some(frame) = engine.latest_frame(FeedId(i)) else {
            continue;
        };
        let name = format!("podview-feed{}-{}.jpg", i + 1, stamp);
        match fs::write(&name, &frame.data) {
            Ok(()) => saved += 1,
            Err(e) => {
                warn!(file = %name, "Failed to save frame: {e}");
                return format!("Save failed: {e}");
            }
        }
    }
    format!("Saved {} frame(s)", saved)
}

fn draw_ui(f: &mut ratatui::Frame, app: &App) {
    let area = f.area();

    let outer = Block::default()
        .title(format!(" Podview v{} ", env!("CARGO_PKG_VERSION")))
        .title_alignment(Alignment::Center)
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded);
    let inner = outer.inner(area);
    f.render_widget(outer, area);

    let chunks = Layout::vertical([
        Constraint::Min(4),    // feeds
        Constraint::Length(1), // status line
        Constraint::Length(1), // help bar
    ])
    .split(inner);

    let n = app.feeds.len().max(1) as u32;
    let rows = Layout::vertical(
        (0..app.feeds.len()).map(|_| Constraint::Ratio(1, n)).collect::<Vec<_>>(),
    )
    .split(chunks[0]);
    for (i, view) in app.feeds.iter().enumerate() {
        draw_feed(f, app, i, view, rows[i]);
    }

    draw_status(f, app, chunks[1]);
    draw_help(f, chunks[2]);
}

fn draw_feed(f: &mut ratatui::Frame, app: &App, index: usize, view: &FeedView, area: Rect) {
    let stats = &view.stats;
    let border_color = if index == app.selected {
        Color::Cyan
    } else {
        Color::DarkGray
    };
    let max_url_len = area.width.saturating_sub(12) as usize;
    let block = Block::default()
        .title(format!(
            " {} {} ",
            index + 1,
            truncate_str(&stats.source_url, max_url_len)
        ))
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(border_color));

    let panel_line = match stats.panel {
        Panel::Stream => {
            let size = stats
                .frame_size
                .map(|(w, h)| format!("{}x{}", w, h))
                .unwrap_or_else(|| "---".to_string());
            Line::from(vec![
                Span::styled("  ● LIVE", Style::default().fg(Color::Green).bold()),
                Span::raw("  "),
                Span::styled("Size: ", Style::default().fg(Color::DarkGray)),
                Span::styled(size, Style::default().fg(Color::White)),
                Span::raw("  "),
                Span::styled("Rate: ", Style::default().fg(Color::DarkGray)),
                Span::styled(format!("{:.1} fps", stats.fps), Style::default().fg(Color::White)),
                Span::raw("  "),
                Span::styled("Received: ", Style::default().fg(Color::DarkGray)),
                Span::styled(format_bytes(stats.bytes_received), Style::default().fg(Color::White)),
                Span::raw("  "),
                Span::styled("Cached: ", Style::default().fg(Color::DarkGray)),
                Span::styled(stats.cached_frames.to_string(), Style::default().fg(Color::White)),
            ])
        }
        Panel::Loading => {
            const SPINNER: [char; 4] = ['|', '/', '-', '\\'];
            let spin = SPINNER[(app.tick / 4) as usize % SPINNER.len()];
            let waiting = if stats.should_run {
                format!("Connecting... attempt {}", stats.retry_count.max(1))
            } else {
                "Paused while hidden".to_string()
            };
            Line::from(vec![
                Span::styled(format!("  {} ", spin), Style::default().fg(Color::Yellow)),
                Span::styled(waiting, Style::default().fg(Color::Yellow)),
            ])
        }
        Panel::Error => Line::from(vec![
            Span::styled("  ✖ Stream unavailable", Style::default().fg(Color::Red).bold()),
            Span::styled(
                format!("  press {} or 'r' to retry", index + 1),
                Style::default().fg(Color::DarkGray),
            ),
        ]),
    };

    let state_color = match stats.display_state {
        DisplayState::Streaming => Color::Green,
        DisplayState::Loading => Color::Yellow,
        DisplayState::Error => Color::Red,
    };
    let detail_line = Line::from(vec![
        Span::styled("  State: ", Style::default().fg(Color::DarkGray)),
        Span::styled(stats.display_state.to_string(), Style::default().fg(state_color)),
        Span::raw("  "),
        Span::styled("Retries: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            format!("{} (next {:.1}s)", stats.retry_count, stats.retry_delay_ms as f64 / 1000.0),
            Style::default().fg(Color::White),
        ),
        Span::raw("  "),
        Span::styled("Attempts: ", Style::default().fg(Color::DarkGray)),
        Span::styled(format!("{}", stats.restarts), Style::default().fg(Color::White)),
        Span::raw("  "),
        Span::styled("Errors: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            format!("{}", stats.errors),
            Style::default().fg(if stats.errors > 0 { Color::Red } else { Color::White }),
        ),
        Span::raw("  "),
        Span::styled(
            if stats.in_viewport { "" } else { "(out of view)" },
            Style::default().fg(Color::DarkGray),
        ),
    ]);

    let mut lines = vec![panel_line, detail_line];
    if let Some(err) = &view.last_error {
        lines.push(Line::from(vec![
            Span::styled("  Last error: ", Style::default().fg(Color::DarkGray)),
            Span::styled(err.as_str(), Style::default().fg(Color::Red)),
        ]));
    }
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_status(f: &mut ratatui::Frame, app: &App, area: Rect) {
    let live = app
        .feeds
        .iter()
        .filter(|v| v.stats.display_state == DisplayState::Streaming)
        .count();
    let visibility = match (app.page_visible, app.window_focused) {
        (true, true) => "visible",
        (false, _) => "page hidden",
        (true, false) => "unfocused",
    };
    let line = Line::from(vec![
        Span::styled(
            format!("  {}/{} live", live, app.feeds.len()),
            Style::default().fg(Color::Cyan).bold(),
        ),
        Span::raw("  |  "),
        Span::styled(visibility, Style::default().fg(Color::White)),
        Span::raw("  |  "),
        Span::styled(app.status.as_str(), Style::default().fg(Color::Yellow)),
    ]);
    f.render_widget(Paragraph::new(line), area);
}

fn draw_help(f: &mut ratatui::Frame, area: Rect) {
    let help = Line::from(vec![
        Span::styled("  'q' ", Style::default().fg(Color::Yellow)),
        Span::raw("quit  |  "),
        Span::styled("'r' ", Style::default().fg(Color::Yellow)),
        Span::raw("retry all  |  "),
        Span::styled("'1'-'9' ", Style::default().fg(Color::Yellow)),
        Span::raw("retry feed  |  "),
        Span::styled("'p' ", Style::default().fg(Color::Yellow)),
        Span::raw("page  |  "),
        Span::styled("Tab/'h' ", Style::default().fg(Color::Yellow)),
        Span::raw("select/hide  |  "),
        Span::styled("'s' ", Style::default().fg(Color::Yellow)),
        Span::raw("save"),
    ]);
    f.render_widget(Paragraph::new(help).alignment(Alignment::Left), area);
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else if max > 3 {
        let head: String = s.chars().take(max - 3).collect();
        format!("{}...", head)
    } else {
        s.chars().take(max).collect()
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
