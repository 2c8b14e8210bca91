use std::fs;
use std::io::{self, Stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, Event};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use tabpdf_core::{
    Binding, FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, SessionStore, SlotDisplay,
    SlotId, ViewEvent, Viewer, ViewerConfig,
};
use tabpdf_render::{locator_for_path, FileLocatorResolver, PdfiumBackend};
use tabpdf_tty::{
    format_tab_bar, write_status_line, DrawParams, EventMapper, KittyRenderer, TabCommand,
    UiEvent,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

const PAGE_SLOT: SlotId = 0;
const EXPIRY_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[command(name = "tabpdf", version, about = "Tabbed kitty-native PDF viewer")]
struct Args {
    /// Start with an empty session instead of restoring the last one
    #[arg(long)]
    fresh: bool,

    /// Output pixels per page point, overriding the config file
    #[arg(short = 'd', long)]
    density: Option<f32>,

    /// Config file to read instead of the platform default
    #[arg(long)]
    config: Option<PathBuf>,

    /// PDF files to open as tabs
    files: Vec<PathBuf>,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "tabpdf", "tabpdf")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join("config.toml"));
    let mut config = ViewerConfig::load(&config_path)?;
    if let Some(density) = args.density {
        config.density = density;
        config.validate()?;
    }

    let state_path = project_dirs
        .data_local_dir()
        .join("state")
        .join("session.json");
    let state: Arc<dyn KeyValueStore> = match FileKeyValueStore::open(state_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            warn!(error = ?err, "session state unavailable; tabs will not be remembered");
            Arc::new(MemoryKeyValueStore::new())
        }
    };
    let store = SessionStore::new(state);
    let backend = PdfiumBackend::new()?;
    let mut viewer = Viewer::new(
        Arc::new(backend),
        store,
        Arc::new(FileLocatorResolver),
        config,
    );

    if !args.fresh {
        viewer.restore();
    }
    for path in &args.files {
        let locator = locator_for_path(path).with_context(|| format!("failed to open {:?}", path))?;
        viewer.open(locator);
    }
    if viewer.session().is_empty() {
        viewer.shutdown();
        bail!("nothing to show: pass one or more PDF files");
    }

    let result = run(&mut viewer).await;
    viewer.shutdown();
    result
}

async fn run(viewer: &mut Viewer) -> Result<()> {
    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;

    let mut screen = Screen::new(KittyRenderer::new(stdout));
    let mut mapper = EventMapper::new();
    let mut keys = spawn_input_reader();
    let mut expiry = tokio::time::interval(EXPIRY_TICK);

    screen.follow_active(viewer)?;
    screen.redraw(viewer, None)?;

    loop {
        let mut dirty = false;
        tokio::select! {
            key = keys.recv() => {
                let Some(key) = key else { break };
                match mapper.map_event(key) {
                    UiEvent::Quit => break,
                    UiEvent::Command(command) => {
                        screen.status = apply_command(viewer, command);
                        screen.follow_active(viewer)?;
                        dirty = true;
                    }
                    UiEvent::Resize => dirty = true,
                    UiEvent::None => {}
                }
                // Pending prefixes show up in the status line immediately.
                dirty |= mapper.pending_input().is_some();
            }
            delivered = viewer.next_event() => {
                if !delivered {
                    break;
                }
            }
            _ = expiry.tick() => {
                viewer.expire_overdue(Instant::now());
            }
        }

        for event in viewer.drain_events() {
            dirty |= screen.observe(&event);
        }
        if dirty {
            // Page counts arriving late may have clamped the current page.
            screen.follow_active(viewer)?;
            screen.redraw(viewer, mapper.pending_input().as_deref())?;
        }
    }

    screen.renderer.erase(PAGE_SLOT)?;
    screen.renderer.clear_all()?;
    Ok(())
}

/// Blocking crossterm reads on a plain thread, forwarded into the runtime.
fn spawn_input_reader() -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = thread::Builder::new()
        .name("tty-input".into())
        .spawn(move || loop {
            match event::read() {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(?err, "terminal input failed");
                    return;
                }
            }
        });
    if let Err(err) = spawned {
        warn!(?err, "failed to start input reader");
    }
    rx
}

/// Applies a tab command and returns a status message to show, if any.
fn apply_command(viewer: &mut Viewer, command: TabCommand) -> Option<String> {
    let session = viewer.session();
    let len = session.len();
    let active = session.active_index();
    let current = session.active().map(|doc| (doc.id, doc.current_page, doc.page_count));

    match command {
        TabCommand::NextPage { count } => {
            let (id, page, page_count) = current?;
            viewer.record_page_seen(&id, clamp_page(page.saturating_add(count), page_count));
            None
        }
        TabCommand::PrevPage { count } => {
            let (id, page, _) = current?;
            viewer.record_page_seen(&id, page.saturating_sub(count));
            None
        }
        TabCommand::FirstPage => {
            let (id, _, _) = current?;
            viewer.record_page_seen(&id, 0);
            None
        }
        TabCommand::LastPage => {
            let (id, page, page_count) = current?;
            viewer.record_page_seen(&id, page_count.checked_sub(1).unwrap_or(page));
            None
        }
        TabCommand::NextTab { count } => {
            let index = cycle_tab(active?, len, count as isize)?;
            viewer.switch_to(index);
            None
        }
        TabCommand::PrevTab { count } => {
            let index = cycle_tab(active?, len, -(count as isize))?;
            viewer.switch_to(index);
            None
        }
        TabCommand::GotoTab { index } => match viewer.switch_to(index) {
            Some(_) => None,
            None => Some(format!("no tab {}", index + 1)),
        },
        TabCommand::CloseTab => {
            let closed = viewer.close(active?)?;
            Some(format!("closed {}", closed.display_name))
        }
    }
}

/// Last valid page when the count is known. Before a document finishes
/// opening its page count is zero and the request is passed through.
fn clamp_page(page: usize, page_count: usize) -> usize {
    if page_count == 0 {
        page
    } else {
        page.min(page_count - 1)
    }
}

fn cycle_tab(active: usize, len: usize, delta: isize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let len = len as isize;
    Some((active as isize + delta).rem_euclid(len) as usize)
}

struct Screen {
    renderer: KittyRenderer<Stdout>,
    shown: Option<Binding>,
    status: Option<String>,
}

impl Screen {
    fn new(renderer: KittyRenderer<Stdout>) -> Self {
        Self {
            renderer,
            shown: None,
            status: None,
        }
    }

    /// Points the page slot at the active document's current page.
    fn follow_active(&mut self, viewer: &mut Viewer) -> Result<()> {
        let wanted = viewer.session().active().map(|doc| Binding {
            document_id: doc.id,
            page_index: doc.current_page,
        });
        if wanted == self.shown {
            return Ok(());
        }
        match wanted {
            Some(binding) => {
                viewer.bind_slot(PAGE_SLOT, binding.document_id, binding.page_index);
            }
            None => {
                viewer.release_slot(PAGE_SLOT);
                self.renderer.erase(PAGE_SLOT)?;
            }
        }
        self.shown = wanted;
        Ok(())
    }

    /// Whether `event` changes what is on screen.
    fn observe(&mut self, event: &ViewEvent) -> bool {
        match event {
            ViewEvent::PageReady(slot) | ViewEvent::PageLoading(slot) => *slot == PAGE_SLOT,
            ViewEvent::PageFailed { slot, error } => {
                if *slot == PAGE_SLOT {
                    info!(%error, "page unavailable");
                }
                *slot == PAGE_SLOT
            }
            ViewEvent::DocumentFailed { error, .. } => {
                self.status = Some(error.clone());
                true
            }
            ViewEvent::DocumentReady { .. }
            | ViewEvent::DocumentOpened(_)
            | ViewEvent::DocumentClosed(_)
            | ViewEvent::ActiveChanged(_) => true,
            ViewEvent::AlreadyOpen(_) => false,
        }
    }

    fn redraw(&mut self, viewer: &Viewer, pending_input: Option<&str>) -> Result<()> {
        let window = terminal::window_size()?;
        let total_cols = u32::from(window.columns).max(1);
        let total_rows = u32::from(window.rows).max(1);
        let page_rows = total_rows.saturating_sub(2).max(1);

        self.renderer.begin_sync_update()?;
        self.renderer.clear_all()?;

        let session = viewer.session();
        let names: Vec<&str> = session
            .documents()
            .iter()
            .map(|doc| doc.display_name.as_str())
            .collect();
        let bar = format_tab_bar(&names, session.active_index(), total_cols as usize);
        write_status_line(self.renderer.writer(), &bar)?;

        let display = viewer.slot(PAGE_SLOT).map(|slot| slot.display());
        match display {
            Some(SlotDisplay::Ready(buffer)) => {
                let cell = CellSize::from_window(&window);
                let (cols, rows) =
                    fit_cells(buffer.width(), buffer.height(), total_cols, page_rows, cell);
                let start_col = total_cols.saturating_sub(cols) / 2;
                let start_row = 1 + page_rows.saturating_sub(rows) / 2;
                crossterm::execute!(
                    self.renderer.writer(),
                    cursor::MoveTo(start_col as u16, start_row as u16)
                )?;
                self.renderer
                    .draw(PAGE_SLOT, buffer.image(), DrawParams::clamped(cols, rows))?;
            }
            other => {
                self.renderer.erase(PAGE_SLOT)?;
                let message = match other {
                    Some(SlotDisplay::Loading) => "Loading…".to_owned(),
                    Some(SlotDisplay::Failed(failure)) => format!("Cannot show page: {failure}"),
                    _ => "No document open".to_owned(),
                };
                let col = total_cols.saturating_sub(message.chars().count() as u32) / 2;
                crossterm::execute!(
                    self.renderer.writer(),
                    cursor::MoveTo(col as u16, (1 + page_rows / 2) as u16)
                )?;
                write_status_line(self.renderer.writer(), &message)?;
            }
        }

        let status = combine_status(document_status(viewer), self.status.as_deref());
        let status = combine_status(status, pending_input);
        if let Some(status) = status {
            crossterm::execute!(
                self.renderer.writer(),
                cursor::MoveTo(0, total_rows.saturating_sub(1) as u16),
                Clear(ClearType::CurrentLine)
            )?;
            write_status_line(self.renderer.writer(), &status)?;
        }
        self.status = None;

        self.renderer.end_sync_update()?;
        Ok(())
    }
}

fn document_status(viewer: &Viewer) -> Option<String> {
    let doc = viewer.session().active()?;
    if doc.page_count == 0 {
        Some(format!("{} | page {}", doc.display_name, doc.current_page + 1))
    } else {
        Some(format!(
            "{} | page {}/{}",
            doc.display_name,
            doc.current_page + 1,
            doc.page_count
        ))
    }
}

fn combine_status(base: Option<String>, extra: Option<&str>) -> Option<String> {
    match (base, extra.filter(|s| !s.is_empty())) {
        (Some(mut base), Some(extra)) => {
            base.push_str(" | ");
            base.push_str(extra);
            Some(base)
        }
        (Some(base), None) => Some(base),
        (None, Some(extra)) => Some(extra.to_string()),
        (None, None) => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CellSize {
    width: f32,
    height: f32,
}

impl CellSize {
    fn from_window(window: &terminal::WindowSize) -> Option<Self> {
        if window.columns == 0 || window.rows == 0 || window.width == 0 || window.height == 0 {
            return None;
        }
        Some(Self {
            width: f32::from(window.width) / f32::from(window.columns),
            height: f32::from(window.height) / f32::from(window.rows),
        })
    }
}

/// Largest cell box that holds the image at its aspect ratio. Without pixel
/// metrics a cell is assumed to be twice as tall as it is wide.
fn fit_cells(
    image_width: u32,
    image_height: u32,
    available_cols: u32,
    available_rows: u32,
    cell: Option<CellSize>,
) -> (u32, u32) {
    let available_cols = available_cols.max(1);
    let available_rows = available_rows.max(1);
    if image_width == 0 || image_height == 0 {
        return (available_cols, available_rows);
    }

    let cell = cell.unwrap_or(CellSize {
        width: 1.0,
        height: 2.0,
    });
    let box_width = available_cols as f32 * cell.width;
    let box_height = available_rows as f32 * cell.height;
    let scale = (box_width / image_width as f32).min(box_height / image_height as f32);

    let cols = (image_width as f32 * scale / cell.width).round();
    let rows = (image_height as f32 * scale / cell.height).round();
    (
        (cols as u32).clamp(1, available_cols),
        (rows as u32).clamp(1, available_rows),
    )
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "tabpdf.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The terminal belongs to the viewer, so logs only go to the file.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tab_cycling_wraps_both_ways() {
        assert_eq!(cycle_tab(2, 3, 1), Some(0));
        assert_eq!(cycle_tab(0, 3, -1), Some(2));
        assert_eq!(cycle_tab(1, 3, 7), Some(2));
        assert_eq!(cycle_tab(0, 0, 1), None);
    }

    #[test]
    fn pages_clamp_once_count_is_known() {
        assert_eq!(clamp_page(40, 12), 11);
        assert_eq!(clamp_page(4, 12), 4);
        assert_eq!(clamp_page(40, 0), 40);
    }

    #[test]
    fn fit_keeps_aspect_ratio_within_box() {
        let cell = Some(CellSize {
            width: 10.0,
            height: 20.0,
        });
        assert_eq!(fit_cells(1000, 2000, 80, 40, cell), (40, 40));
        assert_eq!(fit_cells(2000, 1000, 80, 40, cell), (80, 20));
        assert_eq!(fit_cells(0, 10, 80, 40, cell), (80, 40));
        assert_eq!(fit_cells(100, 100, 0, 0, None), (1, 1));
    }

    #[test]
    fn status_parts_are_joined() {
        assert_eq!(
            combine_status(Some("a.pdf | page 1/3".into()), Some("3g")).as_deref(),
            Some("a.pdf | page 1/3 | 3g")
        );
        assert_eq!(combine_status(None, Some("")), None);
    }
}
