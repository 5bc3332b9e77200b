//! Fleet (workers, load, running tasks)
//! Queue (pending depth)
//! Audit (latest administrative actions)

use std::{
  io,
  sync::{Arc, mpsc},
  thread,
  time::{Duration, Instant},
};

use chrono::Utc;
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use tokio::runtime::Runtime;
use tui::{
  Terminal,
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
};

use dscan::audit::{AuditFilter, AuditLog, PageRequest};
use dscan::config::Config;
use dscan::control::ControlPlane;
use dscan::keys::Keys;
use dscan::models::{AuditLogEntry, WorkerState, WorkerView};
use dscan::registry::WorkerRegistry;
use dscan::store::{RedisStore, Store};
use dscan::task_queue::TaskQueue;

const REFRESH_EVERY: Duration = Duration::from_secs(2);
const AUDIT_ROWS: usize = 20;

#[derive(Clone, Copy)]
enum DashboardTab {
  Fleet,
  Queue,
  Audit,
}

#[derive(Default)]
struct Snapshot {
  workers: Vec<WorkerView>,
  pending: usize,
  audit: Vec<AuditLogEntry>,
  problems: Vec<String>,
}

struct App {
  current_tab: DashboardTab,
  snapshot: Snapshot,
}

impl App {
  fn new() -> Self {
    Self { current_tab: DashboardTab::Fleet, snapshot: Snapshot::default() }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Fleet => DashboardTab::Queue,
      DashboardTab::Queue => DashboardTab::Audit,
      DashboardTab::Audit => DashboardTab::Fleet,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Fleet => DashboardTab::Audit,
      DashboardTab::Queue => DashboardTab::Fleet,
      DashboardTab::Audit => DashboardTab::Queue,
    }
  }
}

struct Sources {
  registry: WorkerRegistry,
  queue: TaskQueue,
  audit: AuditLog,
  prompt_every: Duration,
  last_prompt: Option<Instant>,
}

/// Whether the fleet should be asked for fresh heartbeats on this poll.
fn prompt_due(last: Option<Instant>, now: Instant, every: Duration) -> bool {
  last.is_none_or(|at| now.duration_since(at) >= every)
}

impl Sources {
  fn new(store: Arc<dyn Store>, config: &Config) -> Self {
    let keys = Keys::new(config.namespace.clone());
    let control = ControlPlane::new(store.clone(), keys.clone());
    Self {
      registry: WorkerRegistry::new(store.clone(), control, config.registry()),
      queue: TaskQueue::new(store.clone(), &keys),
      audit: AuditLog::new(store, keys),
      prompt_every: config.heartbeat_interval,
      last_prompt: None,
    }
  }

  /// Workers are prompted at most once per heartbeat interval; the polls in
  /// between read whatever heartbeats are stored.
  async fn fetch(&mut self) -> Snapshot {
    let mut snapshot = Snapshot::default();
    let now = Instant::now();
    if prompt_due(self.last_prompt, now, self.prompt_every) {
      self.registry.request_refresh().await;
      self.last_prompt = Some(now);
    }
    match self.registry.snapshot(Utc::now()).await {
      Ok(workers) => snapshot.workers = workers,
      Err(e) => snapshot.problems.push(format!("workers: {e}")),
    }
    match self.queue.len().await {
      Ok(pending) => snapshot.pending = pending,
      Err(e) => snapshot.problems.push(format!("queue: {e}")),
    }
    let page = PageRequest { page: 1, page_size: AUDIT_ROWS };
    match self.audit.search(&AuditFilter::default(), page).await {
      Ok(found) => snapshot.audit = found.list,
      Err(e) => snapshot.problems.push(format!("audit: {e}")),
    }
    snapshot
  }
}

fn main() -> anyhow::Result<()> {
  let config = Config::from_env()?;
  let rt = Runtime::new()?;
  let store: Arc<dyn Store> = Arc::new(rt.block_on(RedisStore::connect(config.require_redis_url()?))?);
  let mut sources = Sources::new(store, &config);

  let (tx, rx) = mpsc::channel::<Snapshot>();
  thread::spawn(move || {
    loop {
      if tx.send(rt.block_on(sources.fetch())).is_err() {
        break;
      }
      thread::sleep(REFRESH_EVERY);
    }
  });

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(snapshot) = rx.try_recv() {
      app.snapshot = snapshot;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate.checked_sub(last_tick.elapsed()).unwrap_or_default();
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right | KeyCode::Tab => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
    .split(f.size());

  let tab_titles = ["Fleet", "Queue", "Audit"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
  .block(Block::default().borders(Borders::ALL).title("dscan"))
  .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
  .select(match app.current_tab {
    DashboardTab::Fleet => 0,
    DashboardTab::Queue => 1,
    DashboardTab::Audit => 2,
  });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Fleet => render_fleet(f, app, chunks[1]),
    DashboardTab::Queue => render_queue(f, app, chunks[1]),
    DashboardTab::Audit => render_audit(f, app, chunks[1]),
  }

  let footer_text = match app.snapshot.problems.first() {
    Some(problem) => format!("←/→: Switch Tabs | q: Quit | {problem}"),
    None => "←/→: Switch Tabs | q: Quit".to_string(),
  };
  let footer_color = if app.snapshot.problems.is_empty() { Color::White } else { Color::Red };
  let footer = Paragraph::new(footer_text)
    .style(Style::default().fg(footer_color))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn render_fleet<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .snapshot
    .workers
    .iter()
    .map(|w| {
      let (label, color) = match w.status {
        WorkerState::Running => ("running", Color::Green),
        WorkerState::Offline => ("offline", Color::Red),
      };
      ListItem::new(vec![
        Spans::from(vec![
          Span::styled(format!("{} ", w.name), Style::default().add_modifier(Modifier::BOLD)),
          Span::styled(label, Style::default().fg(color)),
          Span::raw(format!("  {}", w.ip)),
        ]),
        Spans::from(Span::raw(format!(
          "cpu {:.1}% | mem {:.1}% | running {} | done {} | seen {}",
          w.cpu_load,
          w.mem_used,
          w.running_count,
          w.task_count,
          w.update_time.map(|t| t.format("%H:%M:%S").to_string()).unwrap_or_else(|| "never".to_string())
        ))),
      ])
    })
    .collect();
  let title = format!("Workers ({})", app.snapshot.workers.len());
  let list = List::new(items).block(Block::default().borders(Borders::ALL).title(title));
  f.render_widget(list, area);
}

fn render_queue<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let live = app.snapshot.workers.iter().filter(|w| w.status == WorkerState::Running).count();
  let running: u64 = app.snapshot.workers.iter().map(|w| w.running_count).sum();
  let lines = vec![
    Spans::from(Span::styled(
      format!("Pending tasks: {}", app.snapshot.pending),
      Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
    )),
    Spans::from(Span::raw(format!("Running tasks: {running}"))),
    Spans::from(Span::raw(format!("Live workers: {live}"))),
  ];
  let body = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Task Queue"));
  f.render_widget(body, area);
}

fn render_audit<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .snapshot
    .audit
    .iter()
    .map(|entry| {
      let who = if entry.username.is_empty() { "-" } else { entry.username.as_str() };
      ListItem::new(Spans::from(vec![
        Span::styled(entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(), Style::default().fg(Color::Green)),
        Span::raw(format!(" [{}] {} - {}", entry.log_type.as_str(), who, entry.message)),
      ]))
    })
    .collect();
  let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Audit Log"));
  f.render_widget(list, area);
}
