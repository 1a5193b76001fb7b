use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::app::{ProgressEvent, ProgressSink, ProgressSinkKind};
use crate::error::HobsError;

const EVENTS_MAX: usize = 8;
const LOGS_MAX: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Operational,
    Logs,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Submit,
    Poll,
    Download,
    Normalize,
    Mirror,
    Stage,
}

impl Phase {
    const ALL: [Phase; 6] = [
        Phase::Submit,
        Phase::Poll,
        Phase::Download,
        Phase::Normalize,
        Phase::Mirror,
        Phase::Stage,
    ];

    fn label(self) -> &'static str {
        match self {
            Phase::Submit => "Submit",
            Phase::Poll => "Poll",
            Phase::Download => "Download",
            Phase::Normalize => "Normalize",
            Phase::Mirror => "Mirror",
            Phase::Stage => "Stage",
        }
    }
}

#[derive(Debug)]
struct DashboardState {
    status: String,
    phase: Option<Phase>,
    status_checks: u32,
    latency_ms: Option<u128>,
    events: VecDeque<String>,
    logs: VecDeque<String>,
    view: View,
    started: Instant,
    active: bool,
}

/// Holds raw mode and the alternate screen; restores the terminal when dropped,
/// including on early `?` returns from the draw loop.
struct TerminalGuard {
    restore: fn(),
}

impl TerminalGuard {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        let guard = Self {
            restore: restore_terminal,
        };
        io::stdout().execute(EnterAlternateScreen)?;
        Ok(guard)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        (self.restore)();
    }
}

fn restore_terminal() {
    let _ = disable_raw_mode();
    let _ = io::stdout().execute(LeaveAlternateScreen);
}

pub struct Tui {
    kind: ProgressSinkKind,
    state: Arc<Mutex<DashboardState>>,
    log_scroll: u16,
}

struct TuiProgress {
    state: Arc<Mutex<DashboardState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            let message = event.message.trim().to_string();
            if let Some((phase, payload)) = parse_phase(&message) {
                if phase == Phase::Poll {
                    state.status_checks = state.status_checks.saturating_add(1);
                }
                state.phase = Some(phase);
                state.status = strip_latency(payload).to_string();
            } else {
                state.status = strip_latency(&message).to_string();
            }
            if let Some(latency) = parse_latency(&message) {
                state.latency_ms = Some(latency);
            }

            push_bounded(&mut state.events, message.clone(), EVENTS_MAX);
            push_bounded(
                &mut state.logs,
                format!("[{}] {message}", timestamp()),
                LOGS_MAX,
            );
        }
    }
}

impl Tui {
    pub fn new(kind: ProgressSinkKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(DashboardState {
                status: "starting".to_string(),
                phase: None,
                status_checks: 0,
                latency_ms: None,
                events: VecDeque::new(),
                logs: VecDeque::new(),
                view: View::Operational,
                started: Instant::now(),
                active: false,
            })),
            log_scroll: 0,
        }
    }

    /// Runs `f` on a worker thread while drawing its progress. `q`/`Esc` abandons the wait.
    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, HobsError> + Send + 'static,
        R: Send + 'static,
    {
        self.set_active(true);

        let _guard = TerminalGuard::enter().into_diagnostic()?;

        let backend = CrosstermBackend::new(io::stdout());
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        let outcome = loop {
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| draw_ui(frame, self, &state, tick))
                    .into_diagnostic()?;
            }

            match rx.try_recv() {
                Ok(result) => {
                    handle.join().ok();
                    break Ok(result);
                }
                Err(TryRecvError::Disconnected) => {
                    break Err("worker stopped before reporting a result");
                }
                Err(TryRecvError::Empty) => {}
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if self.handle_key(key) {
                        break Err("aborted while waiting for HOBS");
                    }
                }
            }

            tick = tick.wrapping_add(1);
        };

        self.set_active(false);

        match outcome {
            Ok(result) => result.map_err(miette::Report::new),
            Err(reason) => Err(miette::Report::msg(reason)),
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return true,
            KeyCode::F(1) | KeyCode::Char('?') => self.toggle_view(View::Help),
            KeyCode::F(4) | KeyCode::Char('l') => self.toggle_view(View::Logs),
            KeyCode::PageUp => self.scroll_logs(-5),
            KeyCode::PageDown => self.scroll_logs(5),
            _ => {}
        }
        false
    }

    fn toggle_view(&self, view: View) {
        if let Ok(mut state) = self.state.lock() {
            state.view = if state.view == view {
                View::Operational
            } else {
                view
            };
        }
    }

    fn set_active(&self, active: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.active = active;
            if active {
                state.started = Instant::now();
                state.status_checks = 0;
                state.latency_ms = None;
                state.phase = None;
            }
        }
    }

    fn scroll_logs(&mut self, delta: i16) {
        let max = self.state.lock().map(|state| state.logs.len()).unwrap_or(0);
        let max_scroll = max.saturating_sub(1) as i16;
        let next = (self.log_scroll as i16 + delta).clamp(0, max_scroll.max(0));
        self.log_scroll = next as u16;
    }
}

fn draw_ui(frame: &mut ratatui::Frame, tui: &Tui, state: &DashboardState, tick: usize) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(1),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(state, tui.kind, tick), chunks[0]);
    match state.view {
        View::Operational => {
            let main = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
                .split(chunks[1]);
            frame.render_widget(draw_status_panel(state), main[0]);
            frame.render_widget(draw_events_panel(state), main[1]);
        }
        View::Logs => frame.render_widget(draw_logs_view(state, tui.log_scroll), chunks[1]),
        View::Help => frame.render_widget(draw_help(), chunks[1]),
    }
    let footer = Paragraph::new(Line::from(Span::styled(
        "q/Esc abandon   l/F4 logs   ?/F1 help   PgUp/PgDn scroll",
        Style::default().fg(Color::DarkGray),
    )));
    frame.render_widget(footer, chunks[2]);
}

fn draw_header(state: &DashboardState, kind: ProgressSinkKind, tick: usize) -> Paragraph<'static> {
    let heartbeat = if state.active && tick % 2 == 0 { "*" } else { " " };
    let op_label = match kind {
        ProgressSinkKind::Submit => "Submit",
        ProgressSinkKind::Wait => "Wait",
        ProgressSinkKind::Fetch => "Fetch",
        ProgressSinkKind::Mirror => "Mirror",
        ProgressSinkKind::Stage => "Stage",
    };
    let line = Line::from(vec![
        Span::styled(
            "HOBS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw("   Op: "),
        Span::styled(op_label, Style::default().fg(Color::Cyan)),
        Span::raw("   "),
        Span::styled(heartbeat, Style::default().fg(Color::Green)),
    ]);
    Paragraph::new(vec![line])
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_status_panel(state: &DashboardState) -> Paragraph<'static> {
    let elapsed = state.started.elapsed().as_secs();
    let phases = Phase::ALL
        .iter()
        .map(|phase| {
            let (marker, color) = match state.phase {
                Some(current) if current == *phase => (">", Color::Cyan),
                _ => (" ", Color::Gray),
            };
            Span::styled(format!("{marker}{} ", phase.label()), Style::default().fg(color))
        })
        .collect::<Vec<_>>();
    let lines = vec![
        Line::from(phases),
        Line::from(""),
        Line::from(vec![
            Span::styled("Status: ", Style::default().fg(Color::Gray)),
            Span::raw(state.status.clone()),
        ]),
        Line::from(vec![
            Span::styled("Status checks: ", Style::default().fg(Color::Gray)),
            Span::raw(state.status_checks.to_string()),
        ]),
        Line::from(vec![
            Span::styled("Last latency: ", Style::default().fg(Color::Gray)),
            Span::raw(
                state
                    .latency_ms
                    .map(|value| format!("{value} ms"))
                    .unwrap_or_else(|| "n/a".to_string()),
            ),
        ]),
        Line::from(vec![
            Span::styled("Elapsed: ", Style::default().fg(Color::Gray)),
            Span::raw(format!(
                "{:02}:{:02}:{:02}",
                elapsed / 3600,
                (elapsed / 60) % 60,
                elapsed % 60
            )),
        ]),
    ];
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Request"))
        .wrap(Wrap { trim: true })
}

fn draw_events_panel(state: &DashboardState) -> Paragraph<'static> {
    let lines = state
        .events
        .iter()
        .map(|event| Line::from(event.clone()))
        .collect::<Vec<_>>();
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Events"))
        .wrap(Wrap { trim: true })
}

fn draw_logs_view(state: &DashboardState, scroll: u16) -> Paragraph<'static> {
    let lines = state
        .logs
        .iter()
        .map(|line| Line::from(line.clone()))
        .collect::<Vec<_>>();
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Logs"))
        .scroll((scroll, 0))
}

fn draw_help() -> Paragraph<'static> {
    let lines = vec![
        Line::from("Phases: Submit -> Poll -> Download -> Normalize -> Mirror / Stage"),
        Line::from("Polling re-checks the request on a fixed interval until SUCCESS or ERROR."),
        Line::from("Abandoning the wait leaves the request running on the HOBS side;"),
        Line::from("resume later with `hobs wait <request-id>`."),
    ];
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true })
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (label, payload) = rest.split_once(';')?;
    let phase = Phase::ALL
        .into_iter()
        .find(|phase| phase.label() == label.trim())?;
    Some((phase, payload.trim()))
}

fn parse_latency(message: &str) -> Option<u128> {
    message
        .split("latency_ms=")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse::<u128>().ok())
}

fn strip_latency(message: &str) -> &str {
    message
        .split_once(" latency_ms=")
        .map(|(head, _)| head)
        .unwrap_or(message)
}

fn push_bounded(buffer: &mut VecDeque<String>, item: String, max: usize) {
    buffer.push_back(item);
    while buffer.len() > max {
        buffer.pop_front();
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
