//! Interactive terminal display: the tunnel table and its key bindings.
//!
//! The display only reads supervisor snapshots and calls named actions;
//! it never touches the mutable core state. Because it runs on the same
//! current-thread runtime as the supervisor, reads can never observe a
//! half-applied mutation.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use futures_util::StreamExt as _;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::Constraint;
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, Cell, Row, Table};
use ratatui::{Frame, Terminal};
use tracing::warn;

use crate::error::Result;
use crate::registry::{TunnelHealth, TunnelRow};
use crate::supervisor::TunnelSupervisor;

const HEADERS: [&str; 6] = ["NAME", "ADDRESS", "PORT", "STATUS", "STDOUT", "STDERR"];

/// Styles resolved from the config's `[color]` table. Values are terminal
/// color numbers; `-1` means the terminal default.
struct Palette {
    header: Style,
    active: Style,
    disabled: Style,
    unknown: Style,
    timeout: Style,
    down: Style,
    frame: Style,
}

fn slot(colors: &BTreeMap<String, i32>, key: &str, fallback: Color) -> Color {
    match colors.get(key) {
        Some(n) if (0..=255).contains(n) => Color::Indexed(*n as u8),
        Some(_) => Color::Reset,
        None => fallback,
    }
}

fn pair(colors: &BTreeMap<String, i32>, name: &str, fg: Color) -> Style {
    let style = Style::default().fg(slot(colors, &format!("{name}_fg"), fg));
    match slot(colors, &format!("{name}_bg"), Color::Reset) {
        Color::Reset => style,
        bg => style.bg(bg),
    }
}

impl Palette {
    fn from_colors(colors: &BTreeMap<String, i32>) -> Self {
        Self {
            header: pair(colors, "header", Color::Cyan).add_modifier(Modifier::BOLD),
            active: pair(colors, "active", Color::Green),
            disabled: pair(colors, "disabled", Color::DarkGray),
            unknown: pair(colors, "unknown", Color::Yellow),
            timeout: pair(colors, "timeout", Color::Magenta),
            down: pair(colors, "down", Color::Red),
            frame: pair(colors, "box", Color::Gray),
        }
    }

    fn row_style(&self, row: &TunnelRow) -> Style {
        if !row.live {
            return self.disabled;
        }
        match row.health {
            TunnelHealth::Up => self.active,
            TunnelHealth::Down => self.down,
            TunnelHealth::Unknown => self.unknown,
            TunnelHealth::Timeout => self.timeout,
        }
    }
}

/// The interactive view over one supervisor.
pub struct Display {
    supervisor: Arc<TunnelSupervisor>,
    show_header: bool,
    redraw_delay: Duration,
    selected: usize,
}

impl Display {
    pub fn new(supervisor: Arc<TunnelSupervisor>, show_header: bool, redraw_delay: Duration) -> Self {
        Self {
            supervisor,
            show_header,
            redraw_delay,
            selected: 0,
        }
    }

    /// Take over the terminal and run until the quit action. The terminal
    /// is restored before the result propagates.
    pub async fn run(mut self) -> Result<()> {
        let mut terminal = setup_terminal()?;
        let result = self.event_loop(&mut terminal).await;
        restore_terminal(&mut terminal)?;
        result
    }

    async fn event_loop(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    ) -> Result<()> {
        let mut events = EventStream::new();
        let mut redraw = tokio::time::interval(self.redraw_delay);

        loop {
            let rows = self.supervisor.snapshot();
            if !rows.is_empty() {
                self.selected = self.selected.min(rows.len() - 1);
            }
            let palette = Palette::from_colors(&self.supervisor.colors());
            terminal.draw(|frame| {
                render(frame, &rows, &palette, self.selected, self.show_header);
            })?;

            tokio::select! {
                _ = redraw.tick() => {}
                maybe_event = events.next() => match maybe_event {
                    Some(Ok(Event::Key(key)))
                        if matches!(key.kind, KeyEventKind::Press | KeyEventKind::Repeat) =>
                    {
                        if self.handle_key(key, &rows).await {
                            return Ok(());
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!("terminal event error: {}", e),
                    None => return Ok(()),
                },
            }
        }
    }

    /// Map a key to an action. Returns true when the loop should exit.
    async fn handle_key(&mut self, key: KeyEvent, rows: &[TunnelRow]) -> bool {
        if key.code == KeyCode::Char('q') {
            self.supervisor.shutdown().await;
            return true;
        }
        if rows.is_empty() {
            return false;
        }

        let selected_name = &rows[self.selected].name;
        match key.code {
            KeyCode::Char('j') | KeyCode::Down => {
                self.selected = (self.selected + 1) % rows.len();
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.selected = (self.selected + rows.len() - 1) % rows.len();
            }
            KeyCode::Char('g') => self.selected = 0,
            KeyCode::Char('G') => self.selected = rows.len() - 1,
            KeyCode::Char('r') => self.supervisor.restart(selected_name).await,
            KeyCode::Char('s') => self.supervisor.toggle(selected_name).await,
            KeyCode::Char('t') => self.supervisor.force_test(selected_name),
            _ => {}
        }
        false
    }
}

fn render(frame: &mut Frame, rows: &[TunnelRow], palette: &Palette, selected: usize, show_header: bool) {
    let table_rows = rows.iter().enumerate().map(|(i, row)| {
        let mut style = palette.row_style(row);
        if i == selected {
            style = style.add_modifier(Modifier::REVERSED);
        }
        Row::new(vec![
            Cell::from(row.name.clone()),
            Cell::from(row.address.clone()),
            Cell::from(row.port.to_string()),
            Cell::from(row.health.label()),
            Cell::from(row.stdout.clone()),
            Cell::from(row.stderr.clone()),
        ])
        .style(style)
    });

    let widths = column_widths(rows);
    let mut table = Table::new(table_rows, widths).column_spacing(2).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(palette.frame),
    );
    if show_header {
        table = table.header(Row::new(HEADERS.to_vec()).style(palette.header));
    }

    frame.render_widget(table, frame.size());
}

/// Size the first columns to their content, in the manner of a columnar
/// printer, and let the output columns share what is left.
fn column_widths(rows: &[TunnelRow]) -> Vec<Constraint> {
    let mut name = HEADERS[0].len();
    let mut address = HEADERS[1].len();
    let mut port = HEADERS[2].len();
    for row in rows {
        name = name.max(row.name.len());
        address = address.max(row.address.len());
        port = port.max(row.port.to_string().len());
    }
    vec![
        Constraint::Length(name as u16),
        Constraint::Length(address as u16),
        Constraint::Length(port as u16),
        Constraint::Length(6),
        Constraint::Min(12),
        Constraint::Min(12),
    ]
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
