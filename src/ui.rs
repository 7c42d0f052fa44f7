use std::fmt::Write as _;
use std::io::{Write, stdout};
use std::path::Path;

use anyhow::Result;
use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::execute;
use crossterm::style::{Color, Stylize};
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};

use crate::revision::{EnrichmentState, Revision};
use crate::session::{Session, SessionState};
use crate::util::{expand_tabs, progress_bar, truncate};

const FOOTER_ROWS: u16 = 1;
const TAB_WIDTH: usize = 4;
const AUTHOR_COLUMN: usize = 12;
const DATE_COLUMN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    #[default]
    Annotations,
    Patch,
}

#[derive(Debug, Clone, Default)]
pub struct ViewState {
    pub mode: ViewMode,
    pub scroll: usize,
}

impl ViewState {
    pub fn toggle_mode(&mut self) {
        self.mode = match self.mode {
            ViewMode::Annotations => ViewMode::Patch,
            ViewMode::Patch => ViewMode::Annotations,
        };
        self.scroll = 0;
    }

    pub fn scroll_by(&mut self, delta: isize, content_len: usize) {
        let max = content_len.saturating_sub(1) as isize;
        self.scroll = (self.scroll as isize + delta).clamp(0, max.max(0)) as usize;
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameBudget {
    height: u16,
    footer_rows: u16,
}

impl FrameBudget {
    fn new(height: u16) -> Self {
        Self {
            height,
            footer_rows: FOOTER_ROWS.min(height),
        }
    }

    fn body_bottom(self) -> u16 {
        self.height.saturating_sub(self.footer_rows)
    }
}

pub struct RenderData<'a> {
    pub file: Option<&'a Path>,
    pub state: SessionState,
    pub cursor: Option<usize>,
    pub total: usize,
    pub current: Option<&'a Revision>,
    pub progress: (usize, usize),
    pub in_flight: usize,
    pub last_error: Option<&'a str>,
    pub view: &'a ViewState,
}

impl<'a> RenderData<'a> {
    pub fn from_session(session: &'a Session, view: &'a ViewState) -> Self {
        Self {
            file: session.file_path(),
            state: session.state(),
            cursor: session.cursor(),
            total: session.revisions().len(),
            current: session.current_revision(),
            progress: session.enrichment_progress(),
            in_flight: session.in_flight_details(),
            last_error: session.last_error(),
            view,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyLine {
    pub text: String,
    pub highlight: bool,
}

impl BodyLine {
    fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            highlight: false,
        }
    }
}

pub fn enter_terminal() -> Result<()> {
    let mut out = stdout();
    terminal::enable_raw_mode()?;
    execute!(out, EnterAlternateScreen, Hide)?;
    Ok(())
}

pub fn leave_terminal() -> Result<()> {
    let mut out = stdout();
    execute!(out, Show, LeaveAlternateScreen)?;
    terminal::disable_raw_mode()?;
    Ok(())
}

pub fn draw(data: &RenderData<'_>) -> Result<()> {
    let mut out = stdout();
    let (width, height) = terminal::size()?;
    if width == 0 || height == 0 {
        return Ok(());
    }

    let budget = FrameBudget::new(height);
    let max_body_row = budget.body_bottom();
    let w = width as usize;

    execute!(out, MoveTo(0, 0), Clear(ClearType::All))?;

    let mut row = 0u16;
    for line in header_lines(data, w) {
        if !write_line(&mut out, &mut row, max_body_row, w, &line)? {
            break;
        }
    }

    let title = match data.view.mode {
        ViewMode::Annotations => "Annotations",
        ViewMode::Patch => "Patch",
    };
    let _ = write_line(&mut out, &mut row, max_body_row, w, &hr(title, w))?;

    for line in body_lines(data).iter().skip(data.view.scroll) {
        let written = if line.highlight {
            write_styled_line(&mut out, &mut row, max_body_row, w, &line.text)?
        } else {
            write_line(&mut out, &mut row, max_body_row, w, &line.text)?
        };
        if !written {
            break;
        }
    }

    render_footer(&mut out, w, height)?;
    out.flush()?;
    Ok(())
}

/// Cheap fingerprint of everything `draw` shows; unchanged frames are skipped.
pub fn frame_signature(data: &RenderData<'_>) -> String {
    let mut signature = String::with_capacity(128);
    let _ = write!(
        signature,
        "{}|{:?}|{:?}|{}|{:?}|{}|{:?}|{}|{}|",
        data.file.map(|path| path.display().to_string()).unwrap_or_default(),
        data.state,
        data.cursor,
        data.total,
        data.progress,
        data.in_flight,
        data.view.mode,
        data.view.scroll,
        data.last_error.unwrap_or(""),
    );
    if let Some(revision) = data.current {
        let _ = write!(
            signature,
            "{}:{:?}:{}",
            revision.id,
            revision.enrichment,
            revision.display_date()
        );
    }
    signature
}

pub fn header_lines(data: &RenderData<'_>, width: usize) -> Vec<String> {
    let mut lines = vec![hr("timelapse", width)];
    lines.push(kv_line(
        "File",
        &data
            .file
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "(none)".to_string()),
    ));

    let Some(revision) = data.current else {
        return lines;
    };

    let position = data.cursor.map(|index| index + 1).unwrap_or(0);
    lines.push(kv_line(
        "Revision",
        &format!(
            "{}:{} on {} ({position}/{})",
            revision.id, revision.node, revision.branch, data.total
        ),
    ));
    lines.push(kv_line(
        "Author",
        &format!("{} ({})", revision.author, revision.age),
    ));
    lines.push(kv_line("Committed", &revision.committed_date));
    if let Some(merged) = &revision.merged_date {
        let summary = revision.base_summary.as_deref().unwrap_or("");
        lines.push(kv_line("Mainline", &format!("{merged} {summary}")));
    }
    lines.push(kv_line("Summary", &revision.description));

    let (enriched, total) = data.progress;
    let bar_width = if width >= 100 { 24 } else { 12 };
    let mut details = format!(
        "[{}] {enriched}/{total}",
        progress_bar(enriched, total, bar_width)
    );
    if data.in_flight > 0 {
        let _ = write!(details, " ({} in flight)", data.in_flight);
    }
    lines.push(kv_line("Details", &details));

    lines
}

pub fn body_lines(data: &RenderData<'_>) -> Vec<BodyLine> {
    let Some(revision) = data.current else {
        let message = match (data.state, data.file, data.last_error) {
            (SessionState::FetchingList, _, _) => "fetching revisions...".to_string(),
            (_, _, Some(error)) => format!("no revisions: {error}"),
            (_, None, _) => "no file selected".to_string(),
            (_, Some(_), None) => "no revisions found".to_string(),
        };
        return vec![BodyLine::plain(message)];
    };

    if !revision.is_enriched() {
        let message = match revision.enrichment {
            EnrichmentState::Failed { attempts } => {
                format!("fetching annotations... (failed {attempts}x)")
            }
            _ => "fetching annotations...".to_string(),
        };
        return vec![BodyLine::plain(message)];
    }

    match data.view.mode {
        ViewMode::Patch => revision
            .patch
            .as_deref()
            .unwrap_or("")
            .lines()
            .map(|line| BodyLine {
                highlight: line.starts_with('+') && !line.starts_with("+++"),
                text: expand_tabs(line, TAB_WIDTH),
            })
            .collect(),
        ViewMode::Annotations => {
            let number_width = revision.annotations.len().to_string().len();
            revision
                .annotations
                .iter()
                .enumerate()
                .map(|(index, line)| BodyLine {
                    text: format!(
                        "{:>number_width$} {:<AUTHOR_COLUMN$} {:<DATE_COLUMN$} | {}",
                        index + 1,
                        truncate(&line.author, AUTHOR_COLUMN),
                        truncate(&line.date, DATE_COLUMN),
                        expand_tabs(&line.code, TAB_WIDTH),
                    ),
                    highlight: revision.introduced(line),
                })
                .collect()
        }
    }
}

fn render_footer(out: &mut impl Write, width: usize, height: u16) -> Result<()> {
    if height == 0 {
        return Ok(());
    }

    execute!(out, MoveTo(0, height - 1), Clear(ClearType::CurrentLine))?;
    let help = if width >= 90 {
        "Left/Right revision | Home/End first/last | Up/Down/PgUp/PgDn scroll | p patch | r refresh | q quit"
    } else {
        "<-/-> rev | p patch | r refresh | q quit"
    };
    write!(out, "{}", truncate(help, width).dark_grey())?;
    Ok(())
}

fn write_line(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    width: usize,
    text: &str,
) -> Result<bool> {
    if *row >= max_body_row {
        return Ok(false);
    }

    execute!(out, MoveTo(0, *row), Clear(ClearType::CurrentLine))?;
    write!(out, "{}", truncate(text, width))?;
    *row += 1;
    Ok(true)
}

fn write_styled_line(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    width: usize,
    text: &str,
) -> Result<bool> {
    if *row >= max_body_row {
        return Ok(false);
    }

    execute!(out, MoveTo(0, *row), Clear(ClearType::CurrentLine))?;
    write!(out, "{}", truncate(text, width).with(Color::Green).bold())?;
    *row += 1;
    Ok(true)
}

fn kv_line(label: &str, value: &str) -> String {
    format!("{label:<10}: {value}")
}

fn hr(title: &str, width: usize) -> String {
    if width == 0 {
        return String::new();
    }

    let core = format!(" {title} ");
    let core_len = core.chars().count();
    if core_len >= width {
        return truncate(title, width);
    }

    let side = (width - core_len) / 2;
    let right = width - core_len - side;
    format!("{}{}{}", "-".repeat(side), core, "-".repeat(right))
}
