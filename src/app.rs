use std::io::{self, IsTerminal};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tracing::{debug, info};

use crate::config::{self, RuntimeSettings, TimelapseConfig};
use crate::executor::ProcessRunner;
use crate::revision::Revision;
use crate::scm::ScmProxy;
use crate::session::{Session, SessionState};
use crate::ui::{self, RenderData, ViewMode, ViewState};
use crate::util::truncate;

const PAGE_LINES: isize = 20;
const REDRAW_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Continue,
    Refresh,
    Quit,
}

pub fn build_session(config: &TimelapseConfig, runtime: &RuntimeSettings) -> Session {
    let runner = Arc::new(ProcessRunner::new(runtime.poll_interval));
    let proxy = ScmProxy::new(runner, config.scm_settings(runtime));
    Session::new(proxy, config.session_settings())
}

pub fn run_interactive(
    config: &TimelapseConfig,
    runtime: &RuntimeSettings,
    file: Option<&Path>,
) -> Result<u8> {
    let stop = install_stop_signal()?;
    if !io::stdout().is_terminal() {
        let Some(file) = file else {
            println!("No interactive terminal detected; pass a file to `timelapse log`.");
            return Ok(2);
        };
        println!("No interactive terminal detected; printing the revision list instead.");
        return print_log(config, runtime, file, false, &stop);
    }

    let mut session = build_session(config, runtime);
    session.setup(file);
    info!(file = ?file, "interactive session started");

    let mut view = ViewState::default();
    let mut last_signature = String::new();
    let mut last_render_at = Instant::now() - REDRAW_INTERVAL;
    let mut force_redraw = true;

    ui::enter_terminal()?;

    let mut run = || -> Result<()> {
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }

            session.update();

            let render = RenderData::from_session(&session, &view);
            let signature = ui::frame_signature(&render);
            let should_draw = force_redraw
                || signature != last_signature
                || last_render_at.elapsed() >= REDRAW_INTERVAL;
            if should_draw {
                ui::draw(&render)?;
                last_signature = signature;
                last_render_at = Instant::now();
                force_redraw = false;
            }

            if event::poll(runtime.tick_interval)? {
                match event::read()? {
                    Event::Key(key) => match handle_key(&mut session, &mut view, key) {
                        KeyAction::Quit => break,
                        KeyAction::Refresh => {
                            session.refresh();
                            force_redraw = true;
                        }
                        KeyAction::Continue => {}
                    },
                    Event::Resize(_, _) => {
                        force_redraw = true;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    };

    let run_result = run();
    session.shutdown();
    let _ = ui::leave_terminal();
    run_result.map(|()| 0)
}

pub fn handle_key(session: &mut Session, view: &mut ViewState, key: KeyEvent) -> KeyAction {
    if key.kind == KeyEventKind::Release {
        return KeyAction::Continue;
    }

    let content_len = content_len(session.current_revision(), view.mode);
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => return KeyAction::Quit,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            return KeyAction::Quit;
        }
        KeyCode::Char('r') => return KeyAction::Refresh,
        KeyCode::Char('p') => view.toggle_mode(),
        KeyCode::Left => move_cursor(session, view, Session::previous),
        KeyCode::Right => move_cursor(session, view, Session::next),
        KeyCode::Home => move_cursor(session, view, Session::first),
        KeyCode::End => move_cursor(session, view, Session::last),
        KeyCode::Up => view.scroll_by(-1, content_len),
        KeyCode::Down => view.scroll_by(1, content_len),
        KeyCode::PageUp => view.scroll_by(-PAGE_LINES, content_len),
        KeyCode::PageDown => view.scroll_by(PAGE_LINES, content_len),
        _ => {}
    }
    KeyAction::Continue
}

fn move_cursor(session: &mut Session, view: &mut ViewState, movement: fn(&mut Session)) {
    let before = session.cursor();
    movement(session);
    if session.cursor() != before {
        view.scroll = 0;
    }
}

fn content_len(revision: Option<&Revision>, mode: ViewMode) -> usize {
    let Some(revision) = revision else {
        return 0;
    };
    match mode {
        ViewMode::Annotations => revision.annotations.len(),
        ViewMode::Patch => revision.patch.as_deref().map_or(0, |patch| patch.lines().count()),
    }
}

pub fn run_log(
    config: &TimelapseConfig,
    runtime: &RuntimeSettings,
    file: &Path,
    details: bool,
) -> Result<u8> {
    let stop = install_stop_signal()?;
    print_log(config, runtime, file, details, &stop)
}

fn print_log(
    config: &TimelapseConfig,
    runtime: &RuntimeSettings,
    file: &Path,
    details: bool,
    stop: &AtomicBool,
) -> Result<u8> {
    if !file.is_file() {
        anyhow::bail!("{} is not an existing file", file.display());
    }

    let mut session = build_session(config, runtime);
    session.setup(Some(file));
    while !stop.load(Ordering::Relaxed) {
        session.update();
        let settled = !session.is_fetching_revisions()
            && (!details || !session.is_fetching_details());
        if settled {
            break;
        }
        thread::sleep(runtime.tick_interval);
    }

    if stop.load(Ordering::Relaxed) {
        debug!("log interrupted");
        session.shutdown();
        return Ok(130);
    }

    if session.state() == SessionState::Empty {
        if let Some(error) = session.last_error() {
            eprintln!("timelapse: {error}");
            return Ok(1);
        }
        println!("no revisions found for {}", file.display());
        return Ok(0);
    }

    for revision in session.revisions() {
        println!("{}", format_log_line(revision));
        if details {
            for line in format_detail_lines(revision) {
                println!("    {line}");
            }
        }
    }

    let (enriched, total) = session.enrichment_progress();
    if details && enriched < total {
        eprintln!("timelapse: details unavailable for {} revision(s)", total - enriched);
    }
    session.shutdown();
    Ok(0)
}

pub fn format_log_line(revision: &Revision) -> String {
    format!(
        "{:>6}:{} {:<25} {:<14} {}",
        revision.id,
        revision.node,
        revision.display_date(),
        truncate(&revision.author, 14),
        revision.description
    )
}

fn format_detail_lines(revision: &Revision) -> Vec<String> {
    if !revision.is_enriched() {
        return vec!["details: unavailable".to_string()];
    }

    let mut lines = Vec::new();
    if let Some(merged) = &revision.merged_date {
        lines.push(format!(
            "mainline: {merged} {}",
            revision.base_summary.as_deref().unwrap_or("")
        ));
    }
    let introduced = revision
        .annotations
        .iter()
        .filter(|line| revision.introduced(line))
        .count();
    let (added, removed) = diffstat(revision.patch.as_deref().unwrap_or(""));
    lines.push(format!(
        "lines: {} ({introduced} from this revision), patch +{added} -{removed}",
        revision.annotations.len()
    ));
    lines
}

pub fn diffstat(patch: &str) -> (usize, usize) {
    patch.lines().fold((0, 0), |(added, removed), line| {
        if line.starts_with("+++") || line.starts_with("---") {
            (added, removed)
        } else if line.starts_with('+') {
            (added + 1, removed)
        } else if line.starts_with('-') {
            (added, removed + 1)
        } else {
            (added, removed)
        }
    })
}

pub fn doctor(config: &TimelapseConfig, runtime: &RuntimeSettings) -> Result<u8> {
    let mut issues = 0u8;

    println!("timelapse doctor");
    println!("config_path: {}", config::config_path().display());
    println!("log_path: {}", config::log_path().display());
    println!("hg_executable: {}", config.hg_executable);
    println!("mainline_branch: {}", config.mainline_branch);
    println!("include_merges: {}", config.include_merges);
    println!(
        "enrichment: pool {} | max attempts {}",
        config.enrichment_pool_size,
        if config.max_enrichment_attempts == 0 {
            "unlimited".to_string()
        } else {
            config.max_enrichment_attempts.to_string()
        }
    );
    println!(
        "timing: poll {}ms | dispose {}ms | tick {}ms",
        runtime.poll_interval.as_millis(),
        runtime.dispose_timeout.as_millis(),
        runtime.tick_interval.as_millis()
    );

    if command_available(&config.hg_executable) {
        println!("[OK] {} command available.", config.hg_executable);
    } else {
        issues += 1;
        println!("[WARN] {} command not found or not runnable.", config.hg_executable);
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn command_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}
