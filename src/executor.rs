use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, unbounded};
use tracing::{debug, warn};

use crate::request::StopSignal;

pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;
// Killed by a signal.
pub const SIGNAL_EXIT_CODE: i32 = -2;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const READ_CHUNK_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", display_arg(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", display_arg(arg))?;
        }
        Ok(())
    }
}

fn display_arg(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|ch| ch.is_whitespace() || ch == '"') {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    pub exit_code: i32,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn spawn_failure() -> Self {
        Self {
            text: String::new(),
            exit_code: SPAWN_FAILURE_EXIT_CODE,
            cancelled: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.cancelled
    }

    pub fn is_spawn_failure(&self) -> bool {
        self.exit_code == SPAWN_FAILURE_EXIT_CODE && !self.cancelled
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &CommandLine, working_dir: &Path, stop: &StopSignal) -> CommandOutput;
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    poll_interval: Duration,
}

impl ProcessRunner {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, command: &CommandLine, working_dir: &Path, stop: &StopSignal) -> CommandOutput {
        execute(command, working_dir, stop, self.poll_interval)
    }
}

/// Spawns `command` in `working_dir` and collects its merged output.
///
/// Returns as soon as the process has exited and the pipe has no more
/// buffered bytes, or when `stop` is raised, in which case the child is
/// killed and reaped and whatever was captured so far is returned.
pub fn execute(
    command: &CommandLine,
    working_dir: &Path,
    stop: &StopSignal,
    poll_interval: Duration,
) -> CommandOutput {
    if stop.is_stop_requested() {
        return CommandOutput {
            text: String::new(),
            exit_code: SIGNAL_EXIT_CODE,
            cancelled: true,
        };
    }

    let (mut child, reader) = match spawn_merged(command, working_dir) {
        Ok(spawned) => spawned,
        Err(err) => {
            warn!(command = %command, error = %err, "failed to spawn command");
            return CommandOutput::spawn_failure();
        }
    };
    debug!(command = %command, pid = child.id(), "command started");

    let chunks = spawn_pipe_reader(reader);
    let mut buffer: Vec<u8> = Vec::new();
    let mut pipe_closed = false;

    loop {
        if stop.is_stop_requested() {
            terminate(&mut child);
            drain_until_quiet(&chunks, &mut buffer, poll_interval);
            debug!(command = %command, "command cancelled");
            return CommandOutput {
                text: decode(buffer),
                exit_code: SIGNAL_EXIT_CODE,
                cancelled: true,
            };
        }

        if pipe_closed {
            thread::sleep(poll_interval);
        } else {
            match chunks.recv_timeout(poll_interval) {
                Ok(chunk) => buffer.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => pipe_closed = true,
            }
            if drain_available(&chunks, &mut buffer) {
                pipe_closed = true;
            }
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                if !pipe_closed {
                    drain_until_quiet(&chunks, &mut buffer, poll_interval);
                }
                let exit_code = status.code().unwrap_or(SIGNAL_EXIT_CODE);
                debug!(command = %command, exit_code, bytes = buffer.len(), "command finished");
                return CommandOutput {
                    text: decode(buffer),
                    exit_code,
                    cancelled: false,
                };
            }
            Ok(None) => {}
            Err(err) => {
                warn!(command = %command, error = %err, "failed to query child status");
                terminate(&mut child);
                return CommandOutput {
                    text: decode(buffer),
                    exit_code: SIGNAL_EXIT_CODE,
                    cancelled: false,
                };
            }
        }
    }
}

fn spawn_merged(command: &CommandLine, working_dir: &Path) -> io::Result<(Child, io::PipeReader)> {
    let (reader, writer) = io::pipe()?;
    let writer_for_stderr = writer.try_clone()?;

    let mut process = Command::new(&command.program);
    process
        .args(&command.args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(writer)
        .stderr(writer_for_stderr);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        process.creation_flags(CREATE_NO_WINDOW);
    }

    let child = process.spawn()?;
    // The parent's copies of the write end live in `process`; they must be
    // closed or the reader never sees EOF.
    drop(process);
    Ok((child, reader))
}

fn spawn_pipe_reader(mut reader: io::PipeReader) -> Receiver<Vec<u8>> {
    let (tx, rx) = unbounded();
    let spawned = thread::Builder::new()
        .name("scm pipe reader".to_string())
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK_BYTES];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(read) => {
                        if tx.send(buf[..read].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "failed to start pipe reader; output will be lost");
    }
    rx
}

// True once the pipe is closed.
fn drain_available(chunks: &Receiver<Vec<u8>>, buffer: &mut Vec<u8>) -> bool {
    loop {
        match chunks.try_recv() {
            Ok(chunk) => buffer.extend_from_slice(&chunk),
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => return true,
        }
    }
}

fn drain_until_quiet(chunks: &Receiver<Vec<u8>>, buffer: &mut Vec<u8>, quiet: Duration) {
    loop {
        match chunks.recv_timeout(quiet) {
            Ok(chunk) => buffer.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn decode(buffer: Vec<u8>) -> String {
    String::from_utf8(buffer)
        .unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn command_line_display_quotes_arguments_with_spaces() {
        let command = CommandLine::new("hg")
            .args(["log", "-r"])
            .arg("ancestors(branch(.))")
            .arg("my file.rs");
        assert_eq!(
            command.to_string(),
            "hg log -r ancestors(branch(.)) \"my file.rs\""
        );
    }

    #[test]
    fn missing_program_is_a_spawn_failure() {
        let tmp = tempfile::TempDir::new().expect("temp dir");
        let output = execute(
            &CommandLine::new("timelapse-definitely-missing-binary"),
            tmp.path(),
            &StopSignal::new(),
            DEFAULT_POLL_INTERVAL,
        );
        assert!(output.is_spawn_failure());
        assert!(output.text.is_empty());
        assert!(!output.is_success());
    }

    #[test]
    fn pre_cancelled_stop_signal_skips_spawn() {
        let tmp = tempfile::TempDir::new().expect("temp dir");
        let stop = StopSignal::new();
        stop.request_stop();
        let output = execute(
            &CommandLine::new("timelapse-definitely-missing-binary"),
            tmp.path(),
            &stop,
            DEFAULT_POLL_INTERVAL,
        );
        assert!(output.cancelled);
    }

    #[cfg(unix)]
    fn sh(script: &str) -> CommandLine {
        CommandLine::new("sh").arg("-c").arg(script)
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout_and_stderr_in_one_stream() {
        let tmp = tempfile::TempDir::new().expect("temp dir");
        let output = execute(
            &sh("echo out; echo err 1>&2"),
            tmp.path(),
            &StopSignal::new(),
            DEFAULT_POLL_INTERVAL,
        );
        assert!(output.is_success());
        assert!(output.text.contains("out\n"));
        assert!(output.text.contains("err\n"));
    }

    #[cfg(unix)]
    #[test]
    fn reports_non_zero_exit_code() {
        let tmp = tempfile::TempDir::new().expect("temp dir");
        let output = execute(
            &sh("printf partial; exit 3"),
            tmp.path(),
            &StopSignal::new(),
            DEFAULT_POLL_INTERVAL,
        );
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.text, "partial");
        assert!(!output.is_success());
        assert!(!output.is_spawn_failure());
    }

    #[cfg(unix)]
    #[test]
    fn runs_in_requested_working_directory() {
        let tmp = tempfile::TempDir::new().expect("temp dir");
        std::fs::write(tmp.path().join("marker.txt"), "here").expect("write marker");
        let output = execute(
            &sh("cat marker.txt"),
            tmp.path(),
            &StopSignal::new(),
            DEFAULT_POLL_INTERVAL,
        );
        assert_eq!(output.text, "here");
    }

    #[cfg(unix)]
    #[test]
    fn collects_output_larger_than_the_pipe_buffer() {
        let tmp = tempfile::TempDir::new().expect("temp dir");
        let output = execute(
            &sh("i=0; while [ $i -lt 5000 ]; do echo line-$i; i=$((i+1)); done"),
            tmp.path(),
            &StopSignal::new(),
            DEFAULT_POLL_INTERVAL,
        );
        assert!(output.is_success());
        assert_eq!(output.text.lines().count(), 5000);
        assert_eq!(output.text.lines().last(), Some("line-4999"));
    }

    #[cfg(unix)]
    #[test]
    fn stop_request_kills_child_and_leaves_no_orphan() {
        let tmp = tempfile::TempDir::new().expect("temp dir");
        let pid_file = tmp.path().join("child.pid");
        let script = format!("echo $$ > '{}'; echo started; exec sleep 30", pid_file.display());
        let stop = StopSignal::new();
        let trigger = stop.clone();
        let pid_path = pid_file.clone();

        let stopper = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !pid_path.exists() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            thread::sleep(Duration::from_millis(50));
            trigger.request_stop();
        });

        let started = Instant::now();
        let output = execute(&sh(&script), tmp.path(), &stop, DEFAULT_POLL_INTERVAL);
        stopper.join().expect("stopper thread");

        assert!(output.cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(output.text.contains("started"));

        let pid = std::fs::read_to_string(&pid_file).expect("pid file");
        let alive = Command::new("kill")
            .arg("-0")
            .arg(pid.trim())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        assert!(!alive, "child process {} survived cancellation", pid.trim());
    }
}
