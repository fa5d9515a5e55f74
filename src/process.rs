//! subprocess execution
//!
//! every external tool is invoked through [`CommandRunner`] with a discrete
//! argument vector; nothing is ever handed to a shell.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::cancel::Cancellation;
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// what happens to a child's stdout/stderr
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// collect output for inspection
    Capture,
    /// inherit the caller's streams
    Stream,
    /// forward line by line to the caller's streams while collecting
    Tee,
}

/// a command to run
#[derive(Clone, Debug)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    mode: OutputMode,
    timeout: Option<Duration>,
    allow_failure: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            mode: OutputMode::Capture,
            timeout: None,
            allow_failure: false,
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

    pub fn mode(mut self, mode: OutputMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// return non-zero exits as [`Output`] instead of [`Error::CommandFailed`]
    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_mode(&self) -> OutputMode {
        self.mode
    }

    pub fn allows_failure(&self) -> bool {
        self.allow_failure
    }

    /// full argument vector, program first
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// result of a finished command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// turn a non-zero exit into [`Error::CommandFailed`]
    pub fn into_result(self, cmd: &Cmd) -> Result<Output> {
        if self.success() || cmd.allows_failure() {
            Ok(self)
        } else {
            Err(Error::CommandFailed {
                argv: cmd.argv(),
                exit_code: self.exit_code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// something that can run a [`Cmd`]
pub trait CommandRunner {
    fn run(&self, cmd: &Cmd) -> Result<Output>;
}

/// runs commands as child processes
///
/// polls the child so that a timeout or a cancellation request can stop it
pub struct ProcessRunner {
    cancel: Cancellation,
}

impl ProcessRunner {
    pub fn new(cancel: Cancellation) -> Self {
        Self { cancel }
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, cmd: &Cmd) -> Result<Output> {
        self.cancel.check()?;

        let (out, err) = match cmd.mode {
            OutputMode::Stream => (Stdio::inherit(), Stdio::inherit()),
            OutputMode::Capture | OutputMode::Tee => (Stdio::piped(), Stdio::piped()),
        };

        tracing::debug!(argv = ?cmd.argv(), "running");

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolNotFound(cmd.program.clone())
                } else {
                    Error::Io {
                        path: cmd.program.clone().into(),
                        source: e,
                    }
                }
            })?;

        let tee = cmd.mode == OutputMode::Tee;
        let stdout_reader = child.stdout.take().map(|s| {
            let forward: Option<Box<dyn Write + Send>> =
                tee.then(|| Box::new(std::io::stdout()) as _);
            spawn_reader(s, forward)
        });
        let stderr_reader = child.stderr.take().map(|s| {
            let forward: Option<Box<dyn Write + Send>> =
                tee.then(|| Box::new(std::io::stderr()) as _);
            spawn_reader(s, forward)
        });

        // readers of a killed child are left detached; grandchildren may
        // still hold the pipes open
        let status = self.wait(&mut child, cmd)?;

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);

        Output {
            exit_code: exit_code(status),
            stdout,
            stderr,
        }
        .into_result(cmd)
    }
}

impl ProcessRunner {
    fn wait(&self, child: &mut Child, cmd: &Cmd) -> Result<ExitStatus> {
        let deadline = cmd.timeout.map(|t| Instant::now() + t);

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => {
                    return Err(Error::Io {
                        path: cmd.program.clone().into(),
                        source: e,
                    })
                }
            }

            if self.cancel.is_cancelled() {
                tracing::warn!(argv = ?cmd.argv(), "cancelling running command");
                terminate(child);
                return Err(Error::Cancelled);
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    tracing::warn!(argv = ?cmd.argv(), "command timed out");
                    terminate(child);
                    return Err(Error::Timeout {
                        argv: cmd.argv(),
                        secs: cmd.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                    });
                }
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// SIGTERM, a grace period, then SIGKILL
fn terminate(child: &mut Child) {
    let pid = Pid::from_raw(child.id() as i32);
    if kill(pid, Signal::SIGTERM).is_ok() {
        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_reader<R>(stream: R, forward: Option<Box<dyn Write + Send>>) -> JoinHandle<String>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut collected = String::new();
        let mut reader = BufReader::new(stream);
        let mut forward = forward;
        let mut line = Vec::new();

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if let Some(out) = forward.as_mut() {
                        let _ = out.write_all(&line);
                        let _ = out.flush();
                    }
                    collected.push_str(&String::from_utf8_lossy(&line));
                }
            }
        }

        collected
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Cancellation::new())
    }

    #[test]
    fn test_cmd_argv() {
        let cmd = Cmd::new("ostree")
            .arg("summary")
            .args(["--repo=/srv/ostree/x", "--update"]);
        assert_eq!(
            cmd.argv(),
            vec!["ostree", "summary", "--repo=/srv/ostree/x", "--update"]
        );
        assert_eq!(cmd.get_mode(), OutputMode::Capture);
    }

    #[test]
    fn test_capture_stdout() {
        let out = runner()
            .run(&Cmd::new("sh").args(["-c", "echo hello; echo oops >&2"]))
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
    }

    #[test]
    fn test_tee_collects_output() {
        let out = runner()
            .run(
                &Cmd::new("sh")
                    .args(["-c", "echo one; echo two"])
                    .mode(OutputMode::Tee),
            )
            .unwrap();
        assert_eq!(out.stdout, "one\ntwo\n");
    }

    #[test]
    fn test_arguments_are_not_shell_interpreted() {
        let out = runner()
            .run(&Cmd::new("echo").arg("$HOME; rm -rf /"))
            .unwrap();
        assert_eq!(out.stdout, "$HOME; rm -rf /\n");
    }

    #[test]
    fn test_failure_carries_diagnostics() {
        let err = runner()
            .run(&Cmd::new("sh").args(["-c", "echo partial; echo bad >&2; exit 7"]))
            .unwrap_err();

        match err {
            Error::CommandFailed {
                argv,
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(argv[0], "sh");
                assert_eq!(exit_code, 7);
                assert_eq!(stdout, "partial\n");
                assert_eq!(stderr, "bad\n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_allow_failure_returns_output() {
        let out = runner()
            .run(&Cmd::new("sh").args(["-c", "exit 3"]).allow_failure())
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
    }

    #[test]
    fn test_tool_not_found() {
        let err = runner()
            .run(&Cmd::new("definitely-not-a-real-tool-12345"))
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(ref t) if t == "definitely-not-a-real-tool-12345"));
    }

    #[test]
    fn test_timeout_kills_child() {
        let start = Instant::now();
        let err = runner()
            .run(
                &Cmd::new("sleep")
                    .arg("30")
                    .timeout(Some(Duration::from_millis(200))),
            )
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = Cancellation::new();
        cancel.cancel();
        let err = ProcessRunner::new(cancel)
            .run(&Cmd::new("true"))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_cancel_while_running() {
        let cancel = Cancellation::new();
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let err = ProcessRunner::new(cancel)
            .run(&Cmd::new("sleep").arg("30"))
            .unwrap_err();
        handle.join().unwrap();

        assert!(matches!(err, Error::Cancelled));
    }
}
