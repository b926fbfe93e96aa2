//! Spawning recipe commands.

use super::context::Context;
use crate::error::BuildError;
use anyhow::{Context as _, Result};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long pipes may stay open after a timed out tool was killed.
const KILL_GRACE: Duration = Duration::from_millis(200);

/// A fully expanded recipe, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl RecipeCommand {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn printable(&self) -> String {
        printable_command(&self.argv())
    }

    fn to_process(&self) -> std::process::Command {
        let mut process = std::process::Command::new(&self.program);
        process.args(&self.args);
        process.envs(self.env.iter().map(|(k, v)| (k, v)));
        if let Some(cwd) = &self.cwd {
            process.current_dir(cwd);
        }
        process
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Ignore,
    Capture,
    ShowIfVerbose,
    Show,
}

impl OutputMode {
    fn piped(self) -> bool {
        self != OutputMode::Ignore
    }

    fn forwarded(self, verbose: bool) -> bool {
        match self {
            OutputMode::Show => true,
            OutputMode::ShowIfVerbose => verbose,
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Kills and reaps the child unless it was waited on.
struct ChildGuard {
    child: Child,
    own_group: bool,
    reaped: bool,
}

impl ChildGuard {
    /// Wait for exit. `Ok(None)` means the timeout elapsed and the child
    /// was killed.
    fn wait(&mut self, timeout: Option<Duration>) -> std::io::Result<Option<ExitStatus>> {
        let Some(timeout) = timeout else {
            let status = self.child.wait()?;
            self.reaped = true;
            return Ok(Some(status));
        };
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.reaped = true;
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                self.kill();
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn kill(&mut self) {
        if !self.reaped {
            if self.own_group {
                let _ = std::process::Command::new("kill")
                    .args(["-KILL", "--", &format!("-{}", self.child.id())])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
            }
            let _ = self.child.kill();
            let _ = self.child.wait();
            self.reaped = true;
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    reader.map(|mut r| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf);
            buf
        })
    })
}

/// Join a reader. With a grace period, a reader whose pipe is still held
/// open by a stray descendant is abandoned once the grace runs out.
fn collect(handle: Option<JoinHandle<Vec<u8>>>, grace: Option<Duration>) -> Vec<u8> {
    let Some(handle) = handle else {
        return Vec::new();
    };
    if let Some(grace) = grace {
        let deadline = Instant::now() + grace;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                debug!("Abandoning output of a killed tool");
                return Vec::new();
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
    handle.join().unwrap_or_default()
}

/// Run `command`, routing its streams as requested. A non-zero exit is a
/// `ToolFailed` error carrying whatever stderr was read.
pub fn exec_command(
    ctx: &Context,
    command: &RecipeCommand,
    stdout_mode: OutputMode,
    stderr_mode: OutputMode,
) -> Result<ExecOutput> {
    if ctx.verbose {
        ctx.console.info(command.printable());
    }
    debug!("Spawning {}", command.program);

    let mut process = command.to_process();
    process.stdin(Stdio::null());
    // timed tools lead their own process group, so a timeout reaches every
    // descendant
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        if ctx.recipe_timeout.is_some() {
            process.process_group(0);
        }
    }
    process.stdout(if stdout_mode.piped() { Stdio::piped() } else { Stdio::null() });
    process.stderr(if stderr_mode.piped() { Stdio::piped() } else { Stdio::null() });

    let child = process
        .spawn()
        .with_context(|| format!("Failed to run {}", command.program))?;
    let mut guard = ChildGuard {
        child,
        own_group: cfg!(unix) && ctx.recipe_timeout.is_some(),
        reaped: false,
    };
    let out_reader = drain(guard.child.stdout.take());
    let err_reader = drain(guard.child.stderr.take());

    let status = guard
        .wait(ctx.recipe_timeout)
        .with_context(|| format!("Failed to wait for {}", command.program))?;
    let grace = status.is_none().then_some(KILL_GRACE);
    let output = ExecOutput {
        stdout: collect(out_reader, grace),
        stderr: collect(err_reader, grace),
    };

    if stdout_mode.forwarded(ctx.verbose) {
        ctx.console.write_stdout(&output.stdout);
    }
    if stderr_mode.forwarded(ctx.verbose) {
        ctx.console.write_stderr(&output.stderr);
    }

    match status {
        None => Err(BuildError::ToolTimeout {
            command: command.printable(),
            timeout: ctx.recipe_timeout.unwrap_or_default(),
        }
        .into()),
        Some(status) if !status.success() => Err(BuildError::ToolFailed {
            command: command.printable(),
            status: status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .into()),
        Some(_) => Ok(output),
    }
}

/// Render an argv for display, quoting parts that would not survive a
/// shell round trip.
pub fn printable_command(parts: &[String]) -> String {
    parts
        .iter()
        .map(|part| {
            if part.is_empty() || part.contains([' ', '\t', '"']) {
                let escaped = part.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{escaped}\"")
            } else {
                part.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::context::Console;

    #[test]
    fn test_printable_command() {
        let parts: Vec<String> = [
            "/path/to/dir with spaces/cmd",
            "arg1",
            "arg-\"with\"-quotes",
            "specialchar-`~!@#$%^&*()-_=+[{]}\\|;:'\",<.>/?-argument",
            "arg   with spaces",
            "arg\twith\t\ttabs",
            "lastarg",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let expected = "\"/path/to/dir with spaces/cmd\"".to_string()
            + " arg1 \"arg-\\\"with\\\"-quotes\""
            + " \"specialchar-`~!@#$%^&*()-_=+[{]}\\\\|;:'\\\",<.>/?-argument\""
            + " \"arg   with spaces\" \"arg\twith\t\ttabs\""
            + " lastarg";
        assert_eq!(printable_command(&parts), expected);
        assert_eq!(printable_command(&["a".into(), String::new()]), "a \"\"");
    }

    #[cfg(unix)]
    fn sh(script: &str) -> RecipeCommand {
        RecipeCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: vec![("INOX_TEST_VALUE".into(), "42".into())],
            cwd: None,
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_capture_and_env() {
        let mut ctx = Context::new("/s", "a:b:c", "/b");
        let (console, out, err) = Console::captured();
        ctx.console = console;
        let output = exec_command(
            &ctx,
            &sh("echo $INOX_TEST_VALUE; echo oops >&2"),
            OutputMode::Capture,
            OutputMode::Show,
        )
        .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "42\n");
        assert_eq!(out.contents(), "");
        assert_eq!(err.contents(), "oops\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_failure_carries_stderr() {
        let mut ctx = Context::new("/s", "a:b:c", "/b");
        let (console, _out, _err) = Console::captured();
        ctx.console = console;
        let err = exec_command(
            &ctx,
            &sh("echo 'fatal error: Foo.h: No such file or directory' >&2; exit 3"),
            OutputMode::Ignore,
            OutputMode::Capture,
        )
        .unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::ToolFailed { stderr, .. }) => assert!(stderr.contains("Foo.h")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_timeout_kills_child() {
        let mut ctx = Context::new("/s", "a:b:c", "/b");
        ctx.recipe_timeout = Some(Duration::from_millis(100));
        let start = Instant::now();
        let err = exec_command(&ctx, &sh("exec sleep 5"), OutputMode::Ignore, OutputMode::Ignore)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ToolTimeout { .. })
        ));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_timeout_kills_shell_wrapped_tool() {
        let mut ctx = Context::new("/s", "a:b:c", "/b");
        let (console, out, _err) = Console::captured();
        ctx.console = console;
        ctx.recipe_timeout = Some(Duration::from_millis(100));
        let start = Instant::now();
        let err = exec_command(&ctx, &sh("sleep 3; echo done"), OutputMode::Capture, OutputMode::Show)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ToolTimeout { .. })
        ));
        assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
        assert_eq!(out.contents(), "");
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_verbose_echoes_command() {
        let mut ctx = Context::new("/s", "a:b:c", "/b");
        let (console, out, _err) = Console::captured();
        ctx.console = console;
        ctx.verbose = true;
        exec_command(&ctx, &sh("echo hi"), OutputMode::ShowIfVerbose, OutputMode::Show).unwrap();
        let text = out.contents();
        assert!(text.starts_with("/bin/sh -c \"echo hi\"\n"));
        assert!(text.ends_with("hi\n"));
    }
}
