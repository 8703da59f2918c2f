//! Runs one external process for a job, streaming its merged output into the
//! job's event channel as `log` lines.
//!
//! The child stays owned by [`run`]; the job only holds a [`ProcessHandle`],
//! which is registered for exactly as long as the child is alive. A cancel
//! request goes through that handle: graceful terminate first, then a kill
//! that `run` carries out on the child itself.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Split};
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

use crate::error::RenderError;
use crate::job::{Job, ProcessHandle};

const SPAWN_RETRIES: u32 = 5;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(50);

static CONTROL_SEQUENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\\-_]|\[[0-?]*[ -/]*[@-~])").expect("valid control sequence pattern")
});

/// Removes terminal escape sequences (colours, cursor movement) from `text`.
pub fn strip_ansi(text: &str) -> String {
    CONTROL_SEQUENCE.replace_all(text, "").into_owned()
}

/// Spawns `program` with `args`, forwards every output line to `job`, and
/// returns the exit status once the process is gone.
#[instrument(skip_all, fields(job_id = %job.id(), program = %program.display()))]
pub async fn run<I, S>(
    job: &Job,
    program: &Path,
    args: I,
    workdir: Option<&Path>,
) -> Result<ExitStatus, RenderError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    if job.stop_requested() {
        return Err(RenderError::Stopped);
    }

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    // Own process group, so terminate and kill reach helpers the tool forks.
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let mut child = spawn(&mut cmd).await.map_err(|source| RenderError::Spawn {
        program: program.to_path_buf(),
        source,
    })?;
    let handle = ProcessHandle::new(child.id());
    debug!(pid = ?handle.pid(), "Render process started");
    let _guard = job.attach_process(handle.clone());

    let mut stdout = child.stdout.take().map(|out| BufReader::new(out).split(b'\n'));
    let mut stderr = child.stderr.take().map(|err| BufReader::new(err).split(b'\n'));
    let mut status = None;
    let mut killed = false;

    // A stop that landed while spawning found no process to signal.
    if job.stop_requested() {
        debug!(pid = ?handle.pid(), "Stop requested during spawn, killing render process");
        killed = true;
        force_kill(&mut child, handle.pid());
    }

    let status = loop {
        tokio::select! {
            chunk = next_chunk(&mut stdout), if stdout.is_some() => {
                if let Some(chunk) = chunk {
                    forward(job, &chunk);
                }
            }
            chunk = next_chunk(&mut stderr), if stderr.is_some() => {
                if let Some(chunk) = chunk {
                    forward(job, &chunk);
                }
            }
            exit = child.wait(), if status.is_none() => {
                status = Some(exit?);
                handle.mark_exited();
            }
            () = handle.kill_requested(), if !killed => {
                killed = true;
                force_kill(&mut child, handle.pid());
            }
            () = job.stopped(), if status.is_some() && !killed => {}
        }

        let drained = stdout.is_none() && stderr.is_none();
        // A killed tree may leave orphans holding the pipes open; stop reading then.
        if let Some(status) = status {
            if drained || killed {
                break status;
            }
            // Stopped, but helpers it forked still hold the pipes.
            if job.stop_requested() {
                debug!(pid = ?handle.pid(), "Render process stopped, killing leftover group");
                kill_group(handle.pid());
                break status;
            }
        }
    };

    debug!(%status, killed, "Render process exited");
    Ok(status)
}

/// Spawns `cmd`, retrying briefly while the executable is still open for
/// writing elsewhere (ETXTBSY right after it was installed or updated).
async fn spawn(cmd: &mut Command) -> std::io::Result<Child> {
    let mut attempt = 0;
    loop {
        match cmd.spawn() {
            Err(err) if is_text_busy(&err) && attempt < SPAWN_RETRIES => {
                attempt += 1;
                tokio::time::sleep(SPAWN_RETRY_DELAY).await;
            }
            result => return result,
        }
    }
}

#[cfg(unix)]
fn is_text_busy(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(not(unix))]
fn is_text_busy(_err: &std::io::Error) -> bool {
    false
}

/// Next newline-terminated segment, or `None` (and the reader dropped) at EOF.
async fn next_chunk<R>(reader: &mut Option<Split<R>>) -> Option<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let segment = match reader.as_mut() {
        Some(split) => split.next_segment().await,
        None => return None,
    };
    match segment {
        Ok(Some(bytes)) => Some(bytes),
        Ok(None) => {
            *reader = None;
            None
        }
        Err(err) => {
            warn!(error = %err, "Failed reading render output");
            *reader = None;
            None
        }
    }
}

/// Emits each carriage-return separated piece of `chunk` as a log line.
fn forward(job: &Job, chunk: &[u8]) {
    let text = String::from_utf8_lossy(chunk);
    for piece in text.split('\r') {
        let line = strip_ansi(piece);
        let line = line.trim_end();
        if !line.is_empty() {
            job.emit_log(line);
        }
    }
}

fn force_kill(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    if let Err(err) = child.start_kill() {
        debug!(error = %err, "Render process already gone");
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// Sends `signal` to the process group led by `pid`. Returns whether the
/// signal was delivered.
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(-pgid, signal) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_colour_and_cursor_codes() {
        assert_eq!(strip_ansi("\x1b[32mok\x1b[0m"), "ok");
        assert_eq!(strip_ansi("\x1b[2K\x1b[1Gstep 3/8"), "step 3/8");
        assert_eq!(strip_ansi("\x1bMup"), "up");
        assert_eq!(strip_ansi("plain [text]"), "plain [text]");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn merges_stdout_and_stderr() {
        let job = Job::new();
        let status = run(
            &job,
            Path::new("/bin/sh"),
            ["-c", "echo out; echo err >&2; printf 'a\\rb\\n\\n'; exit 3"],
            None,
        )
        .await
        .unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(job.active_process().is_none());

        let mut lines = Vec::new();
        while let Some(event) = job
            .events()
            .recv_timeout(Duration::from_millis(10))
            .await
        {
            lines.push(event.payload["line"].as_str().unwrap().to_string());
        }
        lines.sort();
        assert_eq!(lines, vec!["a", "b", "err", "out"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stopped_job_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let job = Job::new();
        job.request_stop();

        let script = format!("touch '{}'", marker.display());
        let result = run(&job, Path::new("/bin/sh"), ["-c", script.as_str()], None).await;
        assert!(matches!(result, Err(RenderError::Stopped)));
        assert!(!marker.exists());
        assert!(job.active_process().is_none());
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let job = Job::new();
        let err = run(&job, Path::new("/definitely/not/here"), ["x"], None)
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Spawn { .. }));
        assert!(job.active_process().is_none());
    }
}
