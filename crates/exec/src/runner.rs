use crate::prompt::{PromptResponse, ResponseTable};
use crate::{ExecError, Result};
use nix_bisect_protocol::CancelToken;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn index(self) -> usize {
        match self {
            Self::Stdout => 0,
            Self::Stderr => 1,
        }
    }
}

/// A non-interactive invocation of an external program.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
    responses: ResponseTable,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            responses: ResponseTable::default(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn responses(mut self, table: ResponseTable) -> Self {
        self.responses = table;
        self
    }

    pub fn program(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Shell-like rendering for log lines and error messages.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.responses.is_empty() {
            cmd.stdin(Stdio::null());
        } else {
            cmd.stdin(Stdio::piped());
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

#[derive(Debug, Clone, Default)]
pub struct Output {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Both streams interleaved in arrival order.
    pub combined: String,
    /// Prompts that were answered from the response table.
    pub answered: Vec<String>,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last `lines` non-empty lines of stderr, for error messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let tail: Vec<&str> = self
            .stderr
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        let start = tail.len().saturating_sub(lines);
        tail[start..].join("\n")
    }

    pub fn check(self, spec: &CommandSpec) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(ExecError::Failed {
            command: spec.display(),
            code: self.code,
            stderr: self.stderr_tail(20),
        })
    }
}

#[derive(Default)]
struct Capture {
    streams: [Vec<u8>; 2],
    combined: Vec<u8>,
    pending: [Vec<u8>; 2],
    pending_answered: [bool; 2],
    answered: Vec<String>,
}

impl Capture {
    /// Record a chunk, emit completed lines and return the first prompt the
    /// response table has an answer for.
    fn feed<F>(
        &mut self,
        stream: Stream,
        bytes: &[u8],
        on_line: &mut F,
        table: &ResponseTable,
    ) -> Option<(String, PromptResponse)>
    where
        F: FnMut(Stream, &str),
    {
        let idx = stream.index();
        self.streams[idx].extend_from_slice(bytes);
        self.combined.extend_from_slice(bytes);

        let mut hit = None;
        for &byte in bytes {
            if byte != b'\n' {
                self.pending[idx].push(byte);
                continue;
            }
            let line = String::from_utf8_lossy(&self.pending[idx]).into_owned();
            self.pending[idx].clear();
            on_line(stream, &line);
            if !self.pending_answered[idx] && hit.is_none() {
                hit = table.respond(&line).map(|r| (line.clone(), r.clone()));
            }
            self.pending_answered[idx] = false;
        }

        // Prompts usually lack a trailing newline; look at the partial line too.
        if hit.is_none() && !self.pending[idx].is_empty() && !self.pending_answered[idx] {
            let partial = String::from_utf8_lossy(&self.pending[idx]).into_owned();
            if let Some(response) = table.respond(&partial) {
                self.pending_answered[idx] = true;
                hit = Some((partial, response.clone()));
            }
        }
        hit
    }

    fn finish<F>(mut self, code: Option<i32>, on_line: &mut F) -> Output
    where
        F: FnMut(Stream, &str),
    {
        for stream in [Stream::Stdout, Stream::Stderr] {
            let idx = stream.index();
            if !self.pending[idx].is_empty() {
                let line = String::from_utf8_lossy(&self.pending[idx]).into_owned();
                on_line(stream, &line);
            }
        }
        let [stdout, stderr] = std::mem::take(&mut self.streams);
        Output {
            code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            combined: String::from_utf8_lossy(&self.combined).into_owned(),
            answered: self.answered,
        }
    }
}

fn io_error(program: &str, source: std::io::Error) -> ExecError {
    ExecError::Io {
        program: program.to_string(),
        source,
    }
}

async fn terminate(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        log::debug!("kill failed (child already gone?): {err}");
    }
    let _ = child.wait().await;
}

pub async fn run(spec: &CommandSpec, cancel: &CancelToken) -> Result<Output> {
    run_streaming(spec, cancel, |_, _| {}).await
}

/// Run `spec` to completion, handing every output line to `on_line` as soon
/// as it is complete.
pub async fn run_streaming<F>(spec: &CommandSpec, cancel: &CancelToken, mut on_line: F) -> Result<Output>
where
    F: FnMut(Stream, &str) + Send,
{
    let program = spec.program();
    if cancel.is_cancelled() {
        return Err(ExecError::Cancelled { program });
    }
    log::debug!("exec: {}", spec.display());

    let mut child = spec.command().spawn().map_err(|source| ExecError::Spawn {
        program: program.clone(),
        source,
    })?;
    let mut stdin = child.stdin.take();
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io_error(&program, std::io::Error::other("stdout not captured")))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| io_error(&program, std::io::Error::other("stderr not captured")))?;

    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut open = [true, true];
    let mut capture = Capture::default();

    while open[0] || open[1] {
        let (stream, read) = tokio::select! {
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(ExecError::Cancelled { program });
            }
            read = stdout.read(&mut out_buf), if open[0] => (Stream::Stdout, read),
            read = stderr.read(&mut err_buf), if open[1] => (Stream::Stderr, read),
        };
        let n = read.map_err(|e| io_error(&program, e))?;
        if n == 0 {
            open[stream.index()] = false;
            continue;
        }
        let chunk = match stream {
            Stream::Stdout => &out_buf[..n],
            Stream::Stderr => &err_buf[..n],
        };
        let Some((prompt, response)) = capture.feed(stream, chunk, &mut on_line, &spec.responses)
        else {
            continue;
        };
        match response {
            PromptResponse::Reply(answer) => {
                log::info!("{program} asked '{}', answering '{answer}'", prompt.trim());
                if let Some(pipe) = stdin.as_mut() {
                    let line = format!("{answer}\n");
                    if let Err(err) = pipe.write_all(line.as_bytes()).await {
                        log::warn!("could not answer {program}: {err}");
                    } else if let Err(err) = pipe.flush().await {
                        log::warn!("could not answer {program}: {err}");
                    }
                }
                capture.answered.push(prompt);
            }
            PromptResponse::Fail(reason) => {
                terminate(&mut child).await;
                return Err(ExecError::Prompt {
                    program,
                    prompt: prompt.trim().to_string(),
                    reason,
                });
            }
        }
    }
    drop(stdin);

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            terminate(&mut child).await;
            return Err(ExecError::Cancelled { program });
        }
        status = child.wait() => status.map_err(|e| io_error(&program, e))?,
    };
    Ok(capture.finish(status.code(), &mut on_line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_splits_lines_across_chunks() {
        let table = ResponseTable::default();
        let mut capture = Capture::default();
        let mut lines = Vec::new();
        let mut on_line = |s: Stream, l: &str| lines.push((s, l.to_string()));
        capture.feed(Stream::Stderr, b"building '/nix/st", &mut on_line, &table);
        capture.feed(Stream::Stderr, b"ore/x.drv'\nerror: ", &mut on_line, &table);
        let output = capture.finish(Some(1), &mut on_line);
        assert_eq!(
            lines,
            vec![
                (Stream::Stderr, "building '/nix/store/x.drv'".to_string()),
                (Stream::Stderr, "error: ".to_string()),
            ]
        );
        assert_eq!(output.stderr, "building '/nix/store/x.drv'\nerror: ");
    }

    #[test]
    fn partial_prompt_is_answered_once() {
        let table = ResponseTable::new().reply(r"\(y/N\)\?\s*$", "n").unwrap();
        let mut capture = Capture::default();
        let mut on_line = |_: Stream, _: &str| {};
        let first = capture.feed(Stream::Stderr, b"allow it (y/N)? ", &mut on_line, &table);
        assert!(matches!(first, Some((_, PromptResponse::Reply(ref a))) if a == "n"));
        let second = capture.feed(Stream::Stderr, b"\n", &mut on_line, &table);
        assert!(second.is_none(), "completed prompt line must not be answered twice");
    }

    #[test]
    fn stderr_tail_keeps_last_non_empty_lines() {
        let output = Output {
            stderr: "a\n\nb\nc\n".into(),
            ..Output::default()
        };
        assert_eq!(output.stderr_tail(2), "b\nc");
    }
}
