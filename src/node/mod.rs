//! Uniform file and command delivery to a target machine.
//!
//! A [`Node`] is one of three variants chosen at construction: the local
//! host, a remote host reached over SSH, or a container. All of them
//! implement [`Transport`], so bootstrap code never matches on the variant.
//!
//! # Example
//!
//! ```rust,ignore
//! use edgepack::node::{Node, ShellCommand, Transport, default_sink};
//!
//! let mut node = Node::local(default_sink());
//! node.execute(&ShellCommand::new("uname -a"), "[local]")?;
//! node.close()?;
//! ```

mod container;
mod local;
mod remote;
mod scp;

pub use container::{ContainerNode, ContainerOptions};
pub use local::LocalNode;
pub use remote::{RemoteNode, SshAuth, SshOptions};

use std::io::{self, BufRead, BufReader, Read};
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::info;

use crate::artifact::Body;
use crate::error::{Error, IoContext, Result};

/// Replacement text for secret values in logged lines.
pub const REDACTED: &str = "********";

/// Capabilities every target machine offers.
pub trait Transport {
    /// Human-readable target, used in logs and errors.
    fn target(&self) -> &str;

    /// Ensure `path` exists. Idempotent.
    fn mkdir_all(&mut self, path: &Path) -> Result<()>;

    /// Open `path` on the target for reading. The caller owns the stream.
    fn get_file(&mut self, path: &Path) -> Result<Body>;

    /// Stream `body` to `dest`, creating parent directories, then apply
    /// `mode`. The body is consumed on every path. `size` must be the exact
    /// body length for transports that announce it up front.
    fn write_file(&mut self, body: Body, dest: &Path, mode: u32, size: u64) -> Result<()>;

    /// Run `command` to completion, logging each output line with `log_prefix`.
    fn execute(&mut self, command: &ShellCommand, log_prefix: &str) -> Result<()>;

    /// Address the named process is reachable on, see [`crate::discovery`].
    fn listen_address(&mut self, process: &str, port: u16) -> Result<Ipv4Addr>;

    /// Release the connection. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// A target machine handle.
pub enum Node {
    Local(LocalNode),
    Remote(RemoteNode),
    Container(ContainerNode),
}

impl Node {
    pub fn local(sink: SharedSink) -> Self {
        Node::Local(LocalNode::new(sink))
    }

    /// Dial `opts` over SSH and keep the session open until close.
    pub fn connect(opts: &SshOptions, sink: SharedSink) -> Result<Self> {
        RemoteNode::connect(opts, sink).map(Node::Remote)
    }

    /// Create and start a container from `opts`.
    pub fn container(opts: &ContainerOptions, sink: SharedSink) -> Result<Self> {
        ContainerNode::start(opts, sink).map(Node::Container)
    }
}

macro_rules! dispatch {
    ($self:ident, $node:ident => $call:expr) => {
        match $self {
            Node::Local($node) => $call,
            Node::Remote($node) => $call,
            Node::Container($node) => $call,
        }
    };
}

impl Transport for Node {
    fn target(&self) -> &str {
        dispatch!(self, n => n.target())
    }

    fn mkdir_all(&mut self, path: &Path) -> Result<()> {
        dispatch!(self, n => n.mkdir_all(path))
    }

    fn get_file(&mut self, path: &Path) -> Result<Body> {
        dispatch!(self, n => n.get_file(path))
    }

    fn write_file(&mut self, body: Body, dest: &Path, mode: u32, size: u64) -> Result<()> {
        dispatch!(self, n => n.write_file(body, dest, mode, size))
    }

    fn execute(&mut self, command: &ShellCommand, log_prefix: &str) -> Result<()> {
        dispatch!(self, n => n.execute(command, log_prefix))
    }

    fn listen_address(&mut self, process: &str, port: u16) -> Result<Ipv4Addr> {
        dispatch!(self, n => n.listen_address(process, port))
    }

    fn close(&mut self) -> Result<()> {
        dispatch!(self, n => n.close())
    }
}

/// A shell script plus its environment, with the values to hide from logs.
#[derive(Debug, Clone, Default)]
pub struct ShellCommand {
    script: String,
    env: Vec<(String, String)>,
    secrets: Vec<String>,
}

impl ShellCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Like [`ShellCommand::env`], and the value is redacted from logs.
    pub fn secret_env(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        self.secret(value.clone()).env(key, value)
    }

    /// Redact `value` wherever it appears in logged lines.
    pub fn secret(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.secrets.push(value);
        }
        self
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn envs(&self) -> &[(String, String)] {
        &self.env
    }

    /// Replace every secret in `line`.
    pub fn redact(&self, line: &str) -> String {
        self.secrets
            .iter()
            .fold(line.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }

    /// The command line as it may be logged.
    pub fn display(&self) -> String {
        self.redact(&self.inline())
    }

    /// Self-contained `env K='v' sh -c '<script>'` form with real values.
    pub(crate) fn inline(&self) -> String {
        let mut out = String::new();
        if !self.env.is_empty() {
            out.push_str("env ");
            for (key, value) in &self.env {
                out.push_str(key);
                out.push('=');
                out.push_str(&shell_quote(value));
                out.push(' ');
            }
        }
        out.push_str("sh -c ");
        out.push_str(&shell_quote(&self.script));
        out
    }
}

/// Which stream a logged line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Command,
    Stdout,
    Stderr,
}

/// Line-oriented log destination for command output.
pub trait LineSink: Send + Sync {
    fn line(&self, prefix: &str, stream: Stream, line: &str);
}

pub type SharedSink = Arc<dyn LineSink>;

/// Emits each line as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LineSink for TracingSink {
    fn line(&self, prefix: &str, stream: Stream, line: &str) {
        match stream {
            Stream::Command => info!(target: "edgepack::exec", "{prefix} $ {line}"),
            Stream::Stdout => info!(target: "edgepack::exec", "{prefix} {line}"),
            Stream::Stderr => info!(target: "edgepack::exec", stream = "stderr", "{prefix} {line}"),
        }
    }
}

pub fn default_sink() -> SharedSink {
    Arc::new(TracingSink)
}

/// Keeps every line in memory. Useful for tests and for callers that want
/// to show output after the fact.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(Stream, String)>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<(Stream, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|(_, l)| l.contains(needle))
    }
}

impl LineSink for MemorySink {
    fn line(&self, prefix: &str, stream: Stream, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((stream, format!("{prefix} {line}")));
        }
    }
}

/// Single-quote `s` for POSIX shells.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Spawn `cmd` and tee stdout and stderr into `sink` until the process exits.
///
/// Both pipes are drained on their own scoped thread; the call returns only
/// after the process has exited and both drains have finished.
pub(crate) fn run_streaming(
    mut cmd: Command,
    command: &ShellCommand,
    target: &str,
    log_prefix: &str,
    sink: &dyn LineSink,
) -> Result<ExitStatus> {
    let display = command.display();
    sink.line(log_prefix, Stream::Command, &display);

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::transport(target, format!("spawning `{display}`: {e}")))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    thread::scope(|scope| {
        let out = scope.spawn(move || drain(stdout, Stream::Stdout, command, log_prefix, sink));
        let err = scope.spawn(move || drain(stderr, Stream::Stderr, command, log_prefix, sink));
        let status = child.wait();
        let _ = out.join();
        let _ = err.join();
        status.io_context(|| format!("waiting for `{display}` on {target}"))
    })
}

fn drain<R: Read>(
    source: Option<R>,
    stream: Stream,
    command: &ShellCommand,
    prefix: &str,
    sink: &dyn LineSink,
) {
    let Some(source) = source else { return };
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                sink.line(prefix, stream, &command.redact(line));
            }
        }
    }
}

/// Run `cmd` and return its stdout, failing on a non-zero exit.
pub(crate) fn capture(mut cmd: Command, command: &ShellCommand, target: &str) -> Result<String> {
    cmd.stdin(Stdio::null());
    let output = cmd
        .output()
        .map_err(|e| Error::transport(target, format!("spawning `{}`: {e}", command.display())))?;
    check_status(output.status, command, target)?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(crate) fn check_status(status: ExitStatus, command: &ShellCommand, target: &str) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    Err(Error::Execution {
        target: target.to_string(),
        command: command.display(),
        status: describe_status(status),
    })
}

pub(crate) fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return format!("killed by signal {signal}");
                }
            }
            "terminated abnormally".to_string()
        }
    }
}

/// Stdout of a child process exposed as a body. Reaching EOF waits for the
/// child and turns a failed exit into a read error; dropping early kills it.
pub(crate) struct ChildReader {
    child: Child,
    stdout: ChildStdout,
    what: String,
    finished: bool,
}

impl ChildReader {
    pub(crate) fn spawn(mut cmd: Command, what: String, target: &str) -> Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::transport(target, format!("spawning reader for {what}: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport(target, format!("no stdout pipe for {what}")))?;
        Ok(Self {
            child,
            stdout,
            what,
            finished: false,
        })
    }
}

impl Read for ChildReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.finished {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("reading {} failed: {}", self.what, describe_status(status)),
                ));
            }
        }
        Ok(n)
    }
}

impl Drop for ChildReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
