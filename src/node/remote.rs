//! A host reached over SSH.
//!
//! One OpenSSH control master is dialed per node and every later command,
//! read and copy is multiplexed over it, so authentication happens once.
//! Commands run through `sudo -n` unless the login user is root. File writes
//! speak the SCP sink protocol to a privileged `scp -t` on the far side.
//!
//! Host keys are not verified (`StrictHostKeyChecking=no`). Bootstrap
//! targets are usually fresh machines with no known_hosts entry yet.

use std::fmt;
use std::fs::{self, File};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::{
    capture, check_status, describe_status, run_streaming, scp, shell_quote, ChildReader,
    SharedSink, ShellCommand, Transport,
};
use crate::artifact::Body;
use crate::discovery;
use crate::error::{Error, IoContext, Result};

/// Exit status OpenSSH uses for its own failures.
const SSH_FAILURE: i32 = 255;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshAuth {
    /// Whatever ssh-agent or `~/.ssh/config` provides.
    Agent,
    Password(String),
    KeyFile(PathBuf),
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Agent => f.write_str("Agent"),
            SshAuth::Password(_) => f.write_str("Password(********)"),
            SshAuth::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub address: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
}

impl SshOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: 22,
            user: "root".to_string(),
            auth: SshAuth::Agent,
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn auth(mut self, auth: SshAuth) -> Self {
        self.auth = auth;
        self
    }
}

pub struct RemoteNode {
    target: String,
    destination: String,
    port: u16,
    auth: SshAuth,
    use_sudo: bool,
    ssh: PathBuf,
    sshpass: Option<PathBuf>,
    control: TempDir,
    sink: SharedSink,
    closed: bool,
}

impl RemoteNode {
    /// Dial the host and start the control master.
    pub fn connect(opts: &SshOptions, sink: SharedSink) -> Result<Self> {
        let target = format!("{}@{}:{}", opts.user, opts.address, opts.port);
        let ssh = which::which("ssh")
            .map_err(|e| Error::transport(&target, format!("locating ssh: {e}")))?;
        let sshpass = match &opts.auth {
            SshAuth::Password(_) => Some(which::which("sshpass").map_err(|e| {
                Error::transport(&target, format!("password auth needs sshpass: {e}"))
            })?),
            _ => None,
        };
        let control = tempfile::Builder::new()
            .prefix("edgepack-ssh-")
            .tempdir()
            .io_context(|| "creating ssh control directory")?;

        // Stays closed until the master is up, so drop does not try to stop it.
        let mut node = Self {
            destination: format!("{}@{}", opts.user, opts.address),
            target,
            port: opts.port,
            auth: opts.auth.clone(),
            use_sudo: opts.user != "root",
            ssh,
            sshpass,
            control,
            sink,
            closed: true,
        };

        // The master forks into the background and keeps its stdio, so it
        // must not hold a pipe we wait on.
        let dial_log = node.control.path().join("dial.log");
        let log = File::create(&dial_log)
            .io_context(|| format!("creating {}", dial_log.display()))?;
        let mut cmd = node.ssh_command();
        cmd.args(["-M", "-N", "-f", "-o", "ControlPersist=yes"])
            .arg(&node.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(log);
        let status = cmd
            .status()
            .map_err(|e| Error::transport(&node.target, format!("spawning ssh: {e}")))?;
        if !status.success() {
            let detail = fs::read_to_string(&dial_log).unwrap_or_default();
            return Err(Error::transport(
                &node.target,
                format!("dial failed ({}): {}", describe_status(status), detail.trim()),
            ));
        }

        node.closed = false;
        info!(node = %node.target, "ssh session established");
        Ok(node)
    }

    fn socket(&self) -> PathBuf {
        self.control.path().join("master.sock")
    }

    fn ssh_command(&self) -> Command {
        let mut cmd = match (&self.sshpass, &self.auth) {
            (Some(sshpass), SshAuth::Password(password)) => {
                // -e reads SSHPASS so the password never shows up in argv.
                let mut cmd = Command::new(sshpass);
                cmd.arg("-e").arg(&self.ssh).env("SSHPASS", password);
                cmd
            }
            _ => Command::new(&self.ssh),
        };
        cmd.arg("-p")
            .arg(self.port.to_string())
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "LogLevel=ERROR",
            ])
            .arg("-o")
            .arg(format!("ControlPath={}", self.socket().display()));
        match &self.auth {
            SshAuth::KeyFile(key) => {
                cmd.arg("-i")
                    .arg(key)
                    .args(["-o", "IdentitiesOnly=yes", "-o", "BatchMode=yes"]);
            }
            SshAuth::Password(_) => {
                cmd.args([
                    "-o",
                    "PubkeyAuthentication=no",
                    "-o",
                    "NumberOfPasswordPrompts=1",
                ]);
            }
            SshAuth::Agent => {
                cmd.args(["-o", "BatchMode=yes"]);
            }
        }
        cmd
    }

    /// `ssh ... <dest> -- <command>` with privilege escalation applied.
    fn remote(&self, command: &ShellCommand) -> Command {
        let inline = command.inline();
        let line = if self.use_sudo {
            format!("sudo -n {inline}")
        } else {
            inline
        };
        let mut cmd = self.ssh_command();
        cmd.arg(&self.destination).arg("--").arg(line);
        cmd
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::transport(&self.target, "session is closed"));
        }
        Ok(())
    }

    fn run_quiet(&self, command: &ShellCommand) -> Result<String> {
        capture(self.remote(command), command, &self.target)
    }
}

impl Transport for RemoteNode {
    fn target(&self) -> &str {
        &self.target
    }

    fn mkdir_all(&mut self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let command = ShellCommand::new(format!("mkdir -p {}", shell_quote(&path.to_string_lossy())));
        self.run_quiet(&command).map(|_| ())
    }

    fn get_file(&mut self, path: &Path) -> Result<Body> {
        self.ensure_open()?;
        let command = ShellCommand::new(format!("cat {}", shell_quote(&path.to_string_lossy())));
        let what = format!("{}:{}", self.target, path.display());
        let reader = ChildReader::spawn(self.remote(&command), what, &self.target)?;
        Ok(Box::new(reader))
    }

    fn write_file(&mut self, mut body: Body, dest: &Path, mode: u32, size: u64) -> Result<()> {
        self.ensure_open()?;
        let file_name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::malformed("destination path", dest.display().to_string()))?;
        if let Some(parent) = dest.parent() {
            self.mkdir_all(parent)?;
        }

        let dest_q = shell_quote(&dest.to_string_lossy());
        let sink_cmd = ShellCommand::new(format!("scp -t {dest_q}"));
        let mut cmd = self.remote(&sink_cmd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::transport(&self.target, format!("spawning scp: {e}")))?;
        let (Some(mut to_remote), Some(mut from_remote)) = (child.stdin.take(), child.stdout.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::transport(&self.target, "scp pipes unavailable"));
        };

        let sent = scp::send_file(&mut to_remote, &mut from_remote, &mut body, file_name, mode, size);
        drop(to_remote);
        drop(body);
        let status = child
            .wait()
            .io_context(|| format!("waiting for scp to {}", dest.display()))?;
        if status.code() == Some(SSH_FAILURE) {
            return Err(Error::transport(
                &self.target,
                format!("connection lost while copying to {}", dest.display()),
            ));
        }
        if let Err(e) = sent {
            return Err(Error::Execution {
                target: self.target.clone(),
                command: sink_cmd.display(),
                status: e.to_string(),
            });
        }
        check_status(status, &sink_cmd, &self.target)?;

        // scp only applies the announced mode to new files, and through umask.
        let chmod = ShellCommand::new(format!("chmod {mode:o} {dest_q}"));
        self.run_quiet(&chmod)?;
        debug!(node = %self.target, dest = %dest.display(), size, "copied file");
        Ok(())
    }

    fn execute(&mut self, command: &ShellCommand, log_prefix: &str) -> Result<()> {
        self.ensure_open()?;
        let status = run_streaming(
            self.remote(command),
            command,
            &self.target,
            log_prefix,
            self.sink.as_ref(),
        )?;
        if status.code() == Some(SSH_FAILURE) {
            return Err(Error::transport(
                &self.target,
                format!("ssh failed while running `{}`", command.display()),
            ));
        }
        check_status(status, command, &self.target)
    }

    fn listen_address(&mut self, process: &str, port: u16) -> Result<Ipv4Addr> {
        self.ensure_open()?;
        let scan = ShellCommand::new(discovery::scan_script(process));
        let output = self.run_quiet(&scan)?;
        discovery::resolve_from_output(process, port, &output)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut cmd = self.ssh_command();
        cmd.args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let status = cmd
            .status()
            .map_err(|e| Error::transport(&self.target, format!("stopping ssh master: {e}")))?;
        if !status.success() {
            warn!(node = %self.target, "ssh control master was already gone");
        }
        debug!(node = %self.target, "ssh session closed");
        Ok(())
    }
}

impl Drop for RemoteNode {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
