//! A container driven through the docker CLI.
//!
//! Environment values are handed to `docker exec` as bare `-e KEY` flags
//! with the value set on the docker process itself, so secrets never land
//! in an argument vector.

use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    capture, check_status, run_streaming, shell_quote, ChildReader, SharedSink, ShellCommand,
    Transport,
};
use crate::artifact::Body;
use crate::discovery;
use crate::error::{Error, IoContext, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerOptions {
    pub image: String,
    pub name: String,
    #[serde(default)]
    pub privileged: bool,
    /// Arguments after the image, e.g. the entrypoint's subcommand.
    #[serde(default)]
    pub args: Vec<String>,
}

impl ContainerOptions {
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            privileged: false,
            args: Vec::new(),
        }
    }
}

pub struct ContainerNode {
    docker: PathBuf,
    name: String,
    /// Created by us, so removed again on close.
    owned: bool,
    sink: SharedSink,
    closed: bool,
}

impl ContainerNode {
    /// Create and start a fresh container.
    pub fn start(opts: &ContainerOptions, sink: SharedSink) -> Result<Self> {
        let docker = locate_docker(&opts.name)?;

        let create = ShellCommand::new(format!("docker create {}", opts.image));
        let mut cmd = Command::new(&docker);
        cmd.arg("create").arg("--name").arg(&opts.name);
        if opts.privileged {
            cmd.arg("--privileged");
        }
        cmd.arg(&opts.image).args(&opts.args);
        capture(cmd, &create, &opts.name).map_err(|e| into_transport(&opts.name, e))?;

        // From here on, dropping the node removes the container.
        let node = Self {
            docker,
            name: opts.name.clone(),
            owned: true,
            sink,
            closed: false,
        };

        let start = ShellCommand::new(format!("docker start {}", opts.name));
        let mut cmd = node.docker();
        cmd.arg("start").arg(&node.name);
        capture(cmd, &start, &node.name).map_err(|e| into_transport(&node.name, e))?;

        info!(container = %node.name, image = %opts.image, "container started");
        Ok(node)
    }

    /// Use an already running container. It is left in place on close.
    pub fn attach(name: impl Into<String>, sink: SharedSink) -> Result<Self> {
        let name = name.into();
        let docker = locate_docker(&name)?;
        let inspect = ShellCommand::new(format!("docker inspect {name}"));
        let mut cmd = Command::new(&docker);
        cmd.args(["inspect", "--type", "container"]).arg(&name);
        capture(cmd, &inspect, &name).map_err(|e| into_transport(&name, e))?;
        Ok(Self {
            docker,
            name,
            owned: false,
            sink,
            closed: false,
        })
    }

    fn docker(&self) -> Command {
        Command::new(&self.docker)
    }

    /// `docker exec [-i] -e K... <name> sh -c <script>`.
    fn exec(&self, interactive: bool, command: &ShellCommand) -> Command {
        let mut cmd = self.docker();
        cmd.arg("exec");
        if interactive {
            cmd.arg("-i");
        }
        for (key, value) in command.envs() {
            cmd.arg("-e").arg(key);
            cmd.env(key, value);
        }
        cmd.arg(&self.name).arg("sh").arg("-c").arg(command.script());
        cmd
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::transport(&self.name, "container node is closed"));
        }
        Ok(())
    }
}

fn locate_docker(target: &str) -> Result<PathBuf> {
    which::which("docker").map_err(|e| Error::transport(target, format!("locating docker: {e}")))
}

/// Failures of docker itself mean the target is unreachable.
fn into_transport(target: &str, err: Error) -> Error {
    match err {
        Error::Execution {
            command, status, ..
        } => Error::transport(target, format!("`{command}` failed: {status}")),
        other => other,
    }
}

impl Transport for ContainerNode {
    fn target(&self) -> &str {
        &self.name
    }

    fn mkdir_all(&mut self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let command = ShellCommand::new(format!("mkdir -p {}", shell_quote(&path.to_string_lossy())));
        capture(self.exec(false, &command), &command, &self.name).map(|_| ())
    }

    fn get_file(&mut self, path: &Path) -> Result<Body> {
        self.ensure_open()?;
        let command = ShellCommand::new(format!("cat {}", shell_quote(&path.to_string_lossy())));
        let what = format!("{}:{}", self.name, path.display());
        let reader = ChildReader::spawn(self.exec(false, &command), what, &self.name)?;
        Ok(Box::new(reader))
    }

    fn write_file(&mut self, mut body: Body, dest: &Path, mode: u32, size: u64) -> Result<()> {
        self.ensure_open()?;
        let dest_q = shell_quote(&dest.to_string_lossy());
        let parent = dest
            .parent()
            .map(|p| shell_quote(&p.to_string_lossy()))
            .unwrap_or_else(|| "/".to_string());
        let command = ShellCommand::new(format!(
            "mkdir -p {parent} && cat > {dest_q} && chmod {mode:o} {dest_q}"
        ));

        let mut cmd = self.exec(true, &command);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::transport(&self.name, format!("spawning docker exec: {e}")))?;
        let copied = match child.stdin.take() {
            Some(mut stdin) => io::copy(&mut body, &mut stdin).and_then(|n| {
                stdin.flush()?;
                Ok(n)
            }),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "no stdin pipe")),
        };
        drop(body);
        let status = child
            .wait()
            .io_context(|| format!("waiting for copy to {}", dest.display()))?;
        check_status(status, &command, &self.name)?;
        let copied = copied.io_context(|| format!("streaming to {}:{}", self.name, dest.display()))?;
        if copied != size {
            return Err(Error::malformed(
                "file body",
                format!("wrote {copied} of {size} bytes to {}", dest.display()),
            ));
        }
        debug!(container = %self.name, dest = %dest.display(), size, "copied file");
        Ok(())
    }

    fn execute(&mut self, command: &ShellCommand, log_prefix: &str) -> Result<()> {
        self.ensure_open()?;
        let status = run_streaming(
            self.exec(false, command),
            command,
            &self.name,
            log_prefix,
            self.sink.as_ref(),
        )?;
        check_status(status, command, &self.name)
    }

    fn listen_address(&mut self, process: &str, port: u16) -> Result<Ipv4Addr> {
        self.ensure_open()?;
        let scan = ShellCommand::new(discovery::scan_script(process));
        let output = capture(self.exec(false, &scan), &scan, &self.name)?;
        discovery::resolve_from_output(process, port, &output)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.owned {
            return Ok(());
        }
        let remove = ShellCommand::new(format!("docker rm -f {}", self.name));
        let mut cmd = self.docker();
        cmd.args(["rm", "-f"]).arg(&self.name);
        capture(cmd, &remove, &self.name)?;
        debug!(container = %self.name, "container removed");
        Ok(())
    }
}

impl Drop for ContainerNode {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
