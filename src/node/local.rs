//! The machine the tool runs on.

use std::fs::{self, File};
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use super::{check_status, run_streaming, SharedSink, ShellCommand, Transport};
use crate::artifact::Body;
use crate::discovery;
use crate::error::{IoContext, Result};

/// Runs commands through `sh -c` and writes files directly. Holds no
/// connection, so closing is a no-op.
pub struct LocalNode {
    sink: SharedSink,
}

impl LocalNode {
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }
}

impl Transport for LocalNode {
    fn target(&self) -> &str {
        "local"
    }

    fn mkdir_all(&mut self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).io_context(|| format!("creating {}", path.display()))
    }

    fn get_file(&mut self, path: &Path) -> Result<Body> {
        let file = File::open(path).io_context(|| format!("opening {}", path.display()))?;
        Ok(Box::new(file))
    }

    fn write_file(&mut self, mut body: Body, dest: &Path, mode: u32, _size: u64) -> Result<()> {
        if let Some(parent) = dest.parent() {
            self.mkdir_all(parent)?;
        }
        let mut file = File::create(dest).io_context(|| format!("creating {}", dest.display()))?;
        io::copy(&mut body, &mut file).io_context(|| format!("writing {}", dest.display()))?;
        file.flush()
            .io_context(|| format!("flushing {}", dest.display()))?;
        fs::set_permissions(dest, fs::Permissions::from_mode(mode))
            .io_context(|| format!("setting mode {mode:o} on {}", dest.display()))
    }

    fn execute(&mut self, command: &ShellCommand, log_prefix: &str) -> Result<()> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command.script());
        cmd.envs(command.envs().iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let status = run_streaming(cmd, command, self.target(), log_prefix, self.sink.as_ref())?;
        check_status(status, command, self.target())
    }

    fn listen_address(&mut self, process: &str, port: u16) -> Result<Ipv4Addr> {
        discovery::find_listen_address(process, port)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
