//! Find the IPv4 address a process talks to the control plane on, from the
//! kernel socket tables in `/proc/<pid>/net/tcp`.
//!
//! Each table line looks like
//!
//! ```text
//!   sl  local_address rem_address   st ...
//!    0: 0100000A:C350 0100000A:192B 01 ...
//! ```
//!
//! Addresses are the four bytes of the IPv4 address in host (little-endian)
//! order as hex, ports are 4-digit uppercase hex. The first non-loopback
//! remote entry on the wanted port wins.

use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;

use sysinfo::System;
use tracing::debug;

use crate::error::{Error, IoContext, Result};

/// `127.0.0.1` in table form.
pub const LOOPBACK_HEX: &str = "0100007F";

const PID_MARKER: &str = "@@pid ";

/// Turn a table address such as `0100000A` into `10.0.0.1`.
pub fn decode_address(packed: &str) -> Result<Ipv4Addr> {
    let bytes = hex::decode(packed)
        .map_err(|e| Error::malformed("socket address", format!("'{packed}': {e}")))?;
    let [a, b, c, d]: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::malformed("socket address", format!("'{packed}' is not 4 bytes")))?;
    Ok(Ipv4Addr::new(d, c, b, a))
}

/// Scan one socket table for a non-loopback remote endpoint on `port`.
pub fn scan_table(table: &str, port: u16) -> Result<Option<Ipv4Addr>> {
    let wanted = format!("{port:04X}");
    for line in table.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            return Err(Error::malformed("socket table line", line.trim()));
        }
        let (addr, entry_port) = fields[2]
            .split_once(':')
            .ok_or_else(|| Error::malformed("socket table endpoint", fields[2]))?;
        if addr == LOOPBACK_HEX {
            continue;
        }
        if entry_port.eq_ignore_ascii_case(&wanted) {
            return decode_address(addr).map(Some);
        }
    }
    Ok(None)
}

/// Search the tables of every matching process in order.
pub fn scan_tables(process: &str, port: u16, tables: &[(u32, String)]) -> Result<Ipv4Addr> {
    if tables.is_empty() {
        return Err(Error::ProcessNotFound(process.to_string()));
    }
    for (pid, table) in tables {
        if let Some(addr) = scan_table(table, port)? {
            debug!(process, pid, %addr, "found control plane connection");
            return Ok(addr);
        }
    }
    Err(Error::Exhausted {
        process: process.to_string(),
        port,
    })
}

/// Pids whose process name or executable file name equals `name`, sorted.
pub fn process_ids(name: &str) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes();
    let mut pids: Vec<u32> = sys
        .processes()
        .values()
        .filter(|p| {
            p.name() == name
                || p
                    .exe()
                    .and_then(|exe| exe.file_name())
                    .is_some_and(|f| f == name)
        })
        .map(|p| p.pid().as_u32())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Read `<proc_root>/<pid>/net/tcp` for each pid. Processes that exited in
/// the meantime are skipped.
pub fn read_tables(proc_root: &Path, pids: &[u32]) -> Result<Vec<(u32, String)>> {
    let mut tables = Vec::with_capacity(pids.len());
    for &pid in pids {
        let path = proc_root.join(pid.to_string()).join("net/tcp");
        match fs::read_to_string(&path) {
            Ok(table) => tables.push((pid, table)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(pid, "process went away before its socket table was read");
            }
            Err(e) => return Err(e).io_context(|| format!("reading {}", path.display())),
        }
    }
    Ok(tables)
}

/// Discovery on the local machine.
pub fn find_listen_address(process: &str, port: u16) -> Result<Ipv4Addr> {
    let pids = process_ids(process);
    if pids.is_empty() {
        return Err(Error::ProcessNotFound(process.to_string()));
    }
    let tables = read_tables(Path::new("/proc"), &pids)?;
    scan_tables(process, port, &tables)
}

/// Shell snippet that prints the socket table of every process named
/// `process`, each preceded by a `@@pid <pid>` marker line. Used to run
/// discovery on a node without installing anything there.
pub fn scan_script(process: &str) -> String {
    let name = crate::node::shell_quote(process);
    format!(
        r#"for d in /proc/[0-9]*; do
  comm=$(cat "$d/comm" 2>/dev/null) || continue
  exe=$(readlink "$d/exe" 2>/dev/null)
  if [ "$comm" = {name} ] || [ "${{exe##*/}}" = {name} ]; then
    echo "{PID_MARKER}${{d#/proc/}}"
    cat "$d/net/tcp" 2>/dev/null
  fi
done"#
    )
}

/// Split the output of [`scan_script`] back into per-pid tables.
pub fn parse_scan_output(output: &str) -> Result<Vec<(u32, String)>> {
    let mut tables: Vec<(u32, String)> = Vec::new();
    for line in output.lines() {
        if let Some(pid) = line.strip_prefix(PID_MARKER) {
            let pid = pid
                .trim()
                .parse()
                .map_err(|_| Error::malformed("process scan marker", line))?;
            tables.push((pid, String::new()));
            continue;
        }
        match tables.last_mut() {
            Some((_, table)) => {
                table.push_str(line);
                table.push('\n');
            }
            None if line.trim().is_empty() => {}
            None => return Err(Error::malformed("process scan output", line)),
        }
    }
    Ok(tables)
}

/// [`parse_scan_output`] followed by [`scan_tables`].
pub fn resolve_from_output(process: &str, port: u16, output: &str) -> Result<Ipv4Addr> {
    let tables = parse_scan_output(output)?;
    scan_tables(process, port, &tables)
}
