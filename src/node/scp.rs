//! Source side of the SCP sink protocol (`scp -t`).
//!
//! The remote `scp -t <dest>` answers every step with one status byte:
//! `0` for ok, `1` (warning) or `2` (fatal) followed by a message line.

use std::io::{self, Read, Write};

/// Send one regular file of exactly `size` bytes named `file_name`.
pub(crate) fn send_file<W: Write, R: Read>(
    to_remote: &mut W,
    from_remote: &mut R,
    body: &mut dyn Read,
    file_name: &str,
    mode: u32,
    size: u64,
) -> io::Result<()> {
    if file_name.is_empty() || file_name.contains(['/', '\n']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid scp file name {file_name:?}"),
        ));
    }

    read_ack(from_remote)?;

    writeln!(to_remote, "C{:04o} {} {}", mode & 0o7777, size, file_name)?;
    to_remote.flush()?;
    read_ack(from_remote)?;

    let copied = io::copy(&mut body.take(size), to_remote)?;
    if copied != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("source ended after {copied} of {size} bytes"),
        ));
    }
    to_remote.write_all(&[0])?;
    to_remote.flush()?;
    read_ack(from_remote)
}

fn read_ack<R: Read>(from_remote: &mut R) -> io::Result<()> {
    let mut code = [0u8; 1];
    if from_remote.read(&mut code)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "scp closed the stream",
        ));
    }
    match code[0] {
        0 => Ok(()),
        level @ (1 | 2) => {
            let mut message = Vec::new();
            let mut byte = [0u8; 1];
            while from_remote.read(&mut byte)? == 1 && byte[0] != b'\n' {
                message.push(byte[0]);
            }
            let kind = if level == 1 { "warning" } else { "error" };
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("scp {kind}: {}", String::from_utf8_lossy(&message).trim()),
            ))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected scp status byte {other:#04x}"),
        )),
    }
}
