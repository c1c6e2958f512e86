/*
Copyright 2025 Google LLC

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::{
    ffi::OsStr,
    process::{Command, ExitStatus},
    time::SystemTime,
};

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use memchr::memchr2;

use crate::log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectStderr {
    None,
    Stdout,
    DevNull,
}

/// Modification time of `filename`, `None` when it does not exist.
/// Missing files are never an error.
pub fn get_timestamp(filename: &[u8]) -> Result<Option<SystemTime>> {
    let filename = <OsStr as OsStrExt>::from_bytes(filename);
    if !std::fs::exists(filename)? {
        return Ok(None);
    }
    let metadata = std::fs::metadata(filename)?;
    Ok(Some(metadata.modified()?))
}

pub fn run_command(
    shell: &[u8],
    shellflag: &[u8],
    cmd: &Bytes,
    redirect_stderr: RedirectStderr,
) -> Result<(ExitStatus, Vec<u8>)> {
    let cmd_with_shell;
    let args: [&OsStr; 3] = if !shell.starts_with(b"/") || memchr2(b' ', b'$', shell).is_some() {
        let cmd_escaped = crate::strutil::escape_shell(cmd);
        let mut buf = BytesMut::new();
        buf.put_slice(shell);
        buf.put_u8(b' ');
        buf.put_slice(shellflag);
        buf.put_slice(b" \"");
        buf.put_slice(&cmd_escaped);
        buf.put_u8(b'"');
        cmd_with_shell = buf.freeze();
        [
            <OsStr as OsStrExt>::from_bytes(b"/bin/sh"),
            <OsStr as OsStrExt>::from_bytes(b"-c"),
            <OsStr as OsStrExt>::from_bytes(&cmd_with_shell),
        ]
    } else {
        // If the shell isn't complicated, we don't need to wrap in /bin/sh
        [
            <OsStr as OsStrExt>::from_bytes(shell),
            <OsStr as OsStrExt>::from_bytes(shellflag),
            <OsStr as OsStrExt>::from_bytes(cmd),
        ]
    };

    log!("run_command({args:?})");

    let mut cmd = Command::new(args[0]);
    let _ = cmd.args(&args[1..]);

    let (mut reader, writer) = os_pipe::pipe()?;
    match redirect_stderr {
        RedirectStderr::None => {
            let _ = cmd.stderr(std::process::Stdio::inherit());
        }
        RedirectStderr::Stdout => {
            let _ = cmd.stderr(writer.try_clone()?);
        }
        RedirectStderr::DevNull => {
            let _ = cmd.stderr(std::process::Stdio::null());
        }
    }
    let _ = cmd.stdout(writer);

    let mut handle = cmd.spawn()?;
    // Drop the cmd, otherwise the pipe will be retained.
    drop(cmd);

    let mut output = Vec::new();
    let _ = reader.read_to_end(&mut output)?;

    let res = handle.wait()?;

    Ok((res, output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_timestamp_missing() {
        assert!(
            get_timestamp(b"/nonexistent/definitely/not/here")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_run_command_captures_output() {
        let (status, output) = run_command(
            b"/bin/sh",
            b"-c",
            &Bytes::from_static(b"echo hello"),
            RedirectStderr::Stdout,
        )
        .unwrap();
        assert!(status.success());
        assert_eq!(String::from_utf8_lossy(&output), "hello\n");
    }

    #[test]
    fn test_run_command_failure_status() {
        let (status, _) = run_command(
            b"/bin/sh",
            b"-c",
            &Bytes::from_static(b"exit 3"),
            RedirectStderr::Stdout,
        )
        .unwrap();
        assert!(!status.success());
        assert_eq!(status.code(), Some(3));
    }
}
