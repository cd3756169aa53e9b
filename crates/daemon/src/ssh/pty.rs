// Login shell on a pseudo-terminal

use std::io::{self, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};

pub const ANDROID_SHELL: &str = "/system/bin/sh";
pub const POSIX_SHELL: &str = "/bin/sh";

/// Terminal parameters from the client's `pty-req`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

impl PtyRequest {
    pub fn new(term: &str, cols: u32, rows: u32) -> Self {
        Self {
            term: term.to_string(),
            cols: dimension(cols),
            rows: dimension(rows),
        }
    }
}

/// Clamp a client supplied dimension into what a pty accepts
pub fn dimension(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX).max(1)
}

pub fn shell_program() -> &'static str {
    if Path::new(ANDROID_SHELL).exists() {
        ANDROID_SHELL
    } else {
        POSIX_SHELL
    }
}

fn size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Byte streams of the master side, moved to the copy threads
pub struct PtyStreams {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// A shell running on the slave side of a pty
pub struct ShellPty {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl ShellPty {
    /// Start the shell in `cwd`, running `command` through `-c` when given
    pub fn spawn(request: &PtyRequest, cwd: &Path, command: Option<&str>) -> Result<(Self, PtyStreams)> {
        let pair = native_pty_system()
            .openpty(size(request.cols, request.rows))
            .context("Failed to open pty")?;

        let mut cmd = CommandBuilder::new(shell_program());
        if let Some(command) = command {
            cmd.arg("-c");
            cmd.arg(command);
        }
        cmd.cwd(cwd);
        if !request.term.is_empty() {
            cmd.env("TERM", &request.term);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn shell")?;
        // The reader only sees EOF once every slave descriptor is closed
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to take pty writer")?;

        Ok((
            Self {
                master: pair.master,
                child,
            },
            PtyStreams { reader, writer },
        ))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(size(cols, rows))
            .context("Failed to resize pty")
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    pub fn killer(&self) -> Box<dyn ChildKiller + Send + Sync> {
        self.child.clone_killer()
    }

    /// Block until the shell exits and return its exit code
    pub fn wait(mut self) -> io::Result<u32> {
        let status = self.child.wait()?;
        Ok(status.exit_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dimension_clamps() {
        assert_eq!(dimension(0), 1);
        assert_eq!(dimension(80), 80);
        assert_eq!(dimension(70_000), u16::MAX);
    }

    #[test]
    fn test_pty_request_new() {
        let req = PtyRequest::new("xterm-256color", 120, 40);
        assert_eq!(req.term, "xterm-256color");
        assert_eq!((req.cols, req.rows), (120, 40));
    }

    #[test]
    fn test_command_runs_in_cwd_with_term() {
        let dir = TempDir::new().unwrap();
        let request = PtyRequest::new("vt100", 80, 24);

        let (shell, mut streams) =
            ShellPty::spawn(&request, dir.path(), Some("echo \"$TERM:$(pwd)\"; exit 4")).unwrap();
        shell.resize(100, 30).unwrap();
        assert!(shell.pid().is_some());

        let mut output = Vec::new();
        // EIO once the shell is gone ends the read
        let _ = streams.reader.read_to_end(&mut output);
        assert_eq!(shell.wait().unwrap(), 4);

        let text = String::from_utf8_lossy(&output);
        let cwd = std::fs::canonicalize(dir.path()).unwrap();
        assert!(text.contains(&format!("vt100:{}", cwd.display())));
    }
}
