// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process launching as a capability interface.
//!
//! The runner never talks to `tokio::process` directly: it launches units
//! through a [`ProcessLauncher`] and supervises them through the
//! [`ProcessHandle`] it returns. The stock implementation is
//! [`LocalLauncher`]; a remote-device proxy is an alternate implementation
//! of the same traits, selected at construction.

use camino::Utf8PathBuf;
use std::{
    future::Future,
    io,
    process::{ExitStatus, Stdio},
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod os {
            use std::{fs::File, io::PipeReader, os::fd::OwnedFd};

            pub(super) fn pipe_reader_into_file(reader: PipeReader) -> File {
                File::from(OwnedFd::from(reader))
            }
        }
    } else if #[cfg(windows)] {
        mod os {
            use std::{fs::File, io::PipeReader, os::windows::io::OwnedHandle};

            pub(super) fn pipe_reader_into_file(reader: PipeReader) -> File {
                File::from(OwnedHandle::from(reader))
            }
        }
    } else {
        compile_error!("unsupported target platform");
    }
}

/// A fully-resolved command line for one unit.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    /// The program to run.
    pub program: Utf8PathBuf,

    /// The argument vector.
    pub args: Vec<String>,

    /// The working directory, if overridden.
    pub cwd: Option<Utf8PathBuf>,

    /// Environment variables applied on top of the ambient environment.
    pub env: Vec<(String, String)>,
}

/// Launches test processes.
pub trait ProcessLauncher: Send + Sync {
    /// The handle type this launcher produces.
    type Handle: ProcessHandle;

    /// Launches a process for the given command.
    fn launch(&self, spec: &CommandSpec) -> impl Future<Output = io::Result<Self::Handle>> + Send;
}

/// Supervises one live test process.
///
/// Output arrives line by line over a single stream: by convention the
/// process is launched with stderr merged into stdout so interleaving is
/// preserved.
pub trait ProcessHandle: Send {
    /// The platform-specific process identifier, for diagnostics.
    fn pid(&self) -> Option<u32>;

    /// Reads the next line of output, or `None` at end of stream.
    fn next_line(&mut self) -> impl Future<Output = io::Result<Option<String>>> + Send;

    /// Waits for the process to exit.
    fn wait(&mut self) -> impl Future<Output = io::Result<ExitStatus>> + Send;

    /// Forcibly terminates the process. Crash-dump capture, where
    /// available, is the implementation's concern.
    fn kill(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Checks whether the process has exited without blocking.
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;
}

/// Launches subprocesses on the local machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalLauncher;

/// A local subprocess with its merged output stream.
#[derive(Debug)]
pub struct LocalProcess {
    child: tokio::process::Child,
    lines: Lines<BufReader<tokio::fs::File>>,
}

impl ProcessLauncher for LocalLauncher {
    type Handle = LocalProcess;

    fn launch(&self, spec: &CommandSpec) -> impl Future<Output = io::Result<LocalProcess>> + Send {
        async move {
            let mut cmd = std::process::Command::new(spec.program.as_str());
            cmd.args(&spec.args);
            if let Some(cwd) = &spec.cwd {
                cmd.current_dir(cwd);
            }
            for (key, value) in &spec.env {
                cmd.env(key, value);
            }
            cmd.stdin(Stdio::null());

            // Merge stderr into stdout through a single pipe so line
            // interleaving is preserved.
            let (reader, writer) = io::pipe()?;
            cmd.stdout(writer.try_clone()?);
            cmd.stderr(writer);

            let mut cmd = tokio::process::Command::from(cmd);
            let child = cmd.spawn()?;
            // The command object keeps its copies of the pipe writer alive;
            // drop it so end-of-stream is observable once the child side
            // closes.
            drop(cmd);

            let reader = tokio::fs::File::from_std(os::pipe_reader_into_file(reader));
            let lines = BufReader::new(reader).lines();
            Ok(LocalProcess { child, lines })
        }
    }
}

impl ProcessHandle for LocalProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn next_line(&mut self) -> impl Future<Output = io::Result<Option<String>>> + Send {
        self.lines.next_line()
    }

    fn wait(&mut self) -> impl Future<Output = io::Result<ExitStatus>> + Send {
        self.child.wait()
    }

    fn kill(&mut self) -> impl Future<Output = io::Result<()>> + Send {
        self.child.kill()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_launcher_merges_streams() {
        let spec = CommandSpec {
            program: "sh".into(),
            args: vec![
                "-c".to_owned(),
                "echo out1; echo err1 >&2; echo out2".to_owned(),
            ],
            cwd: None,
            env: Vec::new(),
        };
        let mut handle = LocalLauncher.launch(&spec).await.expect("spawned");
        assert!(handle.pid().is_some());

        let mut lines = Vec::new();
        while let Some(line) = handle.next_line().await.expect("read line") {
            lines.push(line);
        }
        let status = handle.wait().await.expect("wait succeeds");
        assert!(status.success());

        // All three lines arrive on the one stream, with stdout ordering
        // preserved.
        assert_eq!(lines.len(), 3);
        assert!(lines.contains(&"err1".to_owned()));
        let out1 = lines.iter().position(|l| l == "out1").unwrap();
        let out2 = lines.iter().position(|l| l == "out2").unwrap();
        assert!(out1 < out2);
    }

    #[tokio::test]
    async fn kill_terminates_the_process() {
        let spec = CommandSpec {
            program: "sh".into(),
            args: vec!["-c".to_owned(), "exec sleep 30".to_owned()],
            cwd: None,
            env: Vec::new(),
        };
        let mut handle = LocalLauncher.launch(&spec).await.expect("spawned");
        handle.kill().await.expect("kill succeeds");
        let status = handle.wait().await.expect("wait succeeds");
        assert!(!status.success());
        assert!(matches!(handle.try_wait(), Ok(Some(_))));
    }
}
