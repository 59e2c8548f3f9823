//! Transcoder subprocess: encoded audio on stdin, transport PCM on stdout.

use std::process::Stdio;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::config::TranscoderConfig;
use crate::synthesis::SynthesisError;

/// An owned transcoder process.
///
/// The child is killed when the value is dropped; [`Transcoder::shutdown`]
/// does the same and also reaps it.
pub struct Transcoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    shut_down: bool,
}

impl Transcoder {
    pub fn spawn(config: &TranscoderConfig) -> Result<Self, SynthesisError> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SynthesisError::Transcoder(format!("{}: {e}", config.program)))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        log::debug!(
            "synthesis: transcoder {} started (pid {:?})",
            config.program,
            child.id()
        );

        Ok(Self {
            child,
            stdin,
            stdout,
            shut_down: false,
        })
    }

    /// OS process id, `None` once the child has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdin(&mut self) -> Result<ChildStdin, SynthesisError> {
        self.stdin
            .take()
            .ok_or_else(|| SynthesisError::Transcoder("stdin already taken".into()))
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout, SynthesisError> {
        self.stdout
            .take()
            .ok_or_else(|| SynthesisError::Transcoder("stdout already taken".into()))
    }

    /// Kill and reap the process.  Later calls do nothing.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.stdin = None;
        self.stdout = None;

        if let Err(e) = self.child.start_kill() {
            // Already exited on its own.
            log::debug!("synthesis: transcoder kill: {e}");
        }
        match self.child.wait().await {
            Ok(status) => log::debug!("synthesis: transcoder exited ({status})"),
            Err(e) => log::warn!("synthesis: transcoder wait failed: {e}"),
        }
    }
}
