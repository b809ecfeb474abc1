//! Request/response links between the bridge and an engine.

use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use super::engine::VemEngine;
use super::protocol::{Request, Response};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("engine closed the connection")]
    Closed,
    #[error("malformed engine message: {0}")]
    Decode(String),
}

/// One synchronous request/response exchange at a time.
pub trait Transport: Send {
    fn round_trip(&mut self, request: &Request, timeout: Duration)
        -> Result<Response, TransportError>;

    /// Releases the link. Later round trips fail with [`TransportError::Closed`].
    fn close(&mut self);
}

/// Engine running as a child process, spoken to over piped stdio.
///
/// A reader thread forwards stdout lines into a channel so every round trip can honour its
/// timeout.
pub struct ProcessTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<io::Result<String>>,
}

impl ProcessTransport {
    pub fn spawn(program: &Path, args: &[String]) -> io::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "engine stdout missing"))?;
        let (sender, lines) = mpsc::channel();
        thread::Builder::new()
            .name("ndvem-engine-reader".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let failed = line.is_err();
                    if sender.send(line).is_err() || failed {
                        break;
                    }
                }
            })?;
        Ok(ProcessTransport {
            child,
            stdin,
            lines,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl Transport for ProcessTransport {
    fn round_trip(
        &mut self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::Closed)?;
        let mut line =
            serde_json::to_string(request).map_err(|err| TransportError::Decode(err.to_string()))?;
        line.push('\n');
        stdin.write_all(line.as_bytes())?;
        stdin.flush()?;
        match self.lines.recv_timeout(timeout) {
            Ok(Ok(reply)) => {
                serde_json::from_str(&reply).map_err(|err| TransportError::Decode(err.to_string()))
            }
            Ok(Err(err)) => Err(TransportError::Io(err)),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn close(&mut self) {
        // Closing stdin is the engine's cue to exit.
        self.stdin.take();
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                thread::sleep(Duration::from_millis(20));
                if !matches!(self.child.try_wait(), Ok(Some(_))) {
                    let _ = self.child.kill();
                }
                let _ = self.child.wait();
            }
        }
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            self.close();
        }
    }
}

/// In-process engine. Messages still pass through the JSON encoding.
pub struct LoopbackTransport {
    engine: Option<VemEngine>,
}

impl LoopbackTransport {
    pub fn new(engine: VemEngine) -> Self {
        LoopbackTransport {
            engine: Some(engine),
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(VemEngine::default())
    }
}

impl Transport for LoopbackTransport {
    fn round_trip(
        &mut self,
        request: &Request,
        _timeout: Duration,
    ) -> Result<Response, TransportError> {
        let engine = self.engine.as_mut().ok_or(TransportError::Closed)?;
        let decode = |err: serde_json::Error| TransportError::Decode(err.to_string());
        let wire = serde_json::to_string(request).map_err(decode)?;
        let response = engine.handle(serde_json::from_str(&wire).map_err(decode)?);
        let wire = serde_json::to_string(&response).map_err(decode)?;
        serde_json::from_str(&wire).map_err(decode)
    }

    fn close(&mut self) {
        self.engine = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vem::protocol::PROTOCOL_VERSION;

    #[test]
    fn loopback_answers_until_closed() {
        let mut transport = LoopbackTransport::default();
        let hello = Request::Hello {
            protocol: PROTOCOL_VERSION,
        };
        let reply = transport.round_trip(&hello, Duration::from_secs(1)).unwrap();
        assert!(matches!(reply, Response::Ready { .. }));
        transport.close();
        assert!(matches!(
            transport.round_trip(&hello, Duration::from_secs(1)),
            Err(TransportError::Closed)
        ));
    }
}
