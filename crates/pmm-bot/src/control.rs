//! The operator control channel.
//!
//! A Unix-domain socket beside the pid file. Frames are single JSON
//! lines: the client sends `{"cmd": ..., "args": [...]}`, the daemon
//! streams `{"out": "..."}` chunks and finishes with
//! `{"exit": code}`. Streaming matters for the backtest progress
//! dots.

use crate::app::App;
use crate::commands;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    #[serde(skip_serializing_if = "Option::is_none")]
    out: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit: Option<i32>,
}

/// `io::Write` that wraps every chunk into an `{"out": ...}` frame.
struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> Write for FrameWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let frame = Frame {
            out: Some(String::from_utf8_lossy(buf).into_owned()),
            exit: None,
        };
        let line = serde_json::to_string(&frame)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(self.inner, "{line}")?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Bind the control socket and serve commands until the process
/// exits. Each connection gets its own thread; trader-touching work
/// is marshalled to the worker inside the command handlers.
pub fn serve(app: Arc<App>, socket_path: &Path) -> std::io::Result<thread::JoinHandle<()>> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "control socket listening");
    thread::Builder::new().name("pmm-control".into()).spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    continue;
                }
            };
            let app = app.clone();
            let spawned = thread::Builder::new()
                .name("pmm-control-conn".into())
                .spawn(move || handle_connection(&app, stream));
            if let Err(e) = spawned {
                warn!(error = %e, "control connection thread failed to start");
            }
        }
    })
}

fn handle_connection(app: &App, stream: UnixStream) {
    let reader = match stream.try_clone() {
        Ok(s) => BufReader::new(s),
        Err(e) => {
            warn!(error = %e, "control connection clone failed");
            return;
        }
    };
    let mut line = String::new();
    let mut reader = reader;
    if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
        return;
    }
    let request: Request = match serde_json::from_str(line.trim()) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed control request");
            return;
        }
    };
    info!(cmd = %request.cmd, "control command");

    let mut writer = FrameWriter { inner: stream };
    let code = commands::execute(app, &request.cmd, &request.args, &mut writer);
    let frame = Frame {
        out: None,
        exit: Some(code),
    };
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = writeln!(writer.inner, "{text}");
        let _ = writer.inner.flush();
    }
}

/// Client side: send one command, stream the output to `out`, and
/// return the daemon's exit code.
pub fn send_command(
    socket_path: &Path,
    cmd: &str,
    args: &[String],
    out: &mut dyn Write,
) -> std::io::Result<i32> {
    let stream = UnixStream::connect(socket_path)?;
    let mut writer = stream.try_clone()?;
    let request = Request {
        cmd: cmd.to_string(),
        args: args.to_vec(),
    };
    writeln!(writer, "{}", serde_json::to_string(&request)?)?;
    writer.flush()?;

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let frame: Frame = match serde_json::from_str(&line) {
            Ok(f) => f,
            Err(_) => continue,
        };
        if let Some(chunk) = frame.out {
            out.write_all(chunk.as_bytes())?;
            out.flush()?;
        }
        if let Some(code) = frame.exit {
            return Ok(code);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed before exit frame",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_writer_wraps_chunks() {
        let mut sink = Vec::new();
        {
            let mut fw = FrameWriter { inner: &mut sink };
            fw.write_all(b"hello\n").unwrap();
            fw.write_all(b".").unwrap();
        }
        let lines: Vec<&str> = std::str::from_utf8(&sink)
            .unwrap()
            .lines()
            .collect();
        assert_eq!(lines.len(), 2);
        let first: Frame = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.out.as_deref(), Some("hello\n"));
        let second: Frame = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.out.as_deref(), Some("."));
    }

    #[test]
    fn test_request_roundtrip() {
        let req = Request {
            cmd: "achieve".into(),
            args: vec!["btc".into(), "100".into(), "2".into()],
        };
        let text = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&text).unwrap();
        assert_eq!(back.cmd, "achieve");
        assert_eq!(back.args.len(), 3);
    }
}
