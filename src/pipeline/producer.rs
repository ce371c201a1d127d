//! External producer process plumbing

use bytes::BytesMut;
use futures::StreamExt;
use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, Command};
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::config::ProducerConfig;

/// Longest stderr line mirrored verbatim; longer lines are cut
const STDERR_LINE_MAX: usize = 4096;

/// Build the producer argument list for one block.
///
/// Optional flags (quiet, interface, gateway) come first, then the template
/// with its placeholders filled in.
pub fn build_args(config: &ProducerConfig, block: &str) -> Vec<String> {
    let mut args = Vec::with_capacity(config.args.len() + 5);

    if config.quiet && !config.quiet_flag.is_empty() {
        args.push(config.quiet_flag.clone());
    }
    if let Some(interface) = config.interface.as_deref().filter(|s| !s.is_empty()) {
        args.push(config.interface_flag.clone());
        args.push(interface.to_string());
    }
    if let Some(gateway) = config.gateway_mac.as_deref().filter(|s| !s.is_empty()) {
        args.push(config.gateway_flag.clone());
        args.push(gateway.to_string());
    }

    let port = config.port.to_string();
    let rate = config.rate.to_string();
    let cooldown = config.cooldown_secs.to_string();
    args.extend(config.args.iter().map(|arg| {
        arg.replace("{block}", block)
            .replace("{port}", &port)
            .replace("{rate}", &rate)
            .replace("{cooldown}", &cooldown)
    }));

    args
}

/// Start the producer for `block` with stdout and stderr captured.
pub fn spawn(config: &ProducerConfig, block: &str) -> io::Result<Child> {
    Command::new(&config.program)
        .args(build_args(config, block))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Exit code and terminating signal, whichever applies
pub fn exit_parts(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

/// One framed line of producer output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerLine {
    Text(String),
    /// Over the length limit; everything up to the next newline was discarded
    TooLong,
    NotUtf8,
}

/// `\n`-delimited lines capped at a maximum length, with a trailing `\r`
/// stripped. Oversized and undecodable lines come out as items so the
/// stream keeps going after them.
pub struct BoundedLines {
    inner: LinesCodec,
}

impl BoundedLines {
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_len),
        }
    }
}

impl Decoder for BoundedLines {
    type Item = ProducerLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<ProducerLine>> {
        classify(self.inner.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<ProducerLine>> {
        classify(self.inner.decode_eof(buf))
    }
}

fn classify(decoded: Result<Option<String>, LinesCodecError>) -> io::Result<Option<ProducerLine>> {
    match decoded {
        Ok(line) => Ok(line.map(ProducerLine::Text)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(ProducerLine::TooLong)),
        // The offending line is already consumed
        Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
            Ok(Some(ProducerLine::NotUtf8))
        }
        Err(LinesCodecError::Io(e)) => Err(e),
    }
}

/// Copy producer stderr into the operator log until the stream closes.
pub async fn mirror_stderr(stderr: ChildStderr, block: String) {
    let mut lines = FramedRead::new(stderr, BoundedLines::new(STDERR_LINE_MAX));
    while let Some(line) = lines.next().await {
        match line {
            Ok(ProducerLine::Text(line)) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    warn!(target: "oplog", block = %block, "producer: {}", line);
                }
            }
            Ok(ProducerLine::TooLong) => {
                warn!(target: "oplog", block = %block, "producer: <stderr line over {} bytes>", STDERR_LINE_MAX);
            }
            Ok(ProducerLine::NotUtf8) => {
                warn!(target: "oplog", block = %block, "producer: <non-UTF-8 stderr line>");
            }
            Err(e) => {
                debug!("Stopped reading producer stderr for {}: {}", block, e);
                break;
            }
        }
    }
}
