//! Splits the dissector's line stream into records.
//!
//! Indentation is load-bearing in the dissector's verbose output: a line
//! beginning with four spaces continues the current record, any other line
//! starts a new one. A record is only complete once the first line of its
//! successor (or end of stream) is seen.

use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

/// Dissector invocation used when the operator supplies neither a command
/// nor `--stdin`: capture GSMTAP frames on UDP/4729, verbose, no name
/// resolution.
pub const DEFAULT_DISSECTOR_CMD: &str = "tshark -V -n -i any udp dst port 4729";

/// Continuation marker for record body lines.
const CONTINUATION: &str = "    ";

/// Lazy, unbounded sequence of raw record strings over any line source.
/// Terminates only when the underlying stream closes.
pub struct RecordStream<R> {
    lines: Lines<BufReader<R>>,
    current: String,
    done: bool,
}

impl<R: AsyncRead + Unpin> RecordStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            current: String::new(),
            done: false,
        }
    }

    /// Next complete record, or `None` once the stream is exhausted.
    pub async fn next_record(&mut self) -> std::io::Result<Option<String>> {
        if self.done {
            return Ok(None);
        }
        loop {
            match self.lines.next_line().await? {
                Some(line) => {
                    if line.starts_with(CONTINUATION) {
                        self.current.push('\n');
                        self.current.push_str(&line);
                    } else {
                        let finished = std::mem::replace(&mut self.current, line);
                        if !finished.is_empty() {
                            return Ok(Some(finished));
                        }
                    }
                }
                None => {
                    self.done = true;
                    let finished = std::mem::take(&mut self.current);
                    return Ok(if finished.is_empty() {
                        None
                    } else {
                        Some(finished)
                    });
                }
            }
        }
    }
}

/// Spawn the external dissector and hand back its stdout for segmentation.
/// The child handle must be kept alive for as long as the stream is read.
pub fn command_stream(command: &str) -> std::io::Result<(Child, ChildStdout)> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty dissector command")
    })?;

    let mut child = Command::new(program)
        .args(parts)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let stdout = child.stdout.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "dissector stdout not captured")
    })?;

    Ok((child, stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(input: &str) -> Vec<String> {
        let mut stream = RecordStream::new(input.as_bytes());
        let mut records = Vec::new();
        while let Some(record) = stream.next_record().await.unwrap() {
            records.push(record);
        }
        records
    }

    #[tokio::test]
    async fn two_records_split_on_header_line() {
        let input = "GSM TAP Header, ARFCN: 33\n    Signal Level: -71 dBm\nGSM TAP Header, ARFCN: 51\n    Signal Level: -80 dBm\n";
        let records = collect(input).await;
        assert_eq!(records.len(), 2);
        assert!(records[0].starts_with("GSM TAP Header, ARFCN: 33"));
        assert!(records[0].contains("Signal Level: -71"));
        assert!(records[1].starts_with("GSM TAP Header, ARFCN: 51"));
    }

    #[tokio::test]
    async fn final_record_flushed_at_eof() {
        let records = collect("only line\n    body\n    more body").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], "only line\n    body\n    more body");
    }

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        assert!(collect("").await.is_empty());
    }

    #[tokio::test]
    async fn deep_indentation_stays_in_record() {
        let input = "A\n    one\n        two\nB\n";
        let records = collect(input).await;
        assert_eq!(records, vec!["A\n    one\n        two".to_string(), "B".to_string()]);
    }
}
