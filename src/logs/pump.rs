use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

use super::{LogRecord, LogSender, StreamId};

/// Longest piece of a line held before it is forwarded.
const MAX_LINE: usize = 64 * 1024;

/// Forwards `reader` to the log writer line by line until EOF.
///
/// Bytes are passed through untouched. A line longer than [`MAX_LINE`] goes
/// out in pieces that the writer joins back into one line, and a trailing
/// fragment without newline is terminated at EOF.
pub async fn pump_lines<R>(reader: R, stream: StreamId, sender: LogSender)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut open = false;
    loop {
        let buffer = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(buffer) => buffer,
            Err(err) => {
                debug!(%stream, "stopped reading child output: {err}");
                break;
            }
        };
        let room = MAX_LINE - line.len();
        let (taken, complete) = match buffer.iter().position(|byte| *byte == b'\n') {
            Some(newline) if newline < room => (newline + 1, true),
            _ => (buffer.len().min(room), false),
        };
        line.extend_from_slice(&buffer[..taken]);
        reader.consume(taken);
        if complete {
            let line = std::mem::take(&mut line);
            sender.send(LogRecord::Output { stream, line }).await;
            open = false;
        } else if line.len() >= MAX_LINE {
            let bytes = std::mem::take(&mut line);
            sender.send(LogRecord::Fragment { stream, bytes }).await;
            open = true;
        }
    }
    if !line.is_empty() || open {
        sender.send(LogRecord::Output { stream, line }).await;
    }
}
