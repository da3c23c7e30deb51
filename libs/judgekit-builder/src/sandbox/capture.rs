// Bounded capture of a child's output stream.
// Past the byte cap the stream is still drained, so the child never blocks
// on a full pipe, but the data is discarded.

use judgekit_common::config::OutputLimits;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
}

impl CapturedOutput {
    /// Placeholder for a stream that could not be drained in time.
    pub fn lost() -> Self {
        Self {
            text: String::new(),
            truncated: true,
        }
    }
}

pub async fn capture<R: AsyncRead + Unpin>(mut reader: R, limits: OutputLimits) -> CapturedOutput {
    let mut kept: Vec<u8> = Vec::with_capacity(limits.max_bytes.min(64 * 1024));
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limits.max_bytes.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "output stream ended with error");
                break;
            }
        }
    }

    let text = String::from_utf8_lossy(&kept);
    let (text, clipped) = clip_lines(&text, limits.max_lines, limits.max_line_chars);
    CapturedOutput {
        text,
        truncated: truncated || clipped,
    }
}

/// Keep at most `max_lines` lines of at most `max_line_chars` characters.
pub fn clip_lines(text: &str, max_lines: usize, max_line_chars: usize) -> (String, bool) {
    let mut clipped = false;
    let mut out = String::with_capacity(text.len());

    for (index, line) in text.split_inclusive('\n').enumerate() {
        if index >= max_lines {
            clipped = true;
            break;
        }
        let (body, newline) = match line.strip_suffix('\n') {
            Some(body) => (body, true),
            None => (line, false),
        };
        if body.chars().count() > max_line_chars {
            clipped = true;
            out.extend(body.chars().take(max_line_chars));
        } else {
            out.push_str(body);
        }
        if newline {
            out.push('\n');
        }
    }

    (out, clipped)
}
