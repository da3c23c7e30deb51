/// JSON-lines plumbing between stdio and the submission pool.
///
/// One `SubmissionRequest` per input line, one `CompletedSubmission` per
/// output line. Output order is completion order; consumers correlate by id.

use anyhow::{Context, Result};
use judgekit_builder::pool::{PoolError, SubmissionPool};
use judgekit_common::types::{CompletedSubmission, SubmissionRequest};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Feed requests into the pool until EOF. Returns how many were accepted.
pub async fn read_requests<R>(reader: R, pool: &SubmissionPool) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut accepted = 0;
    let mut line_number = 0usize;

    while let Some(line) = lines.next_line().await.context("failed to read submission")? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let request: SubmissionRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                error!(line = line_number, error = %e, "skipping malformed submission");
                continue;
            }
        };

        debug!(
            submission_id = %request.id,
            problem_type = %request.problem.problem_type,
            test_cases = request.test_cases.len(),
            "received submission"
        );
        match pool.submit(request).await {
            Ok(_) => accepted += 1,
            Err(PoolError::ShuttingDown) => {
                warn!("pool is shutting down, no longer reading submissions");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(accepted, "input closed");
    Ok(accepted)
}

/// Write results until the pool drops its end of the channel.
pub async fn write_results<W>(mut results: mpsc::UnboundedReceiver<CompletedSubmission>, mut writer: W) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(completed) = results.recv().await {
        let mut line = serde_json::to_vec(&completed).context("failed to encode result")?;
        line.push(b'\n');
        writer.write_all(&line).await.context("failed to write result")?;
        writer.flush().await.context("failed to flush result")?;
        written += 1;
    }
    Ok(written)
}
