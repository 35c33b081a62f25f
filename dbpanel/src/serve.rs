//! Line-delimited JSON transport for [`IpcHandler`].
//!
//! Each input line is one request envelope and produces exactly one output
//! line. Requests run concurrently, so responses may come back out of
//! order; clients match them by `id`. Blank lines are skipped.

use dbpanel_core::IpcHandler;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Serves requests from `reader` until end of input.
///
/// Returns the number of requests answered. Pending requests are drained
/// before it returns.
///
/// # Errors
/// Returns an error if reading input or writing a response fails.
pub async fn serve<R, W>(handler: &IpcHandler, reader: R, mut writer: W) -> anyhow::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let reading = {
        let handler = handler.clone();
        async move {
            let mut lines = reader.lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let handler = handler.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = handler.handle_line(&line).await;
                    // The receiver only goes away when writing failed.
                    let _ = tx.send(response);
                });
            }
            debug!("Input closed");
            Ok::<(), std::io::Error>(())
        }
    };

    let writing = async {
        let mut answered: u64 = 0;
        while let Some(response) = rx.recv().await {
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
            writer.flush().await?;
            answered = answered.saturating_add(1);
        }
        Ok::<u64, anyhow::Error>(answered)
    };

    let (read, written) = tokio::join!(reading, writing);
    read?;
    let answered = written?;
    info!("Answered {} request(s)", answered);
    Ok(answered)
}
