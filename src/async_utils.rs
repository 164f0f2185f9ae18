//! Asynchronous utilities for use with Tokio.
//!
//! Everything else in this crate is built on channel-connected tasks, and
//! these are the few helpers they all share.

use std::process::Output;

use futures::future::BoxFuture;

use crate::prelude::*;

/// A boxed future, for storing futures of varying concrete types.
pub type BoxedFuture<T> = BoxFuture<'static, T>;

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        // Propagate any panics from the blocking task.
        .unwrap()
}

/// Report any command failures, including whatever the command printed.
///
/// External OCR tools tend to put the interesting diagnostics on stderr, so a
/// bare exit code is not enough to debug a failed page.
pub fn check_for_command_failure(command_name: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        Ok(())
    } else {
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            // Not all platforms have exit codes.
            .unwrap_or_else(|| "unknown".to_owned());
        Err(anyhow!(
            "{} failed with exit code {}\nStdout: {}\nStderr: {}",
            command_name,
            code,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        ))
    }
}
