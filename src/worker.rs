//! The worker main loop: round-robin the four queues, dispatching each
//! received message to its stage driver.
//!
//! Each queue has its own check deadline. An empty check pushes that
//! queue's deadline back by a pause; a handled message re-arms the quiet
//! deadline. The ocr-page queue re-checks immediately after handling a
//! message, because OCR work arrives in per-page bursts. When every queue
//! has stayed empty past the quiet deadline the loop returns cleanly,
//! which lets deployments scale workers down to zero.

use std::{sync::Arc, time::Duration};

use regex::Regex;
use tokio::time::{Instant, sleep_until};

use crate::{
    cloud::{Cloud, QueueMsg, QueueRole, VISIBILITY_SECS},
    engine::{self, JobOptions},
    prelude::*,
    stages,
};

/// Worker configuration.
#[derive(Clone)]
pub struct WorkerOptions {
    /// Default OCR training identifier, used when a message carries none.
    pub training: String,
    /// Binarization thresholds for the preprocess stage.
    pub thresholds: Vec<f64>,
    /// Exit cleanly after all queues have been quiet this long.
    pub quiet_after: Duration,
    /// Pause before re-checking a queue that came up empty.
    pub pause: Duration,
    /// Job engine tunables.
    pub job: JobOptions,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            training: String::new(),
            thresholds: vec![0.1, 0.2, 0.3],
            quiet_after: Duration::from_secs(1800),
            pause: Duration::from_secs(1),
            job: JobOptions::default(),
        }
    }
}

/// Filters applied to a book's object listing per stage: the preprocess
/// and wipe stages consume sequenced page images, analyse consumes hOCR.
fn page_image_pattern() -> Regex {
    Regex::new(r"_[0-9]{4}\.(jpg|png)$").expect("static regex")
}

fn hocr_pattern() -> Regex {
    Regex::new(r"\.hocr$").expect("static regex")
}

/// Run the main loop until the queues stay quiet.
pub async fn run(conn: Arc<dyn Cloud>, opts: WorkerOptions) -> Result<()> {
    let page_images = page_image_pattern();
    let hocrs = hocr_pattern();

    let start = Instant::now();
    let mut next_pre = start;
    let mut next_wipe = start;
    let mut next_ocr_page = start;
    let mut next_analyse = start;
    let mut quiet_deadline = start + opts.quiet_after;

    loop {
        tokio::select! {
            _ = sleep_until(next_pre) => {
                let handled = check_and_dispatch(
                    &conn, QueueRole::Preprocess, &opts, &page_images, &hocrs,
                ).await;
                next_pre = Instant::now() + opts.pause;
                if handled {
                    quiet_deadline = Instant::now() + opts.quiet_after;
                }
            }
            _ = sleep_until(next_wipe) => {
                let handled = check_and_dispatch(
                    &conn, QueueRole::Wipe, &opts, &page_images, &hocrs,
                ).await;
                next_wipe = Instant::now() + opts.pause;
                if handled {
                    quiet_deadline = Instant::now() + opts.quiet_after;
                }
            }
            _ = sleep_until(next_ocr_page) => {
                let handled = check_and_dispatch(
                    &conn, QueueRole::OcrPage, &opts, &page_images, &hocrs,
                ).await;
                // OCR work is bursty: a book fans out to one message per
                // variant, so go straight back for the next page.
                next_ocr_page = if handled {
                    Instant::now()
                } else {
                    Instant::now() + opts.pause
                };
                if handled {
                    quiet_deadline = Instant::now() + opts.quiet_after;
                }
            }
            _ = sleep_until(next_analyse) => {
                let handled = check_and_dispatch(
                    &conn, QueueRole::Analyse, &opts, &page_images, &hocrs,
                ).await;
                next_analyse = Instant::now() + opts.pause;
                if handled {
                    quiet_deadline = Instant::now() + opts.quiet_after;
                }
            }
            _ = sleep_until(quiet_deadline) => {
                info!("No work seen for {:?}; exiting", opts.quiet_after);
                return Ok(());
            }
        }
    }
}

/// Check one queue and dispatch any message to its stage driver. Returns
/// whether a message was handled. Driver errors are logged and swallowed:
/// the message stays on the queue (or was poisoned by the driver) and the
/// worker moves on.
async fn check_and_dispatch(
    conn: &Arc<dyn Cloud>,
    role: QueueRole,
    opts: &WorkerOptions,
    page_images: &Regex,
    hocrs: &Regex,
) -> bool {
    let queue = conn.queue_id(role).to_owned();
    let msg = match conn.check_queue(&queue, VISIBILITY_SECS).await {
        Ok(Some(msg)) => msg,
        Ok(None) => return false,
        Err(err) => {
            warn!("Error checking queue {}: {:#}", queue, err);
            return false;
        }
    };

    let result = dispatch(conn, role, &queue, &msg, opts, page_images, hocrs).await;
    if let Err(err) = result {
        warn!("Error processing message {:?} from {}: {:#}", msg.body, queue, err);
    }
    true
}

async fn dispatch(
    conn: &Arc<dyn Cloud>,
    role: QueueRole,
    queue: &str,
    msg: &QueueMsg,
    opts: &WorkerOptions,
    page_images: &Regex,
    hocrs: &Regex,
) -> Result<()> {
    match role {
        QueueRole::Preprocess => {
            engine::process_book(
                msg,
                conn,
                stages::preprocess(opts.thresholds.clone()),
                page_images,
                queue,
                conn.ocr_page_queue_id(),
                &opts.job,
            )
            .await
        }
        QueueRole::Wipe => {
            engine::process_book(
                msg,
                conn,
                stages::wipe(),
                page_images,
                queue,
                conn.ocr_page_queue_id(),
                &opts.job,
            )
            .await
        }
        QueueRole::OcrPage => {
            engine::ocr_page(
                msg,
                conn,
                stages::ocr(opts.training.clone()),
                queue,
                conn.analyse_queue_id(),
                &opts.job,
            )
            .await
        }
        QueueRole::Analyse => {
            let bookname = msg
                .body
                .split_whitespace()
                .next()
                .ok_or_else(|| anyhow!("empty message body"))?
                .to_owned();
            engine::process_book(
                msg,
                conn,
                stages::analyse_stage(conn.clone(), bookname),
                hocrs,
                queue,
                "",
                &opts.job,
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::local::LocalCloud;

    #[tokio::test]
    async fn quiet_shutdown_on_empty_queues() {
        let dir = tempfile::tempdir().unwrap();
        let conn: Arc<dyn Cloud> = Arc::new(LocalCloud::new(dir.path()).await.unwrap());
        let opts = WorkerOptions {
            quiet_after: Duration::from_millis(200),
            pause: Duration::from_millis(50),
            ..WorkerOptions::default()
        };
        // Each queue gets polled at least once, then the quiet timer fires.
        tokio::time::timeout(Duration::from_secs(5), run(conn, opts))
            .await
            .expect("worker should exit before the timeout")
            .expect("worker should exit cleanly");
    }

    #[test]
    fn page_image_pattern_matches_sequenced_pages_only() {
        let re = page_image_pattern();
        assert!(re.is_match("b/page_0001.jpg"));
        assert!(re.is_match("b/page_0012.png"));
        assert!(!re.is_match("b/page_0001_bin0.2.png"));
        assert!(!re.is_match("b/conf"));
        assert!(!re.is_match("b/b.binarised.pdf"));
    }
}
