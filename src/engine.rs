//! The streaming job engine: one queue message in, a coordinated
//! download → transform → upload pipeline out.
//!
//! Per job, exactly four concurrent activities run: the downloader, the
//! transform, the uploader, and a heartbeat extending the in-flight
//! message's visibility. The three workers are joined by capacity-1
//! channels, so the slowest stage throttles the others and nothing buffers
//! a book's worth of images in memory.
//!
//! The teardown rules keep error handling deadlock-free:
//!
//! * each channel is closed by its unique writer (dropping the sender);
//! * a stage that hits an error first drains its input to EOF, so upstream
//!   senders never block, then reports on the shared error channel;
//! * the per-job scratch directory is removed on every exit path;
//! * the message is deleted at most once, and only after a clean finish.

use std::{sync::Arc, time::Duration};

use regex::Regex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};

use crate::{
    cloud::{Cloud, QueueMsg, VARIANT_PATTERN},
    log_buffer::LogBuffer,
    mail,
    prelude::*,
    stages::{self, Transform},
};

/// Tunables for job execution. Production callers use the default; tests
/// shrink the heartbeat to observe it.
#[derive(Clone)]
pub struct JobOptions {
    /// Period between visibility-extension heartbeats. Visibility is always
    /// extended to twice this.
    pub heartbeat: Duration,
    /// Root for per-job scratch directories.
    pub scratch_root: PathBuf,
    /// Recent log output to attach to poison notifications.
    pub log_buffer: Option<LogBuffer>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(crate::cloud::HEARTBEAT_SECS),
            scratch_root: std::env::temp_dir(),
            log_buffer: None,
        }
    }
}

/// How the uploader disposes of produced files.
enum UploaderKind {
    /// Upload and delete the local file.
    Plain,
    /// Upload, delete, then immediately enqueue the uploaded key (plus the
    /// training identifier) on a downstream queue. Used when fanning pages
    /// out to the ocr-page queue.
    AndQueue { queue: String, training: String },
}

/// The downloader worker: fetch each key into the scratch directory and
/// pass the local path along.
async fn download(
    mut dl: mpsc::Receiver<String>,
    process: mpsc::Sender<PathBuf>,
    conn: Arc<dyn Cloud>,
    dir: PathBuf,
    errc: mpsc::Sender<anyhow::Error>,
) {
    while let Some(key) = dl.recv().await {
        let name = key.rsplit('/').next().unwrap_or(&key).to_owned();
        let path = dir.join(name);
        info!("Downloading {}", key);
        if let Err(err) = conn.download(conn.wip_storage_id(), &key, &path).await {
            drain_keys(&mut dl).await;
            let _ = errc.send(err).await;
            return;
        }
        if process.send(path).await.is_err() {
            // The transform bailed; it has already reported.
            return;
        }
    }
}

async fn drain_keys(dl: &mut mpsc::Receiver<String>) {
    while dl.recv().await.is_some() {}
}

/// The uploader worker: store each produced file under the book's prefix,
/// remove the local copy, and optionally enqueue it downstream. Signals
/// `done` once its input closes.
async fn up(
    mut c: mpsc::Receiver<PathBuf>,
    done: mpsc::Sender<()>,
    conn: Arc<dyn Cloud>,
    bookname: String,
    kind: UploaderKind,
    errc: mpsc::Sender<anyhow::Error>,
) {
    while let Some(path) = c.recv().await {
        let result = upload_one(&conn, &bookname, &path, &kind).await;
        if let Err(err) = result {
            stages::drain(&mut c).await;
            let _ = errc.send(err).await;
            return;
        }
    }
    let _ = done.send(()).await;
}

async fn upload_one(
    conn: &Arc<dyn Cloud>,
    bookname: &str,
    path: &Path,
    kind: &UploaderKind,
) -> Result<()> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("produced path {} has no file name", path.display()))?
        .to_string_lossy();
    let key = format!("{bookname}/{name}");
    info!("Uploading {}", key);
    conn.upload(conn.wip_storage_id(), &key, path).await?;
    tokio::fs::remove_file(path)
        .await
        .with_context(|| format!("failed to remove {}", path.display()))?;
    if let UploaderKind::AndQueue { queue, training } = kind {
        let body = if training.is_empty() {
            key.clone()
        } else {
            format!("{key} {training}")
        };
        info!("Adding {} to queue {}", body, queue);
        conn.add_to_queue(queue, &body)
            .await
            .with_context(|| format!("failed to enqueue {key} on {queue}"))?;
    }
    Ok(())
}

/// The heartbeat worker: periodically extend the message's visibility. If
/// the provider rotates the receipt handle, publish the replacement for the
/// finalizer. A failed heartbeat means our claim on the message is gone, so
/// the worker exits abruptly and lets redelivery take over.
fn spawn_heartbeat(
    conn: Arc<dyn Cloud>,
    msg: QueueMsg,
    queue: String,
    period: Duration,
    rotated: watch::Sender<Option<QueueMsg>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let timeout = (2 * period.as_secs()).max(1) as i32;
        let mut current = msg;
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match conn.queue_heartbeat(&current, &queue, timeout).await {
                Ok(None) => {}
                Ok(Some(m)) => {
                    info!("Replaced message handle as visibility timeout limit was reached");
                    current = m.clone();
                    let _ = rotated.send(Some(m));
                }
                Err(err) => {
                    error!("Error with heartbeat: {:#}", err);
                    std::process::exit(1);
                }
            }
        }
    })
}

/// A job whose streams have run to completion. The heartbeat is still
/// ticking and the message undeleted, so the driver can do its post-done
/// work (fan-in checks, downstream enqueues) before finishing.
struct RunningJob {
    scratch: PathBuf,
    heartbeat: JoinHandle<()>,
    rotated: watch::Receiver<Option<QueueMsg>>,
}

impl RunningJob {
    /// Stop the heartbeat, delete the message using the freshest handle,
    /// and remove the scratch directory.
    async fn finish(self, conn: &Arc<dyn Cloud>, from_queue: &str, msg: &QueueMsg) -> Result<()> {
        self.heartbeat.abort();
        let msg = match self.rotated.borrow().clone() {
            Some(m) => {
                info!("Using new message handle to delete message from queue");
                m
            }
            None => msg.clone(),
        };
        info!("Deleting original message from queue {}", from_queue);
        let deleted = conn
            .del_from_queue(from_queue, &msg.handle)
            .await
            .context("error deleting message from queue");
        let removed = tokio::fs::remove_dir_all(&self.scratch)
            .await
            .with_context(|| format!("failed to remove directory {}", self.scratch.display()));
        deleted.and(removed)
    }

    /// Abandon the job: stop the heartbeat and clean the scratch directory,
    /// leaving the message to be redelivered.
    async fn fail(self) {
        self.heartbeat.abort();
        let _ = tokio::fs::remove_dir_all(&self.scratch).await;
    }
}

/// Wire up and run the download → transform → upload streams for one job,
/// feeding `keys` through them. On success the heartbeat is left running;
/// the caller must `finish` or `fail` the returned job. On error the
/// scratch directory is already gone and the message untouched.
async fn run_streams(
    conn: &Arc<dyn Cloud>,
    bookname: &str,
    keys: Vec<String>,
    transform: Transform,
    uploader: UploaderKind,
    msg: &QueueMsg,
    from_queue: &str,
    opts: &JobOptions,
) -> Result<RunningJob> {
    let scratch = opts.scratch_root.join(bookname);
    tokio::fs::create_dir_all(&scratch)
        .await
        .with_context(|| format!("failed to create directory {}", scratch.display()))?;

    let (dl_tx, dl_rx) = mpsc::channel::<String>(1);
    let (process_tx, process_rx) = mpsc::channel::<PathBuf>(1);
    let (up_tx, up_rx) = mpsc::channel::<PathBuf>(1);
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    // Room for every worker to report without blocking; only the first
    // error is acted on.
    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(4);
    let (rotated_tx, rotated_rx) = watch::channel(None);

    let heartbeat = spawn_heartbeat(
        conn.clone(),
        msg.clone(),
        from_queue.to_owned(),
        opts.heartbeat,
        rotated_tx,
    );

    tokio::spawn(download(
        dl_rx,
        process_tx,
        conn.clone(),
        scratch.clone(),
        err_tx.clone(),
    ));
    tokio::spawn(transform(process_rx, up_tx, err_tx.clone()));
    tokio::spawn(up(
        up_rx,
        done_tx,
        conn.clone(),
        bookname.to_owned(),
        uploader,
        err_tx.clone(),
    ));
    drop(err_tx);

    // Feed the inputs. If a stage fails mid-feed it drains to EOF, so these
    // sends never wedge.
    for key in keys {
        if dl_tx.send(key).await.is_err() {
            break;
        }
    }
    drop(dl_tx);

    let job = RunningJob {
        scratch,
        heartbeat,
        rotated: rotated_rx,
    };
    // An erroring stage enqueues its error before dropping its output
    // sender, so an error always lands before the uploader can observe EOF
    // and signal done; polling the error channel first makes the outcome
    // deterministic.
    tokio::select! {
        biased;
        Some(err) = err_rx.recv() => {
            job.fail().await;
            Err(err)
        }
        _ = done_rx.recv() => Ok(job),
    }
}

/// Check whether all pages of a book have been OCRed: every binarized
/// variant must have a sibling `.hocr` object. An empty variant set or a
/// listing failure counts as "not yet" — the analyse handoff will be
/// retried on a later message.
pub async fn all_ocred(conn: &Arc<dyn Cloud>, bookname: &str) -> bool {
    let objs = match conn.list_objects(conn.wip_storage_id(), bookname).await {
        Ok(objs) => objs,
        Err(err) => {
            warn!("Failed to list objects for {}: {:#}", bookname, err);
            return false;
        }
    };

    let mut atleastone = false;
    for png in objs.iter().filter(|n| VARIANT_PATTERN.is_match(n)) {
        atleastone = true;
        let stem = png.strip_suffix(".png").expect("variant pattern ends in .png");
        let hocrname = format!("{stem}.hocr");
        if !objs.iter().any(|n| *n == hocrname) {
            return false;
        }
    }
    atleastone
}

/// Process a whole-book message: list the bucket by the book's prefix,
/// filter to the keys this stage consumes, and stream them through
/// `transform`.
///
/// When `to_queue` is the ocr-page queue, each produced file is enqueued
/// individually as it uploads; otherwise the book name is enqueued once
/// after a clean finish (if `to_queue` is non-empty).
///
/// Failures on preprocess- or wipe-origin messages are poison: such jobs
/// fail deterministically, and redelivering them would stall the queue and
/// spray partial results downstream on every retry. The message is deleted
/// and a notification sent instead.
#[instrument(level = "debug", skip_all, fields(body = %msg.body))]
pub async fn process_book(
    msg: &QueueMsg,
    conn: &Arc<dyn Cloud>,
    transform: Transform,
    matcher: &Regex,
    from_queue: &str,
    to_queue: &str,
    opts: &JobOptions,
) -> Result<()> {
    let mut parts = msg.body.split_whitespace();
    let bookname = parts
        .next()
        .ok_or_else(|| anyhow!("empty message body"))?
        .to_owned();
    let training = parts.next().unwrap_or("").to_owned();

    info!("Getting list of objects to download");
    let objs = conn
        .list_objects(conn.wip_storage_id(), &bookname)
        .await
        .with_context(|| format!("failed to get list of files for book {bookname}"))?;
    let mut todl = Vec::new();
    for name in objs {
        if matcher.is_match(&name) {
            todl.push(name);
        } else {
            debug!("Skipping item that doesn't match target: {}", name);
        }
    }

    let uploader = if to_queue == conn.ocr_page_queue_id() {
        UploaderKind::AndQueue {
            queue: to_queue.to_owned(),
            training: training.clone(),
        }
    } else {
        UploaderKind::Plain
    };

    match run_streams(conn, &bookname, todl, transform, uploader, msg, from_queue, opts).await {
        Ok(job) => {
            if !to_queue.is_empty() && to_queue != conn.ocr_page_queue_id() {
                info!("Sending {} to queue {}", bookname, to_queue);
                if let Err(err) = conn.add_to_queue(to_queue, &bookname).await {
                    job.fail().await;
                    return Err(err.context(format!("error adding {bookname} to queue")));
                }
            }
            job.finish(conn, from_queue, msg).await
        }
        Err(err) => {
            if from_queue == conn.pre_queue_id() || from_queue == conn.wipe_queue_id() {
                warn!("Deleting message from queue due to a bad error: {}", from_queue);
                if let Err(del_err) = conn.del_from_queue(from_queue, &msg.handle).await {
                    warn!("Error deleting message from queue: {:#}", del_err);
                }
                let logs = opts
                    .log_buffer
                    .as_ref()
                    .map(LogBuffer::recent)
                    .unwrap_or_default();
                mail::notify_poison(from_queue, &bookname, &err, &logs).await;
            }
            Err(err)
        }
    }
}

/// Process a single-page OCR message. The body names one binarized variant
/// key, optionally followed by a per-book training identifier which
/// replaces the worker's default OCR transform. After a clean finish, if
/// every variant of the book now has its hOCR, the book is handed to
/// `to_queue`.
#[instrument(level = "debug", skip_all, fields(body = %msg.body))]
pub async fn ocr_page(
    msg: &QueueMsg,
    conn: &Arc<dyn Cloud>,
    transform: Transform,
    from_queue: &str,
    to_queue: &str,
    opts: &JobOptions,
) -> Result<()> {
    let mut parts = msg.body.split_whitespace();
    let key = parts
        .next()
        .ok_or_else(|| anyhow!("empty message body"))?
        .to_owned();
    let (bookname, _) = key
        .rsplit_once('/')
        .ok_or_else(|| anyhow!("page key {key} has no book prefix"))?;
    let bookname = bookname.to_owned();
    let transform = match parts.next() {
        Some(training) if !training.is_empty() => stages::ocr(training.to_owned()),
        _ => transform,
    };

    let job = run_streams(
        conn,
        &bookname,
        vec![key],
        transform,
        UploaderKind::Plain,
        msg,
        from_queue,
        opts,
    )
    .await?;

    if !to_queue.is_empty() && all_ocred(conn, &bookname).await {
        info!("Sending {} to queue {}", bookname, to_queue);
        if let Err(err) = conn.add_to_queue(to_queue, &bookname).await {
            job.fail().await;
            return Err(err.context(format!("error adding {bookname} to queue")));
        }
    }

    job.finish(conn, from_queue, msg).await
}
