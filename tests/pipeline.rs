//! End-to-end pipeline scenarios against the local cloud adapter.
//!
//! The OCR transform is the only stage that shells out to an external
//! binary, so these tests inject a stand-in transform that writes hOCR
//! fixtures; everything else — the streaming engine, the queue protocol,
//! binarization, analysis, PDF and report output — runs for real.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bindery::{
    cloud::{Cloud, QueueMsg, QueueRole, local::LocalCloud},
    engine::{self, JobOptions},
    prelude::*,
    stages::{self, Transform},
};
use regex::Regex;
use tokio::time::timeout;

const HOCR_FIXTURE: &str = r#"<html><body><div class='ocr_page' title='bbox 0 0 60 90'>
  <span class='ocrx_word' title='bbox 5 5 55 20; x_wconf 87'>fixture</span>
</div></body></html>"#;

/// A [`Cloud`] wrapper that counts deletions and heartbeats, so tests can
/// assert the at-most-once and heartbeat-coverage properties without
/// test-only hooks in the production adapters.
struct CountingCloud {
    inner: LocalCloud,
    deletes: AtomicUsize,
    heartbeats: AtomicUsize,
}

impl CountingCloud {
    async fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalCloud::new(root).await.unwrap(),
            deletes: AtomicUsize::new(0),
            heartbeats: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Cloud for CountingCloud {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_objects(bucket, prefix).await
    }

    async fn download(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        self.inner.download(bucket, key, path).await
    }

    async fn upload(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        self.inner.upload(bucket, key, path).await
    }

    async fn check_queue(&self, queue: &str, timeout_secs: i32) -> Result<Option<QueueMsg>> {
        self.inner.check_queue(queue, timeout_secs).await
    }

    async fn add_to_queue(&self, queue: &str, body: &str) -> Result<()> {
        self.inner.add_to_queue(queue, body).await
    }

    async fn del_from_queue(&self, queue: &str, handle: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.del_from_queue(queue, handle).await
    }

    async fn queue_heartbeat(
        &self,
        msg: &QueueMsg,
        queue: &str,
        timeout_secs: i32,
    ) -> Result<Option<QueueMsg>> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        self.inner.queue_heartbeat(msg, queue, timeout_secs).await
    }

    fn queue_id(&self, role: QueueRole) -> &str {
        self.inner.queue_id(role)
    }

    fn wip_storage_id(&self) -> &str {
        self.inner.wip_storage_id()
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    cloud: Arc<CountingCloud>,
    conn: Arc<dyn Cloud>,
    opts: JobOptions,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cloud = CountingCloud::new(&dir.path().join("cloud")).await;
        let conn: Arc<dyn Cloud> = cloud.clone();
        let opts = JobOptions {
            scratch_root: dir.path().join("scratch"),
            ..JobOptions::default()
        };
        Self {
            dir,
            cloud,
            conn,
            opts,
        }
    }

    /// Upload a tiny page image under the given key.
    async fn seed_page(&self, key: &str) {
        let path = self.dir.path().join("seed-page");
        let ext = key.rsplit('.').next().unwrap();
        let path = path.with_extension(ext);
        image::RgbImage::from_pixel(60, 90, image::Rgb([250u8, 250, 250]))
            .save(&path)
            .unwrap();
        self.conn
            .upload(self.conn.wip_storage_id(), key, &path)
            .await
            .unwrap();
    }

    /// Receive one message, failing the test if the queue is empty.
    async fn must_receive(&self, queue: &str) -> QueueMsg {
        self.conn
            .check_queue(queue, 120)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("expected a message on {queue}"))
    }

    async fn queue_len(&self, role: QueueRole) -> usize {
        // Zero visibility receives don't hide anything, so counting by
        // repeated receive would loop forever; list the backing dir instead.
        let queue = self.conn.queue_id(role);
        let dir = self.dir.path().join("cloud").join("queues").join(queue);
        std::fs::read_dir(dir).unwrap().count()
    }
}

/// A transform that writes an hOCR fixture next to each input, in place of
/// running tesseract.
fn fake_ocr() -> Transform {
    Box::new(|mut input, output, _errc| {
        Box::pin(async move {
            while let Some(path) = input.recv().await {
                let hocr = path.with_extension("hocr");
                std::fs::write(&hocr, HOCR_FIXTURE).unwrap();
                if output.send(hocr).await.is_err() {
                    return;
                }
            }
        })
    })
}

/// A transform that fails on its first input, honoring the drain-on-error
/// contract: drain, report, and only then release the output channel.
fn failing_transform(msg: &'static str) -> Transform {
    Box::new(move |mut input, output, errc| {
        Box::pin(async move {
            if input.recv().await.is_some() {
                while input.recv().await.is_some() {}
                let _ = errc.send(anyhow!(msg)).await;
            }
            drop(output);
        })
    })
}

/// A transform that passes files through unchanged after a delay, to keep a
/// job in flight while the heartbeat ticks.
fn slow_passthrough(delay: Duration) -> Transform {
    Box::new(move |mut input, output, _errc| {
        Box::pin(async move {
            while let Some(path) = input.recv().await {
                tokio::time::sleep(delay).await;
                if output.send(path).await.is_err() {
                    return;
                }
            }
        })
    })
}

fn page_images() -> Regex {
    Regex::new(r"_[0-9]{4}\.(jpg|png)$").unwrap()
}

fn hocrs() -> Regex {
    Regex::new(r"\.hocr$").unwrap()
}

#[tokio::test]
async fn happy_path_two_pages_three_thresholds() {
    let fx = Fixture::new().await;
    fx.seed_page("b/p_0001.jpg").await;
    fx.seed_page("b/p_0002.jpg").await;

    // Stage 1: preprocess the whole book, fanning variants out to the
    // ocr-page queue.
    let pre_q = fx.conn.pre_queue_id().to_owned();
    let ocr_q = fx.conn.ocr_page_queue_id().to_owned();
    let analyse_q = fx.conn.analyse_queue_id().to_owned();

    fx.conn.add_to_queue(&pre_q, "b").await.unwrap();
    let msg = fx.must_receive(&pre_q).await;
    timeout(
        Duration::from_secs(60),
        engine::process_book(
            &msg,
            &fx.conn,
            stages::preprocess(vec![0.1, 0.2, 0.3]),
            &page_images(),
            &pre_q,
            &ocr_q,
            &fx.opts,
        ),
    )
    .await
    .expect("preprocess should not wedge")
    .expect("preprocess should succeed");

    let variants = fx
        .conn
        .list_objects(fx.conn.wip_storage_id(), "b")
        .await
        .unwrap()
        .into_iter()
        .filter(|k| bindery::cloud::VARIANT_PATTERN.is_match(k))
        .collect::<Vec<_>>();
    assert_eq!(variants.len(), 6, "2 pages x 3 thresholds");
    assert_eq!(fx.queue_len(QueueRole::OcrPage).await, 6);
    assert_eq!(fx.queue_len(QueueRole::Preprocess).await, 0, "message deleted");

    // Stage 2: OCR each page message; the sixth success triggers the
    // analyse handoff, exactly once.
    for i in 0..6 {
        let msg = fx.must_receive(&ocr_q).await;
        assert!(
            bindery::cloud::VARIANT_PATTERN.is_match(&msg.body),
            "ocr-page body should be a bare variant key, got {:?}",
            msg.body
        );
        timeout(
            Duration::from_secs(30),
            engine::ocr_page(&msg, &fx.conn, fake_ocr(), &ocr_q, &analyse_q, &fx.opts),
        )
        .await
        .expect("ocr should not wedge")
        .expect("ocr should succeed");
        let expected_analyse = if i == 5 { 1 } else { 0 };
        assert_eq!(fx.queue_len(QueueRole::Analyse).await, expected_analyse);
    }
    assert_eq!(fx.queue_len(QueueRole::OcrPage).await, 0);

    // Stage 3: analyse aggregates the book.
    let msg = fx.must_receive(&analyse_q).await;
    assert_eq!(msg.body, "b");
    timeout(
        Duration::from_secs(60),
        engine::process_book(
            &msg,
            &fx.conn,
            stages::analyse_stage(fx.conn.clone(), "b".to_owned()),
            &hocrs(),
            &analyse_q,
            "",
            &fx.opts,
        ),
    )
    .await
    .expect("analyse should not wedge")
    .expect("analyse should succeed");

    let finals = fx
        .conn
        .list_objects(fx.conn.wip_storage_id(), "b")
        .await
        .unwrap();
    for artifact in ["b/conf", "b/best", "b/b.binarised.pdf", "b/b.colour.pdf"] {
        assert!(finals.contains(&artifact.to_owned()), "missing {artifact}");
    }
    assert_eq!(fx.queue_len(QueueRole::Analyse).await, 0);

    // One deletion per processed message: 1 preprocess + 6 ocr + 1 analyse.
    assert_eq!(fx.cloud.deletes.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn training_is_threaded_through_to_ocr_page_messages() {
    let fx = Fixture::new().await;
    fx.seed_page("b/p_0001.jpg").await;

    let pre_q = fx.conn.pre_queue_id().to_owned();
    let ocr_q = fx.conn.ocr_page_queue_id().to_owned();
    fx.conn.add_to_queue(&pre_q, "b frenchmodel").await.unwrap();
    let msg = fx.must_receive(&pre_q).await;
    engine::process_book(
        &msg,
        &fx.conn,
        stages::preprocess(vec![0.1]),
        &page_images(),
        &pre_q,
        &ocr_q,
        &fx.opts,
    )
    .await
    .unwrap();

    let msg = fx.must_receive(&ocr_q).await;
    assert_eq!(msg.body, "b/p_0001_bin0.1.png frenchmodel");
}

#[tokio::test]
async fn transform_error_keeps_message_and_cleans_scratch() {
    let fx = Fixture::new().await;
    fx.seed_page("b/p_0003_bin0.1.png").await;

    let ocr_q = fx.conn.ocr_page_queue_id().to_owned();
    let analyse_q = fx.conn.analyse_queue_id().to_owned();
    fx.conn
        .add_to_queue(&ocr_q, "b/p_0003_bin0.1.png")
        .await
        .unwrap();
    let msg = fx.must_receive(&ocr_q).await;

    let err = timeout(
        Duration::from_secs(30),
        engine::ocr_page(
            &msg,
            &fx.conn,
            failing_transform("ocr exploded"),
            &ocr_q,
            &analyse_q,
            &fx.opts,
        ),
    )
    .await
    .expect("error path should not wedge")
    .expect_err("transform failure should surface");
    assert!(err.to_string().contains("ocr exploded"));

    // Transient: nothing deleted, so the message comes back after the
    // visibility timeout. Scratch is gone.
    assert_eq!(fx.cloud.deletes.load(Ordering::SeqCst), 0);
    assert_eq!(fx.queue_len(QueueRole::OcrPage).await, 1);
    assert!(!fx.opts.scratch_root.join("b").exists());
    assert_eq!(fx.queue_len(QueueRole::Analyse).await, 0);
}

#[tokio::test]
async fn drain_safety_with_many_pending_inputs() {
    let fx = Fixture::new().await;
    for i in 1..=5 {
        fx.seed_page(&format!("b/p_{i:04}.jpg")).await;
    }
    let pre_q = fx.conn.pre_queue_id().to_owned();
    fx.conn.add_to_queue(&pre_q, "b").await.unwrap();
    let msg = fx.must_receive(&pre_q).await;

    // The transform dies on the first page while four more are queued
    // behind it; the job must still unwind promptly.
    let result = timeout(
        Duration::from_secs(10),
        engine::process_book(
            &msg,
            &fx.conn,
            failing_transform("binarizer crashed"),
            &page_images(),
            &pre_q,
            "",
            &fx.opts,
        ),
    )
    .await
    .expect("teardown should not deadlock");
    assert!(result.is_err());
    assert!(!fx.opts.scratch_root.join("b").exists());
}

#[tokio::test]
async fn preprocess_poison_deletes_message_without_downstream_work() {
    let fx = Fixture::new().await;
    fx.seed_page("corrupt/p_0001.jpg").await;

    let pre_q = fx.conn.pre_queue_id().to_owned();
    let ocr_q = fx.conn.ocr_page_queue_id().to_owned();
    fx.conn.add_to_queue(&pre_q, "corrupt").await.unwrap();
    let msg = fx.must_receive(&pre_q).await;

    let result = engine::process_book(
        &msg,
        &fx.conn,
        failing_transform("deterministic failure"),
        &page_images(),
        &pre_q,
        &ocr_q,
        &fx.opts,
    )
    .await;
    assert!(result.is_err(), "the error still surfaces to the caller");

    // Poison: deleted rather than redelivered, and nothing fanned out.
    assert_eq!(fx.cloud.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(fx.queue_len(QueueRole::Preprocess).await, 0);
    assert_eq!(fx.queue_len(QueueRole::OcrPage).await, 0);
}

#[tokio::test]
async fn heartbeat_covers_a_slow_job_and_deletes_with_latest_handle() {
    let fx = Fixture::new().await;
    fx.seed_page("b/p_0001_bin0.1.png").await;

    let ocr_q = fx.conn.ocr_page_queue_id().to_owned();
    fx.conn
        .add_to_queue(&ocr_q, "b/p_0001_bin0.1.png")
        .await
        .unwrap();
    let msg = fx.must_receive(&ocr_q).await;

    let opts = JobOptions {
        heartbeat: Duration::from_millis(50),
        ..fx.opts.clone()
    };
    timeout(
        Duration::from_secs(30),
        engine::ocr_page(
            &msg,
            &fx.conn,
            slow_passthrough(Duration::from_millis(260)),
            &ocr_q,
            "",
            &opts,
        ),
    )
    .await
    .expect("slow job should still finish")
    .expect("slow job should succeed");

    // ~260ms of work at a 50ms heartbeat: allow generous scheduling slop,
    // but it must have beaten more than once and then been deleted once.
    let beats = fx.cloud.heartbeats.load(Ordering::SeqCst);
    assert!(beats >= 2, "expected at least 2 heartbeats, saw {beats}");
    assert_eq!(fx.cloud.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(fx.queue_len(QueueRole::OcrPage).await, 0);
}

/// A [`Cloud`] wrapper that rotates the receipt handle on every heartbeat,
/// the way some providers refresh receipt handles when visibility is
/// extended. Deletion must then use the freshest handle.
struct RotatingCloud {
    inner: LocalCloud,
    rotated_deletes: AtomicUsize,
}

impl RotatingCloud {
    fn real_handle(handle: &str) -> &str {
        handle.strip_suffix("#rotated").unwrap_or(handle)
    }
}

#[async_trait]
impl Cloud for RotatingCloud {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_objects(bucket, prefix).await
    }

    async fn download(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        self.inner.download(bucket, key, path).await
    }

    async fn upload(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        self.inner.upload(bucket, key, path).await
    }

    async fn check_queue(&self, queue: &str, timeout_secs: i32) -> Result<Option<QueueMsg>> {
        self.inner.check_queue(queue, timeout_secs).await
    }

    async fn add_to_queue(&self, queue: &str, body: &str) -> Result<()> {
        self.inner.add_to_queue(queue, body).await
    }

    async fn del_from_queue(&self, queue: &str, handle: &str) -> Result<()> {
        if handle.ends_with("#rotated") {
            self.rotated_deletes.fetch_add(1, Ordering::SeqCst);
        }
        self.inner
            .del_from_queue(queue, Self::real_handle(handle))
            .await
    }

    async fn queue_heartbeat(
        &self,
        msg: &QueueMsg,
        queue: &str,
        timeout_secs: i32,
    ) -> Result<Option<QueueMsg>> {
        let real = QueueMsg {
            handle: Self::real_handle(&msg.handle).to_owned(),
            ..msg.clone()
        };
        self.inner.queue_heartbeat(&real, queue, timeout_secs).await?;
        Ok(Some(QueueMsg {
            handle: format!("{}#rotated", real.handle),
            ..real
        }))
    }

    fn queue_id(&self, role: QueueRole) -> &str {
        self.inner.queue_id(role)
    }

    fn wip_storage_id(&self) -> &str {
        self.inner.wip_storage_id()
    }
}

#[tokio::test]
async fn rotated_handle_is_used_for_deletion() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(RotatingCloud {
        inner: LocalCloud::new(dir.path().join("cloud")).await.unwrap(),
        rotated_deletes: AtomicUsize::new(0),
    });
    let conn: Arc<dyn Cloud> = cloud.clone();

    let seed = dir.path().join("seed.png");
    image::GrayImage::from_pixel(10, 10, image::Luma([255u8]))
        .save(&seed)
        .unwrap();
    conn.upload(conn.wip_storage_id(), "b/p_0001_bin0.1.png", &seed)
        .await
        .unwrap();

    let ocr_q = conn.ocr_page_queue_id().to_owned();
    conn.add_to_queue(&ocr_q, "b/p_0001_bin0.1.png").await.unwrap();
    let msg = conn.check_queue(&ocr_q, 120).await.unwrap().unwrap();

    let opts = JobOptions {
        heartbeat: Duration::from_millis(50),
        scratch_root: dir.path().join("scratch"),
        ..JobOptions::default()
    };
    timeout(
        Duration::from_secs(30),
        engine::ocr_page(
            &msg,
            &conn,
            slow_passthrough(Duration::from_millis(150)),
            &ocr_q,
            "",
            &opts,
        ),
    )
    .await
    .expect("job should finish")
    .expect("job should succeed");

    assert!(
        cloud.rotated_deletes.load(Ordering::SeqCst) >= 1,
        "deletion should have used the rotated handle"
    );
    let queue_dir = dir.path().join("cloud/queues").join(&ocr_q);
    assert_eq!(std::fs::read_dir(queue_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn redelivered_page_succeeds_after_transient_failure() {
    let fx = Fixture::new().await;
    fx.seed_page("b/p_0001_bin0.1.png").await;

    let ocr_q = fx.conn.ocr_page_queue_id().to_owned();
    let analyse_q = fx.conn.analyse_queue_id().to_owned();
    fx.conn
        .add_to_queue(&ocr_q, "b/p_0001_bin0.1.png")
        .await
        .unwrap();

    // First delivery fails; ask for zero visibility so the retry is
    // immediate.
    let msg = fx.conn.check_queue(&ocr_q, 0).await.unwrap().unwrap();
    let _ = engine::ocr_page(
        &msg,
        &fx.conn,
        failing_transform("flaky"),
        &ocr_q,
        &analyse_q,
        &fx.opts,
    )
    .await;

    // Redelivery succeeds and completes the book.
    let msg = fx.must_receive(&ocr_q).await;
    engine::ocr_page(&msg, &fx.conn, fake_ocr(), &ocr_q, &analyse_q, &fx.opts)
        .await
        .expect("redelivered page should succeed");
    assert_eq!(fx.queue_len(QueueRole::OcrPage).await, 0);
    assert_eq!(fx.queue_len(QueueRole::Analyse).await, 1);
}

