//! A local-disk implementation of the [`Cloud`] contract.
//!
//! The bucket is a directory tree and each queue is a directory holding one
//! file per message. A message file's first line is the Unix-millisecond
//! timestamp before which the message is invisible; the rest is the body.
//! That is enough to honor receive-with-visibility-timeout and heartbeat
//! extension for a single consumer, which is all the test suite and offline
//! runs need. It is NOT safe for multiple concurrent worker processes —
//! use the AWS adapter for real deployments.
//!
//! Unlike SQS, `check_queue` here returns immediately when the queue is
//! empty instead of long-polling. A local run is expected to drain its
//! queues and then let the worker's quiet timer fire; a 20-second poll per
//! empty queue would defeat that.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs;

use crate::{
    cloud::{Cloud, QueueMsg, QueueRole},
    prelude::*,
};

/// Queue directory names, in [`QueueRole`] order.
const QUEUE_NAMES: [&str; 4] = ["preprocess", "wipe", "ocrpage", "analyse"];

/// Name of the bucket directory under the root.
const BUCKET: &str = "bucket";

/// A directory-backed cloud stub.
pub struct LocalCloud {
    root: PathBuf,
    /// Monotonic source for message ids, namespaced by process start.
    counter: std::sync::atomic::AtomicU64,
}

impl LocalCloud {
    /// Create an adapter rooted at `root`, creating the bucket and queue
    /// directories if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(BUCKET))
            .await
            .with_context(|| format!("failed to create bucket dir under {}", root.display()))?;
        for name in QUEUE_NAMES {
            fs::create_dir_all(root.join("queues").join(name))
                .await
                .with_context(|| format!("failed to create queue dir {name}"))?;
        }
        Ok(Self {
            root,
            counter: std::sync::atomic::AtomicU64::new(0),
        })
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join("queues").join(queue)
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_millis() as u64
    }

    fn next_id(&self) -> String {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("{}-{}-{}", std::process::id(), Self::now_millis(), n)
    }

    /// Parse a message file into (visible_at_millis, body).
    fn parse_msg(contents: &str) -> Option<(u64, String)> {
        let (stamp, body) = contents.split_once('\n')?;
        let visible_at = stamp.trim().parse::<u64>().ok()?;
        Some((visible_at, body.to_owned()))
    }
}

#[async_trait]
impl Cloud for LocalCloud {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let base = self.root.join(bucket);
        let mut keys = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // A missing bucket just has no objects.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to list {}", dir.display()));
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("failed to read dir entry in {}", dir.display()))?
            {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else {
                    let key = path
                        .strip_prefix(&base)
                        .expect("listed path outside bucket root")
                        .to_string_lossy()
                        .replace(std::path::MAIN_SEPARATOR, "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn download(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let src = self.root.join(bucket).join(key);
        fs::copy(&src, path)
            .await
            .with_context(|| format!("failed to download {key} to {}", path.display()))?;
        Ok(())
    }

    async fn upload(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let dest = self.root.join(bucket).join(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(path, &dest)
            .await
            .with_context(|| format!("failed to upload {} as {key}", path.display()))?;
        Ok(())
    }

    async fn check_queue(&self, queue: &str, timeout_secs: i32) -> Result<Option<QueueMsg>> {
        let dir = self.queue_dir(queue);
        let now = Self::now_millis();
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to open queue {queue}"))?;
        // Scan in name order so delivery is deterministic for tests.
        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            candidates.push(entry.path());
        }
        candidates.sort();
        for path in candidates {
            let contents = fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read queued message {}", path.display()))?;
            let Some((visible_at, body)) = Self::parse_msg(&contents) else {
                warn!("Skipping malformed queue file {}", path.display());
                continue;
            };
            if visible_at > now {
                continue;
            }
            // Claim it: push visibility into the future.
            let hidden_until = now + (timeout_secs.max(0) as u64) * 1000;
            fs::write(&path, format!("{hidden_until}\n{body}"))
                .await
                .with_context(|| format!("failed to claim message {}", path.display()))?;
            let id = path
                .file_name()
                .expect("queue file has a name")
                .to_string_lossy()
                .into_owned();
            return Ok(Some(QueueMsg {
                handle: id.clone(),
                id,
                body,
            }));
        }
        Ok(None)
    }

    async fn add_to_queue(&self, queue: &str, body: &str) -> Result<()> {
        let id = self.next_id();
        let path = self.queue_dir(queue).join(&id);
        fs::write(&path, format!("0\n{body}"))
            .await
            .with_context(|| format!("failed to enqueue on {queue}"))?;
        Ok(())
    }

    async fn del_from_queue(&self, queue: &str, handle: &str) -> Result<()> {
        let path = self.queue_dir(queue).join(handle);
        fs::remove_file(&path)
            .await
            .with_context(|| format!("failed to delete message {handle} from {queue}"))?;
        Ok(())
    }

    async fn queue_heartbeat(
        &self,
        msg: &QueueMsg,
        queue: &str,
        timeout_secs: i32,
    ) -> Result<Option<QueueMsg>> {
        let path = self.queue_dir(queue).join(&msg.handle);
        let contents = fs::read_to_string(&path)
            .await
            .with_context(|| format!("heartbeat lost message {} on {queue}", msg.handle))?;
        let (_, body) =
            Self::parse_msg(&contents).ok_or_else(|| anyhow!("malformed queue file"))?;
        let hidden_until = Self::now_millis() + (timeout_secs.max(0) as u64) * 1000;
        fs::write(&path, format!("{hidden_until}\n{body}"))
            .await
            .with_context(|| format!("heartbeat failed to extend {}", msg.handle))?;
        // Handles here are stable, like SQS receipt handles under
        // ChangeMessageVisibility.
        Ok(None)
    }

    fn queue_id(&self, role: QueueRole) -> &str {
        match role {
            QueueRole::Preprocess => QUEUE_NAMES[0],
            QueueRole::Wipe => QUEUE_NAMES[1],
            QueueRole::OcrPage => QUEUE_NAMES[2],
            QueueRole::Analyse => QUEUE_NAMES[3],
        }
    }

    fn wip_storage_id(&self) -> &str {
        BUCKET
    }
}
