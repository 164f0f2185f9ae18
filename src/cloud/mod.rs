//! The cloud adapter: durable queues plus an object store.
//!
//! Everything the pipeline needs from a cloud provider fits in one contract:
//! receive-with-visibility-timeout queues and a prefix-listable bucket. Two
//! implementations exist — [`aws::AwsCloud`] against SQS and S3, and
//! [`local::LocalCloud`], a disk-backed stub used by the test suite and for
//! offline runs. Workers only ever see `dyn Cloud`.

use std::sync::LazyLock;

use regex::Regex;

use crate::prelude::*;

pub mod aws;
pub mod local;

/// Seconds between visibility-extension heartbeats for an in-flight message.
pub const HEARTBEAT_SECS: u64 = 60;

/// Visibility timeout applied on receive and on every heartbeat. Twice the
/// heartbeat period, so a single missed beat does not release the message.
pub const VISIBILITY_SECS: i32 = (HEARTBEAT_SECS * 2) as i32;

/// How long a queue receive may long-poll before reporting an empty queue.
pub const LONG_POLL_SECS: i32 = 20;

/// Matches the key of any binarized page variant, e.g. `_bin0.2.png`.
pub static VARIANT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_bin[0-9]\.[0-9]\.png$").expect("static regex"));

/// A message received from a work queue.
///
/// `handle` is the provider's receipt handle, needed to delete or extend the
/// message; `id` identifies the message itself. Both are opaque.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueMsg {
    pub id: String,
    pub handle: String,
    pub body: String,
}

/// Queues and storage used by the pipeline, by role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueRole {
    Preprocess,
    Wipe,
    OcrPage,
    Analyse,
}

/// The cloud adapter contract.
///
/// Implementations must provide at-least-once queue delivery with visibility
/// timeouts, and a bucket keyed by `<book>/<name>` strings. All operations
/// carry enough context in their errors to be logged and retried via
/// redelivery.
#[async_trait]
pub trait Cloud: Send + Sync {
    /// List all object keys in `bucket` starting with `prefix`.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Download `key` from `bucket` into the local file `path`.
    async fn download(&self, bucket: &str, key: &str, path: &Path) -> Result<()>;

    /// Upload the local file `path` to `bucket` under `key`.
    async fn upload(&self, bucket: &str, key: &str, path: &Path) -> Result<()>;

    /// Receive at most one message, hiding it for `timeout_secs`. Long-polls
    /// up to [`LONG_POLL_SECS`]; `None` means the queue was empty.
    async fn check_queue(&self, queue: &str, timeout_secs: i32) -> Result<Option<QueueMsg>>;

    /// Enqueue `body` on `queue`.
    async fn add_to_queue(&self, queue: &str, body: &str) -> Result<()>;

    /// Delete the message identified by `handle` from `queue`.
    async fn del_from_queue(&self, queue: &str, handle: &str) -> Result<()>;

    /// Extend the visibility timeout of an in-flight message to
    /// `timeout_secs`. If the provider rotates the receipt handle, the
    /// replacement message is returned; `None` means the original handle
    /// remains valid.
    async fn queue_heartbeat(
        &self,
        msg: &QueueMsg,
        queue: &str,
        timeout_secs: i32,
    ) -> Result<Option<QueueMsg>>;

    /// Identifier for the queue with the given role, in whatever form
    /// `check_queue` and friends expect (a URL for SQS, a name for the local
    /// stub).
    fn queue_id(&self, role: QueueRole) -> &str;

    /// Identifier of the work-in-progress storage bucket.
    fn wip_storage_id(&self) -> &str;
}

impl dyn Cloud {
    /// Convenience accessors matching the four queue roles.
    pub fn pre_queue_id(&self) -> &str {
        self.queue_id(QueueRole::Preprocess)
    }

    pub fn wipe_queue_id(&self) -> &str {
        self.queue_id(QueueRole::Wipe)
    }

    pub fn ocr_page_queue_id(&self) -> &str {
        self.queue_id(QueueRole::OcrPage)
    }

    pub fn analyse_queue_id(&self) -> &str {
        self.queue_id(QueueRole::Analyse)
    }
}
