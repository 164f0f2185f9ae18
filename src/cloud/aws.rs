//! The AWS implementation of the [`Cloud`] contract: SQS queues and an S3
//! bucket.
//!
//! Queue URLs are resolved once at startup from conventional names
//! (`<prefix>-preprocess` and so on), so a missing queue fails fast rather
//! than mid-job.

use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;

use crate::{
    cloud::{Cloud, LONG_POLL_SECS, QueueMsg, QueueRole},
    prelude::*,
};

/// An AWS session: S3 + SQS clients plus resolved queue URLs.
pub struct AwsCloud {
    s3: aws_sdk_s3::Client,
    sqs: aws_sdk_sqs::Client,
    pre_queue_url: String,
    wipe_queue_url: String,
    ocr_page_queue_url: String,
    analyse_queue_url: String,
    wip_bucket: String,
}

impl AwsCloud {
    /// Load the user's AWS configuration using standard conventions and
    /// resolve the pipeline's queue URLs. `prefix` names the deployment,
    /// e.g. `bindery` resolves queues `bindery-preprocess` … and bucket
    /// `bindery-inprogress`.
    pub async fn new(prefix: &str) -> Result<Self> {
        let config = aws_config::load_defaults(BehaviorVersion::v2025_01_17()).await;
        let s3 = aws_sdk_s3::Client::new(&config);
        let sqs = aws_sdk_sqs::Client::new(&config);

        Ok(Self {
            pre_queue_url: resolve_queue_url(&sqs, prefix, "preprocess").await?,
            wipe_queue_url: resolve_queue_url(&sqs, prefix, "wipe").await?,
            ocr_page_queue_url: resolve_queue_url(&sqs, prefix, "ocrpage").await?,
            analyse_queue_url: resolve_queue_url(&sqs, prefix, "analyse").await?,
            wip_bucket: format!("{prefix}-inprogress"),
            s3,
            sqs,
        })
    }
}

async fn resolve_queue_url(
    sqs: &aws_sdk_sqs::Client,
    prefix: &str,
    suffix: &str,
) -> Result<String> {
    let name = format!("{prefix}-{suffix}");
    let out = sqs
        .get_queue_url()
        .queue_name(&name)
        .send()
        .await
        .with_context(|| format!("failed to get URL for queue {name}"))?;
    out.queue_url()
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("no URL returned for queue {name}"))
}

#[async_trait]
impl Cloud for AwsCloud {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .s3
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page =
                page.with_context(|| format!("failed to list s3://{bucket}/{prefix}"))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_owned());
                }
            }
        }
        Ok(keys)
    }

    async fn download(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let out = self
            .s3
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to get s3://{bucket}/{key}"))?;
        let bytes = out
            .body
            .collect()
            .await
            .with_context(|| format!("failed to read body of s3://{bucket}/{key}"))?
            .into_bytes();
        tokio::fs::write(path, &bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    async fn upload(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        self.s3
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("failed to put s3://{bucket}/{key}"))?;
        Ok(())
    }

    async fn check_queue(&self, queue: &str, timeout_secs: i32) -> Result<Option<QueueMsg>> {
        let out = self
            .sqs
            .receive_message()
            .queue_url(queue)
            .max_number_of_messages(1)
            .visibility_timeout(timeout_secs)
            .wait_time_seconds(LONG_POLL_SECS)
            .send()
            .await
            .with_context(|| format!("failed to receive from {queue}"))?;
        let Some(msg) = out.messages().first() else {
            return Ok(None);
        };
        match (msg.message_id(), msg.receipt_handle(), msg.body()) {
            (Some(id), Some(handle), Some(body)) => {
                debug!("Message received: {}", body);
                Ok(Some(QueueMsg {
                    id: id.to_owned(),
                    handle: handle.to_owned(),
                    body: body.to_owned(),
                }))
            }
            _ => Err(anyhow!("received incomplete message from {queue}")),
        }
    }

    async fn add_to_queue(&self, queue: &str, body: &str) -> Result<()> {
        self.sqs
            .send_message()
            .queue_url(queue)
            .message_body(body)
            .send()
            .await
            .with_context(|| format!("failed to send message to {queue}"))?;
        Ok(())
    }

    async fn del_from_queue(&self, queue: &str, handle: &str) -> Result<()> {
        self.sqs
            .delete_message()
            .queue_url(queue)
            .receipt_handle(handle)
            .send()
            .await
            .with_context(|| format!("failed to delete message from {queue}"))?;
        Ok(())
    }

    async fn queue_heartbeat(
        &self,
        msg: &QueueMsg,
        queue: &str,
        timeout_secs: i32,
    ) -> Result<Option<QueueMsg>> {
        self.sqs
            .change_message_visibility()
            .queue_url(queue)
            .receipt_handle(&msg.handle)
            .visibility_timeout(timeout_secs)
            .send()
            .await
            .with_context(|| format!("heartbeat failed for message {} on {queue}", msg.id))?;
        // SQS keeps the receipt handle stable across visibility changes.
        Ok(None)
    }

    fn queue_id(&self, role: QueueRole) -> &str {
        match role {
            QueueRole::Preprocess => &self.pre_queue_url,
            QueueRole::Wipe => &self.wipe_queue_url,
            QueueRole::OcrPage => &self.ocr_page_queue_url,
            QueueRole::Analyse => &self.analyse_queue_url,
        }
    }

    fn wip_storage_id(&self) -> &str {
        &self.wip_bucket
    }
}
