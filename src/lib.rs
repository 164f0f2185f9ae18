//! A distributed OCR pipeline for digitized books.
//!
//! A book is a prefix of page images in an object store. Work flows through
//! four durable queues — preprocess, wipe, ocr-page, analyse — and each
//! worker runs a channel-connected download → transform → upload pipeline
//! per message, with a heartbeat keeping the message invisible to other
//! workers. Binarization produces several variants per page, each is OCRed
//! separately, and the analyse stage keeps the most confident variant per
//! page when compiling the searchable PDFs and the confidence report.

pub mod async_utils;
pub mod book;
pub mod cloud;
pub mod cpu_limit;
pub mod engine;
pub mod graph;
pub mod hocr;
pub mod log_buffer;
pub mod mail;
pub mod pdf;
pub mod prelude;
pub mod stages;
pub mod ui;
pub mod worker;
