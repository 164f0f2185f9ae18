//! Transform stages: the middle worker of the streaming job engine.
//!
//! A [`Transform`] consumes local paths from the downloader and emits
//! produced local paths for the uploader. Each stage owns the closing of
//! its output channel (dropping the sender closes it), and on error it
//! drains its input to EOF before reporting, so the upstream downloader is
//! never left blocked on a send. See [`crate::engine`] for the wiring.

use std::sync::Arc;

use tokio::{process::Command, sync::mpsc};

use crate::{
    async_utils::{BoxedFuture, check_for_command_failure, spawn_blocking_propagating_panics},
    cloud::Cloud,
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

pub mod analyse;
pub mod binarise;

/// A transform stage, called exactly once per job with the job's channels:
/// input paths, output paths, and the shared error channel.
pub type Transform = Box<
    dyn FnOnce(
            mpsc::Receiver<PathBuf>,
            mpsc::Sender<PathBuf>,
            mpsc::Sender<anyhow::Error>,
        ) -> BoxedFuture<()>
        + Send,
>;

/// Consume a channel to EOF so upstream senders never block after an error.
pub(crate) async fn drain(input: &mut mpsc::Receiver<PathBuf>) {
    while input.recv().await.is_some() {}
}

/// The preprocess stage: binarize each page at every configured threshold,
/// emitting one `_binT.T.png` per threshold. The downloaded source file is
/// removed once its variants exist.
pub fn preprocess(thresholds: Vec<f64>) -> Transform {
    Box::new(move |mut input, output, errc| {
        Box::pin(async move {
            while let Some(path) = input.recv().await {
                info!("Preprocessing {}", path.display());
                let job_path = path.clone();
                let job_thresholds = thresholds.clone();
                let result = spawn_blocking_propagating_panics(move || {
                    binarise::binarize_file(&job_path, &job_thresholds)
                })
                .await;
                let produced = match result {
                    Ok(produced) => produced,
                    Err(err) => {
                        drain(&mut input).await;
                        let _ = errc.send(err).await;
                        return;
                    }
                };
                let _ = tokio::fs::remove_file(&path).await;
                for out in produced {
                    if output.send(out).await.is_err() {
                        return;
                    }
                }
            }
        })
    })
}

/// The wipe stage: clear margin noise and binarize, emitting one
/// `_bin0.0.png` per page.
pub fn wipe() -> Transform {
    Box::new(|mut input, output, errc| {
        Box::pin(async move {
            while let Some(path) = input.recv().await {
                info!("Wiping {}", path.display());
                let job_path = path.clone();
                let result =
                    spawn_blocking_propagating_panics(move || binarise::wipe_file(&job_path))
                        .await;
                match result {
                    Ok(out) => {
                        if output.send(out).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        drain(&mut input).await;
                        let _ = errc.send(err).await;
                        return;
                    }
                }
            }
        })
    })
}

/// The OCR stage: run tesseract with the given training model on each
/// binarized PNG, emitting the `.hocr` it writes alongside.
pub fn ocr(training: String) -> Transform {
    Box::new(move |mut input, output, errc| {
        Box::pin(async move {
            while let Some(path) = input.recv().await {
                info!("OCRing {}", path.display());
                let out_base = path.with_extension("");
                let run = with_cpu_semaphore(|| async {
                    Command::new("tesseract")
                        .arg("-l")
                        .arg(&training)
                        .arg(&path)
                        .arg(&out_base)
                        .arg("-c")
                        .arg("tessedit_create_hocr=1")
                        .arg("-c")
                        .arg("hocr_font_info=0")
                        .output()
                        .await
                        .context("cannot run tesseract")
                })
                .await
                .and_then(|out| check_for_command_failure("tesseract", &out))
                .with_context(|| {
                    format!(
                        "error ocring {} with training {training}",
                        path.display()
                    )
                });
                if let Err(err) = run {
                    drain(&mut input).await;
                    let _ = errc.send(err).await;
                    return;
                }
                if output.send(path.with_extension("hocr")).await.is_err() {
                    return;
                }
            }
        })
    })
}

/// The analyse stage; see [`analyse`].
pub fn analyse_stage(conn: Arc<dyn Cloud>, bookname: String) -> Transform {
    Box::new(move |input, output, errc| {
        Box::pin(async move {
            analyse::run(conn, bookname, input, output, errc).await;
        })
    })
}
