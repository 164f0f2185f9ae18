//! Book ingestion: validating, sequencing, and uploading page images.
//!
//! Page files are renamed at upload to `<base>_NNNN.<ext>` so every later
//! stage can rely on a zero-padded sequence number — the PDF page order and
//! the confidence graph both come from it.

use std::sync::Arc;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    cloud::Cloud,
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// Check that all files in a directory are images that can be decoded.
/// Dotfiles are skipped so `.DS_Store` and friends don't break an upload.
pub async fn check_images(dir: &Path) -> Result<()> {
    for path in image_files(dir).await? {
        let decode_path = path.clone();
        spawn_blocking_propagating_panics(move || {
            image::open(&decode_path)
                .map(|_| ())
                .with_context(|| format!("decoding image {} failed", decode_path.display()))
        })
        .await?;
    }
    Ok(())
}

/// Upload all page images from `dir` into the work-in-progress bucket under
/// `<bookname>/`, renaming each to `<base>_NNNN.<ext>` in directory order.
/// Returns the number of pages uploaded.
pub async fn upload_images(
    dir: &Path,
    bookname: &str,
    conn: &Arc<dyn Cloud>,
    ui: &Ui,
) -> Result<usize> {
    let files = image_files(dir).await?;
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📚",
            msg: "Uploading pages",
            done_msg: "Uploaded pages",
        },
        files.len() as u64,
    );

    for (filenum, path) in files.iter().enumerate() {
        let name = path
            .file_name()
            .expect("listed files have names")
            .to_string_lossy();
        let (base, suffix) = match name.rsplit_once('.') {
            Some((base, suffix)) => (base, format!(".{suffix}")),
            None => (name.as_ref(), String::new()),
        };
        let newname = format!("{base}_{filenum:04}{suffix}");
        conn.upload(
            conn.wip_storage_id(),
            &format!("{bookname}/{newname}"),
            path,
        )
        .await
        .with_context(|| format!("failed to upload {}", path.display()))?;
        pb.inc(1);
    }
    pb.finish();
    Ok(files.len())
}

/// Detect which queue a book belongs on from the preponderance of file
/// extensions: mostly-PNG books are assumed to be pre-binarized scans that
/// only need their margins wiped, everything else gets full preprocessing.
pub async fn detect_queue_type(dir: &Path, conn: &Arc<dyn Cloud>) -> Result<String> {
    let mut png_count = 0usize;
    let mut jpg_count = 0usize;
    for path in image_files(dir).await? {
        match path.extension().and_then(|e| e.to_str()) {
            Some("png") => png_count += 1,
            Some("jpg") | Some("jpeg") => jpg_count += 1,
            _ => {}
        }
    }
    let queue = if png_count > jpg_count {
        conn.wipe_queue_id()
    } else {
        conn.pre_queue_id()
    };
    Ok(queue.to_owned())
}

/// Non-dotfile regular files in `dir`, sorted by name.
async fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read directory {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed to read entry in {}", dir.display()))?
    {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            continue;
        }
        if path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('.'))
        {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}
