//! The analyse stage: aggregate a book's hOCR files into its final
//! artifacts.
//!
//! Unlike the other stages this one consumes its whole input before
//! producing anything: best-variant selection needs every variant's
//! confidence. It emits, in order: the `conf` report, the `best` manifest,
//! the binarised and colour PDFs (when they have at least one page), and
//! the confidence graph.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::mpsc;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    cloud::Cloud,
    graph::{self, PageConf},
    hocr,
    pdf::SearchablePdf,
    prelude::*,
    stages::drain,
};

/// One page of a PDF under assembly: the image to place and the hOCR file
/// with its text layer.
struct PageImg {
    img: String,
    hocr: PathBuf,
}

pub(super) async fn run(
    conn: Arc<dyn Cloud>,
    bookname: String,
    mut input: mpsc::Receiver<PathBuf>,
    output: mpsc::Sender<PathBuf>,
    errc: mpsc::Sender<anyhow::Error>,
) {
    // Gather per-page confidences for every variant. Errors here must drain
    // the input before reporting; the downloader is still sending.
    let mut confs: HashMap<String, Vec<PageConf>> = HashMap::new();
    let mut savedir: Option<PathBuf> = None;
    while let Some(path) = input.recv().await {
        if savedir.is_none() {
            savedir = path.parent().map(Path::to_path_buf);
        }
        debug!("Calculating confidence for {}", path.display());
        let parse_path = path.clone();
        let avg =
            match spawn_blocking_propagating_panics(move || hocr::avg_word_conf(&parse_path))
                .await
            {
                // A variant with no recognized words is skipped, not fatal:
                // some binarization thresholds wash a page out entirely.
                Ok(None) => continue,
                Ok(Some(avg)) => avg,
                Err(err) => {
                    drain(&mut input).await;
                    let _ = errc
                        .send(err.context(format!(
                            "error retrieving confidence for {}",
                            path.display()
                        )))
                        .await;
                    return;
                }
            };
        let base = path
            .file_name()
            .expect("downloaded files have names")
            .to_string_lossy()
            .into_owned();
        let Some(codestart) = base.find("_bin") else {
            warn!("Skipping non-variant hOCR {}", base);
            continue;
        };
        confs.entry(base[..codestart].to_owned()).or_default().push(PageConf {
            path: path.to_string_lossy().into_owned(),
            code: base[codestart..].to_owned(),
            conf: avg,
        });
    }

    // Input is closed now; remaining failures report without draining.
    if let Err(err) = aggregate(conn, bookname, confs, savedir, output).await {
        let _ = errc.send(err).await;
    }
}

async fn aggregate(
    conn: Arc<dyn Cloud>,
    bookname: String,
    confs: HashMap<String, Vec<PageConf>>,
    savedir: Option<PathBuf>,
    output: mpsc::Sender<PathBuf>,
) -> Result<()> {
    let savedir = savedir.ok_or_else(|| anyhow!("no hOCR files to analyse for {bookname}"))?;

    // The conf report lists every variant; bestconfs keeps the maximum per
    // page. First variant seen at the maximum wins, which is fine: ties are
    // interchangeable.
    info!("Finding best confidence for each page, and saving all confidences");
    let mut bestconfs: HashMap<String, PageConf> = HashMap::new();
    let mut report = String::new();
    for (base, variants) in &confs {
        let mut best = f64::NEG_INFINITY;
        for variant in variants {
            if variant.conf > best {
                best = variant.conf;
                bestconfs.insert(base.clone(), variant.clone());
            }
            report.push_str(&format!("{}\t{:02.0}\n", variant.path, variant.conf));
        }
    }
    let conf_path = savedir.join("conf");
    tokio::fs::write(&conf_path, &report)
        .await
        .with_context(|| format!("error creating file {}", conf_path.display()))?;
    let _ = output.send(conf_path).await;

    info!("Creating best file listing the best file for each page");
    let mut best_listing = String::new();
    for conf in bestconfs.values() {
        let name = Path::new(&conf.path)
            .file_name()
            .expect("conf paths have names")
            .to_string_lossy();
        best_listing.push_str(&name);
        best_listing.push('\n');
    }
    let best_path = savedir.join("best");
    tokio::fs::write(&best_path, &best_listing)
        .await
        .with_context(|| format!("error creating file {}", best_path.display()))?;
    let _ = output.send(best_path).await;

    let mut pgs: Vec<String> = bestconfs.values().map(|c| c.path.clone()).collect();
    pgs.sort();

    // Work out, for each selected page, the binarized image that produced
    // it and the colour original it came from.
    let mut binimgs = Vec::new();
    let mut colourimgs = Vec::new();
    for pg in &pgs {
        let base = Path::new(pg)
            .file_name()
            .expect("selected paths have names")
            .to_string_lossy()
            .into_owned();
        let nosuffix = base.trim_end_matches(".hocr").to_owned();
        let pagebase = base
            .split_once("_bin")
            .map(|(before, _)| before.to_owned())
            .unwrap_or_else(|| nosuffix.clone());
        binimgs.push(PageImg {
            img: format!("{nosuffix}.png"),
            hocr: savedir.join(&base),
        });
        colourimgs.push(PageImg {
            img: format!("{pagebase}.jpg"),
            hocr: savedir.join(&base),
        });
    }

    info!("Downloading binarised images to create PDF");
    let mut bin_pages = Vec::new();
    for pg in binimgs {
        let local = savedir.join(&pg.img);
        let key = format!("{bookname}/{}", pg.img);
        match conn.download(conn.wip_storage_id(), &key, &local).await {
            Ok(()) => bin_pages.push((local, pg.hocr)),
            Err(_) => info!("Download failed; skipping page {}", pg.img),
        }
    }
    let binarised_pdf = build_pdf(
        &bookname,
        bin_pages,
        savedir.join(format!("{bookname}.binarised.pdf")),
    )
    .await
    .context("failed to build binarised pdf")?;
    if let Some(pdf_path) = &binarised_pdf {
        // Historical redundancy: this PDF is uploaded directly as well as
        // being emitted to the uploader. The key is deterministic, so the
        // second upload overwrites the first with identical bytes.
        let key = format!("{bookname}/{bookname}.binarised.pdf");
        info!("Uploading {}", key);
        if let Err(err) = conn.upload(conn.wip_storage_id(), &key, pdf_path).await {
            warn!("Direct upload of binarised pdf failed: {:#}", err);
        }
        let _ = output.send(pdf_path.clone()).await;
    }

    info!("Downloading colour images to create PDF");
    let mut colour_pages = Vec::new();
    for pg in colourimgs {
        let mut colourfn = pg.img.clone();
        let mut local = savedir.join(&colourfn);
        let key = format!("{bookname}/{colourfn}");
        let mut downloaded = conn.download(conn.wip_storage_id(), &key, &local).await;
        if downloaded.is_err() {
            colourfn = colourfn.replacen(".jpg", ".png", 1);
            info!("Download failed; trying {}", colourfn);
            local = savedir.join(&colourfn);
            let key = format!("{bookname}/{colourfn}");
            downloaded = conn.download(conn.wip_storage_id(), &key, &local).await;
        }
        match downloaded {
            Ok(()) => colour_pages.push((local, pg.hocr)),
            Err(_) => info!("Download failed; skipping page {}", pg.img),
        }
    }
    let colour_pdf = build_pdf(
        &bookname,
        colour_pages,
        savedir.join(format!("{bookname}.colour.pdf")),
    )
    .await
    .context("failed to build colour pdf")?;
    if let Some(pdf_path) = colour_pdf {
        let _ = output.send(pdf_path).await;
    }

    info!("Creating graph");
    let graph_path = savedir.join("graph.png");
    let graph_out = graph_path.clone();
    let graph_title = bookname.clone();
    let graph_confs = bestconfs.clone();
    let rendered = spawn_blocking_propagating_panics(move || {
        graph::render(&graph_confs, &graph_title, &graph_out)
    })
    .await;
    match rendered {
        Ok(()) => {
            let _ = output.send(graph_path).await;
        }
        // Small books legitimately can't support the percentile lines.
        Err(err) if err.to_string() == "Not enough valid confidences" => {
            info!("Skipping graph: {}", err);
        }
        Err(err) => return Err(err.context("error rendering graph")),
    }

    Ok(())
}

/// Assemble a searchable PDF from downloaded (image, hOCR) pairs, deleting
/// each page image once added. Returns `None` when no page could be added.
async fn build_pdf(
    bookname: &str,
    pages: Vec<(PathBuf, PathBuf)>,
    out: PathBuf,
) -> Result<Option<PathBuf>> {
    let title = bookname.to_owned();
    spawn_blocking_propagating_panics(move || {
        let mut pdf = SearchablePdf::new(&title);
        for (img, hocr_path) in &pages {
            pdf.add_page(img, hocr_path)
                .with_context(|| format!("failed to add page {} to PDF", img.display()))?;
            std::fs::remove_file(img)
                .with_context(|| format!("failed to remove {}", img.display()))?;
        }
        if pdf.page_count() == 0 {
            return Ok(None);
        }
        pdf.save(&out)?;
        Ok(Some(out))
    })
    .await
}
