use std::{str::FromStr, sync::Arc, time::Duration};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, filter::Directive, fmt::format::FmtSpan};

use bindery::{
    book,
    cloud::{Cloud, QueueRole, aws::AwsCloud, local::LocalCloud},
    engine::JobOptions,
    log_buffer::LogBuffer,
    prelude::*,
    ui::Ui,
    worker::{self, WorkerOptions},
};

/// Distributed OCR pipeline for digitized books.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - AWS credentials and region are taken from the standard AWS conventions.
  - TESSDATA_PREFIX is set by the worker from --training; don't set it yourself.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    /// Which cloud adapter to use.
    #[clap(long, value_enum, default_value = "aws")]
    cloud: CloudKind,

    /// Root directory for the local adapter.
    #[clap(long, default_value = "bindery-local")]
    local_root: PathBuf,

    /// Deployment prefix for AWS queue and bucket names.
    #[clap(long, default_value = "bindery")]
    prefix: String,

    #[clap(subcommand)]
    subcmd: Cmd,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CloudKind {
    Aws,
    Local,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Consume the pipeline queues until they stay quiet.
    Worker {
        /// Path to the tesseract .traineddata file to use by default.
        #[clap(short = 't', long, default_value = "training/eng.traineddata")]
        training: PathBuf,

        /// Binarization thresholds for the preprocess stage.
        #[clap(long, value_delimiter = ',', default_value = "0.1,0.2,0.3")]
        thresholds: Vec<f64>,

        /// Exit after all queues have been empty for this many seconds.
        #[clap(long, default_value = "1800")]
        quiet_after: u64,
    },
    /// Upload a book's page images and enqueue it for processing.
    Upload {
        /// Directory of page images.
        bookdir: PathBuf,

        /// Name for the book. Defaults to the directory name.
        bookname: Option<String>,

        /// OCR training identifier to request for this book.
        #[clap(short = 't', long)]
        training: Option<String>,

        /// Upload only; don't enqueue the book.
        #[clap(long)]
        no_queue: bool,
    },
    /// Print the resolved queue and bucket identifiers.
    Queues,
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing, teeing output through the log ring buffer that
    // poison-mail notifications attach.
    let log_buffer = LogBuffer::new();
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();
    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(log_buffer.clone())
        .init();

    // Call our real `main` function now that logging is set up.
    real_main(log_buffer).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(log_buffer: LogBuffer) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    let conn: Arc<dyn Cloud> = match opts.cloud {
        CloudKind::Aws => Arc::new(AwsCloud::new(&opts.prefix).await?),
        CloudKind::Local => Arc::new(LocalCloud::new(&opts.local_root).await?),
    };

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Worker {
            training,
            thresholds,
            quiet_after,
        } => {
            let training = prepare_ocr_environment(training)?;
            let worker_opts = WorkerOptions {
                training,
                thresholds: thresholds.clone(),
                quiet_after: Duration::from_secs(*quiet_after),
                job: JobOptions {
                    log_buffer: Some(log_buffer),
                    ..JobOptions::default()
                },
                ..WorkerOptions::default()
            };
            worker::run(conn, worker_opts).await?;
        }
        Cmd::Upload {
            bookdir,
            bookname,
            training,
            no_queue,
        } => {
            cmd_upload(
                &conn,
                bookdir,
                bookname.as_deref(),
                training.as_deref(),
                *no_queue,
            )
            .await?;
        }
        Cmd::Queues => {
            for role in [
                QueueRole::Preprocess,
                QueueRole::Wipe,
                QueueRole::OcrPage,
                QueueRole::Analyse,
            ] {
                println!("{:?}: {}", role, conn.queue_id(role));
            }
            println!("Storage: {}", conn.wip_storage_id());
        }
    }
    Ok(())
}

/// The `upload` subcommand: validate, sequence-upload, and enqueue a book.
#[instrument(level = "debug", skip_all, fields(bookdir = %bookdir.display()))]
async fn cmd_upload(
    conn: &Arc<dyn Cloud>,
    bookdir: &Path,
    bookname: Option<&str>,
    training: Option<&str>,
    no_queue: bool,
) -> Result<()> {
    let bookname = match bookname {
        Some(name) => name.to_owned(),
        None => bookdir
            .file_name()
            .ok_or_else(|| anyhow!("cannot derive a book name from {}", bookdir.display()))?
            .to_string_lossy()
            .into_owned(),
    };

    book::check_images(bookdir)
        .await
        .with_context(|| format!("error with images in {}", bookdir.display()))?;

    let ui = Ui::init();
    let pages = book::upload_images(bookdir, &bookname, conn, &ui).await?;
    info!("Uploaded {} pages as {}", pages, bookname);

    if no_queue {
        return Ok(());
    }
    let queue = book::detect_queue_type(bookdir, conn).await?;
    let body = match training {
        Some(training) => format!("{bookname} {training}"),
        None => bookname.clone(),
    };
    conn.add_to_queue(&queue, &body)
        .await
        .with_context(|| format!("error adding book job to queue {queue}"))?;
    info!("Queued {} on {}", bookname, queue);
    Ok(())
}

/// Validate the OCR setup and publish `TESSDATA_PREFIX`. Returns the
/// training identifier to pass on message bodies. These checks are fatal:
/// a worker that cannot OCR would spin uselessly on the queues.
fn prepare_ocr_environment(training: &Path) -> Result<String> {
    let training = training
        .canonicalize()
        .with_context(|| format!("training file {} could not be opened", training.display()))?;
    let prefix = training
        .parent()
        .ok_or_else(|| anyhow!("training file {} has no parent", training.display()))?;
    let name = training
        .file_stem()
        .ok_or_else(|| anyhow!("training file {} has no name", training.display()))?
        .to_string_lossy()
        .into_owned();

    // The tesseract binary reads this at exec time; set it once at startup
    // and nowhere else.
    unsafe { std::env::set_var("TESSDATA_PREFIX", prefix) };

    let probe = std::process::Command::new("tesseract")
        .arg("--version")
        .output()
        .context("can't run tesseract; ensure it is installed and available")?;
    if !probe.status.success() {
        return Err(anyhow!("tesseract --version failed"));
    }
    Ok(name)
}
