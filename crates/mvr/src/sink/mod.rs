//! Sink routing, buffering and compression.
//!
//! Layering from innermost out: encoder -> gzip wrapper -> byte-counter
//! tee -> buffered writer -> sink. Parquet never sees an outer gzip (the
//! format compresses its own column chunks). Teardown is strict-ordered
//! and joins every stage's error instead of dropping it.

pub mod azure;

use std::fs;
use std::io::{BufWriter, Stdout, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::write::GzEncoder;
use tracing::debug;
use url::Url;

use crate::error::{MvrError, Result};

use self::azure::AzureBlobWriter;

/// Shared byte counter fed by the tee stage.
#[derive(Debug, Default)]
pub struct ByteCounter(AtomicU64);

impl ByteCounter {
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// The underlying byte destination.
enum RawSink {
    File(fs::File),
    Stdout(Stdout),
    Azure(AzureBlobWriter),
}

impl Write for RawSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            RawSink::File(f) => f.write(buf),
            RawSink::Stdout(s) => s.write(buf),
            RawSink::Azure(a) => a.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            RawSink::File(f) => f.flush(),
            RawSink::Stdout(s) => s.flush(),
            RawSink::Azure(a) => a.flush(),
        }
    }
}

impl RawSink {
    fn close(&mut self) -> Result<()> {
        match self {
            RawSink::File(f) => f.sync_all().map_err(|e| MvrError::Sink(e.to_string())),
            RawSink::Stdout(s) => s.flush().map_err(|e| MvrError::Sink(e.to_string())),
            RawSink::Azure(a) => a.close(),
        }
    }
}

/// Counts bytes as they pass into the buffered stage.
struct TeeCounter {
    inner: BufWriter<RawSink>,
    counter: Arc<ByteCounter>,
}

impl Write for TeeCounter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.counter.add(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

enum Stage {
    Plain(TeeCounter),
    Gzip(GzEncoder<TeeCounter>),
}

/// The assembled writer chain handed to an encoder.
///
/// Owns everything below the encoder; [`SinkStack::close`] tears the
/// chain down in order (gzip finish, buffer flush, sink close) and joins
/// the stage errors.
pub struct SinkStack {
    stage: Option<Stage>,
    counter: Arc<ByteCounter>,
}

impl SinkStack {
    pub fn bytes_written(&self) -> u64 {
        self.counter.total()
    }

    pub fn counter(&self) -> Arc<ByteCounter> {
        self.counter.clone()
    }

    pub fn close(&mut self) -> Result<()> {
        let Some(stage) = self.stage.take() else {
            return Ok(());
        };

        let mut errors: Vec<String> = Vec::new();

        let mut tee = match stage {
            Stage::Plain(tee) => tee,
            Stage::Gzip(mut gz) => {
                if let Err(e) = gz.flush() {
                    errors.push(format!("gzip flush: {}", e));
                }
                match gz.finish() {
                    Ok(tee) => tee,
                    Err(e) => {
                        return Err(MvrError::Teardown(format!("gzip close: {}", e)));
                    }
                }
            }
        };

        if let Err(e) = tee.inner.flush() {
            errors.push(format!("buffer flush: {}", e));
        }
        match tee.inner.into_inner() {
            Ok(mut raw) => {
                if let Err(e) = raw.close() {
                    errors.push(format!("sink close: {}", e));
                }
            }
            Err(e) => errors.push(format!("buffer unwrap: {}", e)),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MvrError::Teardown(errors.join("; ")))
        }
    }
}

impl Write for SinkStack {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.stage.as_mut() {
            Some(Stage::Plain(w)) => w.write(buf),
            Some(Stage::Gzip(w)) => w.write(buf),
            None => Err(std::io::Error::other("sink already closed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.stage.as_mut() {
            Some(Stage::Plain(w)) => w.flush(),
            Some(Stage::Gzip(w)) => w.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for SinkStack {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Whether this destination is standard output.
pub fn is_stdout(url: &Url) -> bool {
    url.scheme() == "stdout"
}

/// Join the rendered filename onto the destination URL.
///
/// Stdout destinations pass through unchanged; everything else requires a
/// non-blank filename appended to the URL path.
pub fn build_full_path(dest: &Url, filename: &str) -> Result<Url> {
    if is_stdout(dest) {
        return Ok(dest.clone());
    }
    if filename.trim().is_empty() {
        return Err(MvrError::Config(
            "filename must be set for non-stdout destinations".to_string(),
        ));
    }
    let mut joined = dest.clone();
    let base = dest.path().trim_end_matches('/');
    joined.set_path(&format!("{}/{}", base, filename.trim_start_matches('/')));
    Ok(joined)
}

async fn open_raw(path: &Url) -> Result<RawSink> {
    match path.scheme() {
        "stdout" => Ok(RawSink::Stdout(std::io::stdout())),
        "azurite" => {
            let target = azure::parse_azurite_url(path)?;
            Ok(RawSink::Azure(AzureBlobWriter::open(target).await?))
        }
        "azure" | "https" => {
            let target = azure::parse_azure_blob_url(path)?;
            Ok(RawSink::Azure(AzureBlobWriter::open(target).await?))
        }
        "file" | "" => open_file(Path::new(path.path())),
        other => Err(MvrError::Sink(format!(
            "unsupported destination scheme: {}",
            other
        ))),
    }
}

/// Parse a destination string; schemeless strings become file URLs.
pub fn parse_dest_url(raw: &str) -> Result<Url> {
    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let path = Path::new(raw);
            let absolute = if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()
                    .map_err(|e| MvrError::Config(e.to_string()))?
                    .join(path)
            };
            Url::from_file_path(&absolute)
                .map_err(|_| MvrError::Config(format!("invalid destination path: {}", raw)))
        }
        Err(e) => Err(MvrError::Config(format!(
            "invalid destination url {}: {}",
            raw, e
        ))),
    }
}

fn open_file(path: &Path) -> Result<RawSink> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .map_err(|e| MvrError::Sink(format!("creating directory {:?}: {}", dir, e)))?;
        }
    }

    if path.exists() {
        fs::remove_file(path)
            .map_err(|e| MvrError::Sink(format!("removing existing file {:?}: {}", path, e)))?;
    }

    let file = open_append_0644(path)?;
    Ok(RawSink::File(file))
}

#[cfg(unix)]
fn open_append_0644(path: &Path) -> Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .open(path)
        .map_err(|e| MvrError::Sink(format!("failed to open file {:?}: {}", path, e)))
}

#[cfg(not(unix))]
fn open_append_0644(path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| MvrError::Sink(format!("failed to open file {:?}: {}", path, e)))
}

/// Open the full writer chain for a destination.
///
/// Gzip is inserted when requested and the format is not parquet.
pub async fn open_sink(path: &Url, compression: &str, format: &str) -> Result<SinkStack> {
    let raw = open_raw(path).await?;
    let counter = Arc::new(ByteCounter::default());
    let tee = TeeCounter {
        inner: BufWriter::new(raw),
        counter: counter.clone(),
    };

    let gzip = compression.eq_ignore_ascii_case("gzip") && !format.eq_ignore_ascii_case("parquet");
    let stage = if gzip {
        debug!("wrapping sink in gzip");
        Stage::Gzip(GzEncoder::new(tee, flate2::Compression::default()))
    } else {
        Stage::Plain(tee)
    };

    Ok(SinkStack {
        stage: Some(stage),
        counter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_sink_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, b"stale").unwrap();

        let url = Url::from_file_path(&path).unwrap();
        let mut sink = open_sink(&url, "", "csv").await.unwrap();
        sink.write_all(b"fresh").unwrap();
        sink.close().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_byte_counter_counts_compressed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv.gz");
        let url = Url::from_file_path(&path).unwrap();

        let mut sink = open_sink(&url, "gzip", "csv").await.unwrap();
        let counter = sink.counter();
        sink.write_all(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        sink.close().unwrap();

        let on_disk = fs::metadata(&path).unwrap().len();
        assert_eq!(counter.total(), on_disk);
        // gzip header magic
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
    }

    #[tokio::test]
    async fn test_parquet_never_gzips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.parquet");
        let url = Url::from_file_path(&path).unwrap();

        let mut sink = open_sink(&url, "gzip", "parquet").await.unwrap();
        sink.write_all(b"PAR1").unwrap();
        sink.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"PAR1");
    }

    #[test]
    fn test_build_full_path() {
        let dest = Url::parse("file:///data/exports").unwrap();
        let joined = build_full_path(&dest, "2025/users.csv").unwrap();
        assert_eq!(joined.path(), "/data/exports/2025/users.csv");

        let stdout = Url::parse("stdout://").unwrap();
        assert_eq!(build_full_path(&stdout, "").unwrap().scheme(), "stdout");

        assert!(build_full_path(&dest, "  ").is_err());
    }

    #[test]
    fn test_parse_dest_url_schemeless_becomes_file() {
        let url = parse_dest_url("/data/exports").unwrap();
        assert_eq!(url.scheme(), "file");
        assert_eq!(url.path(), "/data/exports");

        let url = parse_dest_url("stdout://").unwrap();
        assert_eq!(url.scheme(), "stdout");
    }

    #[tokio::test]
    async fn test_double_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("x")).unwrap();
        let mut sink = open_sink(&url, "", "csv").await.unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
    }
}
