//! Size-bounded log capture for process output.
//!
//! A [`LogCapture`] is an append-only sink over one file. After every append that
//! pushes the file past `max_bytes`, the file is cut down to its most recent
//! `keep_bytes` bytes. Operations on one capture are serialized; separate captures
//! never block each other.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use strip_ansi_escapes::strip;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Result, SupervisorError};

/// Number of bytes retained by a trim: `max(1, floor(max_bytes * keep_ratio))`.
pub fn keep_bytes(max_bytes: u64, keep_ratio: f64) -> u64 {
    ((max_bytes as f64 * keep_ratio).floor() as u64).max(1)
}

#[derive(Debug)]
struct Sink {
    file: Option<File>,
    size: u64,
}

#[derive(Debug)]
pub struct LogCapture {
    path: PathBuf,
    max_bytes: u64,
    keep_bytes: u64,
    sink: Mutex<Sink>,
}

impl LogCapture {
    /// Opens `path` for appending, creating it if needed.
    pub async fn open(path: impl Into<PathBuf>, max_bytes: u64, keep_ratio: f64) -> Result<Self> {
        let path = path.into();
        if max_bytes == 0 {
            return Err(SupervisorError::log_write(&path, "max bytes must be positive"));
        }
        if !(keep_ratio > 0.0 && keep_ratio < 1.0) {
            return Err(SupervisorError::log_write(
                &path,
                format!("keep ratio must be between 0 and 1 (exclusive), got {keep_ratio}"),
            ));
        }
        let file = open_append(&path).await?;
        let size = file
            .metadata()
            .await
            .map_err(|err| SupervisorError::log_write(&path, err))?
            .len();
        Ok(Self {
            keep_bytes: keep_bytes(max_bytes, keep_ratio),
            path,
            max_bytes,
            sink: Mutex::new(Sink {
                file: Some(file),
                size,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `bytes`, trimming afterwards if the file grew past its bound.
    pub async fn append(&self, bytes: &[u8]) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let file = sink
            .file
            .as_mut()
            .ok_or_else(|| SupervisorError::log_write(&self.path, "log is closed"))?;
        file.write_all(bytes)
            .await
            .map_err(|err| SupervisorError::log_write(&self.path, err))?;
        file.flush()
            .await
            .map_err(|err| SupervisorError::log_write(&self.path, err))?;
        sink.size += bytes.len() as u64;
        if sink.size > self.max_bytes {
            self.trim(&mut sink).await?;
        }
        Ok(())
    }

    /// Current length of the log file as tracked by this capture.
    pub async fn size(&self) -> u64 {
        self.sink.lock().await.size
    }

    /// Flushes and releases the file handle. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        if let Some(mut file) = sink.file.take() {
            file.flush()
                .await
                .map_err(|err| SupervisorError::log_write(&self.path, err))?;
            file.sync_all()
                .await
                .map_err(|err| SupervisorError::log_write(&self.path, err))?;
        }
        Ok(())
    }

    // The tail is written to a sibling file and renamed into place, so a failure at any
    // step leaves the existing log untouched.
    async fn trim(&self, sink: &mut Sink) -> Result<()> {
        let keep = self.keep_bytes.min(sink.size);
        let tail = read_tail(&self.path, keep)
            .await
            .map_err(|err| SupervisorError::log_write(&self.path, format!("trim failed: {err}")))?;

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = self.path.with_file_name(format!(".{file_name}.trim"));
        if let Err(err) = write_new(&tmp, &tail).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SupervisorError::log_write(
                &self.path,
                format!("trim failed: {err}"),
            ));
        }
        if let Err(err) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SupervisorError::log_write(
                &self.path,
                format!("trim failed: {err}"),
            ));
        }

        sink.file = Some(open_append(&self.path).await?);
        tracing::debug!(
            path = %self.path.display(),
            before = sink.size,
            after = tail.len(),
            "trimmed log"
        );
        sink.size = tail.len() as u64;
        Ok(())
    }
}

/// Copies `reader` into `log` until end of input. Returns the number of bytes captured.
pub async fn copy_into<R>(mut reader: R, log: &LogCapture) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(SupervisorError::log_write(
                    log.path(),
                    format!("failed to read output: {err}"),
                ))
            }
        };
        log.append(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Captures standard input into the log at `path` until every writer has closed it.
pub async fn capture_stdin(
    path: impl Into<PathBuf>,
    max_bytes: u64,
    keep_ratio: f64,
) -> Result<u64> {
    let log = LogCapture::open(path, max_bytes, keep_ratio).await?;
    let copied = copy_into(tokio::io::stdin(), &log).await;
    log.close().await?;
    copied
}

async fn open_append(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o600);
    options
        .open(path)
        .await
        .map_err(|err| SupervisorError::log_write(path, err))
}

async fn read_tail(path: &Path, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();
    let start = size.saturating_sub(len);
    file.seek(SeekFrom::Start(start)).await?;
    let mut tail = Vec::with_capacity((size - start) as usize);
    file.read_to_end(&mut tail).await?;
    Ok(tail)
}

async fn write_new(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

/// Returns the last `lines` lines of the log at `path`. A missing file yields nothing.
pub fn tail_lines(path: &Path, lines: usize) -> std::io::Result<Vec<String>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let text = String::from_utf8_lossy(&raw);
    let all: Vec<&str> = text.lines().collect();
    let skip = all.len().saturating_sub(lines);
    Ok(all[skip..].iter().map(|line| line.to_string()).collect())
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::error::ErrorKind;

    #[test]
    fn keep_bytes_floors_and_never_reaches_zero() {
        assert_eq!(keep_bytes(100, 0.5), 50);
        assert_eq!(keep_bytes(10, 0.33), 3);
        assert_eq!(keep_bytes(1, 0.5), 1);
        assert_eq!(keep_bytes(3, 0.1), 1);
    }

    #[tokio::test]
    async fn rejects_invalid_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        for (max, ratio) in [(0, 0.5), (100, 0.0), (100, 1.0), (100, 1.5), (100, f64::NAN)] {
            let err = LogCapture::open(&path, max, ratio).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::LogWrite, "max={max} ratio={ratio}");
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn trims_to_most_recent_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-web.log");
        let log = LogCapture::open(&path, 100, 0.5).await.unwrap();

        log.append(&[b'a'; 80]).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), 80);

        log.append(&[b'b'; 80]).await.unwrap();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, vec![b'b'; 50]);
        assert_eq!(log.size().await, 50);
    }

    #[tokio::test]
    async fn trim_keeps_exact_byte_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bytes.log");
        let log = LogCapture::open(&path, 37, 0.3).await.unwrap();

        let mut written = Vec::new();
        for i in 0u8..20 {
            let chunk: Vec<u8> = (0..i % 7 + 1).map(|j| i.wrapping_mul(31).wrapping_add(j)).collect();
            written.extend_from_slice(&chunk);
            let before = std::fs::read(&path).unwrap();
            log.append(&chunk).await.unwrap();
            let after = std::fs::read(&path).unwrap();

            let mut expected = before;
            expected.extend_from_slice(&chunk);
            if expected.len() > 37 {
                let keep = (keep_bytes(37, 0.3) as usize).min(expected.len());
                expected = expected[expected.len() - keep..].to_vec();
            }
            assert_eq!(after, expected);
            assert!(written.ends_with(&after));
        }
    }

    #[tokio::test]
    async fn reopening_existing_log_continues_size_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("existing.log");
        std::fs::write(&path, vec![b'x'; 90]).unwrap();

        let log = LogCapture::open(&path, 100, 0.5).await.unwrap();
        assert_eq!(log.size().await, 90);
        log.append(&[b'y'; 20]).await.unwrap();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 50);
        assert!(contents.ends_with(&[b'y'; 20]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_stay_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concurrent.log");
        let log = Arc::new(LogCapture::open(&path, 1 << 20, 0.5).await.unwrap());

        let mut tasks = Vec::new();
        for i in 0..16u8 {
            let log = Arc::clone(&log);
            tasks.push(tokio::spawn(async move {
                log.append(&[b'a' + i; 64]).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 16 * 64);
        for chunk in contents.chunks(64) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }

    #[tokio::test]
    async fn append_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogCapture::open(dir.path().join("closed.log"), 10, 0.5)
            .await
            .unwrap();
        log.append(b"hi").await.unwrap();
        log.close().await.unwrap();
        log.close().await.unwrap();
        let err = log.append(b"again").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LogWrite);
    }

    #[tokio::test]
    async fn failed_trim_leaves_log_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stuck.log");
        let log = LogCapture::open(&path, 100, 0.5).await.unwrap();
        log.append(&[b'a'; 80]).await.unwrap();

        // the trim sibling cannot be created while a directory occupies its name
        let blocker = dir.path().join(".stuck.log.trim");
        std::fs::create_dir(&blocker).unwrap();
        let err = log.append(&[b'b'; 40]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LogWrite);

        let mut expected = vec![b'a'; 80];
        expected.extend_from_slice(&[b'b'; 40]);
        assert_eq!(std::fs::read(&path).unwrap(), expected);

        std::fs::remove_dir(&blocker).unwrap();
        log.append(b"c").await.unwrap();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 50);
        assert!(contents.ends_with(b"bc"));
        assert_eq!(log.size().await, 50);
    }

    #[tokio::test]
    async fn copy_into_captures_until_end_of_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copied.log");
        let log = LogCapture::open(&path, 64, 0.5).await.unwrap();

        let input: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        let copied = copy_into(&input[..], &log).await.unwrap();
        assert_eq!(copied, 200);

        let contents = std::fs::read(&path).unwrap();
        assert!(contents.len() as u64 <= 64);
        assert!(input.ends_with(&contents));
    }

    #[test]
    fn tail_lines_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.log");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();
        assert_eq!(tail_lines(&path, 2).unwrap(), vec!["two", "three"]);
        assert_eq!(tail_lines(&path, 10).unwrap().len(), 3);
        assert!(tail_lines(&dir.path().join("missing.log"), 5).unwrap().is_empty());
    }

    #[test]
    fn sanitize_strips_ansi_when_requested() {
        assert_eq!(sanitize_text("\u{1b}[31mred\u{1b}[0m", true), "red");
        assert_eq!(sanitize_text("plain", false), "plain");
    }
}
