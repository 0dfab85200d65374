//! Write-Ahead Log
//!
//! Append-only text log of key-space mutations with:
//! - Sequential LSN assignment (the 1-based line number of each entry)
//! - One `write_all` + fsync per append
//! - Torn tail repair on open and after a failed append
//! - A checkpoint side file counting the entries folded into the store
//!
//! Record format, one per line:
//! ```text
//! 1,SET,color,blue
//! 2,DELETE,color
//! ```

use parking_lot::RwLock;
use replkv_common::{Error, LogEntry, Operation, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Read buffer used when scanning the log on open
const SCAN_BUFFER_SIZE: usize = 64 * 1024;

/// WAL configuration
#[derive(Clone, Debug)]
pub struct WalConfig {
    /// Sync after every write
    pub sync_on_write: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
        }
    }
}

/// Result of a successful append
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Appended {
    pub lsn: u64,
    /// The serialized entry without its line terminator, as replicated to peers
    pub line: String,
}

struct LogFile {
    file: File,
    /// Length of the durable, newline-terminated prefix
    len: u64,
}

/// Write-Ahead Log
pub struct Wal {
    path: PathBuf,
    checkpoint_path: PathBuf,
    inner: RwLock<LogFile>,
    /// Next LSN to assign
    next_lsn: AtomicU64,
    /// Entries already folded into the persistent store
    checkpoint: AtomicU64,
    /// Set when a failed append could not be cut back
    poisoned: AtomicBool,
    config: WalConfig,
}

impl Wal {
    /// Open the log, creating it if missing
    ///
    /// Any bytes after the last line terminator are an unacknowledged append
    /// and are cut off before the log accepts new writes.
    pub fn open(
        path: impl AsRef<Path>,
        checkpoint_path: impl AsRef<Path>,
        config: WalConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let checkpoint_path = checkpoint_path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to open WAL: {e}")))?;

        let (count, valid_len, file_len) = Self::scan_log(&mut file)?;
        if file_len > valid_len {
            warn!(
                "Discarding {} byte torn tail from {}",
                file_len - valid_len,
                path.display()
            );
            file.set_len(valid_len)
                .and_then(|()| file.sync_all())
                .map_err(|e| Error::Storage(format!("failed to repair WAL tail: {e}")))?;
        }

        let checkpoint = Self::load_checkpoint(&checkpoint_path, count)?;

        info!(
            "Opened WAL {} with {} entries, checkpoint {}",
            path.display(),
            count,
            checkpoint
        );

        Ok(Self {
            path,
            checkpoint_path,
            inner: RwLock::new(LogFile {
                file,
                len: valid_len,
            }),
            next_lsn: AtomicU64::new(count + 1),
            checkpoint: AtomicU64::new(checkpoint),
            poisoned: AtomicBool::new(false),
            config,
        })
    }

    /// Count complete lines and find the end of the last one
    fn scan_log(file: &mut File) -> Result<(u64, u64, u64)> {
        let mut buf = vec![0u8; SCAN_BUFFER_SIZE];
        let mut count = 0u64;
        let mut pos = 0u64;
        let mut valid_len = 0u64;

        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| Error::Storage(format!("failed to read WAL: {e}")))?;
            if n == 0 {
                break;
            }

            let chunk = &buf[..n];
            count += chunk.iter().filter(|&&b| b == b'\n').count() as u64;
            if let Some(last) = chunk.iter().rposition(|&b| b == b'\n') {
                valid_len = pos + last as u64 + 1;
            }
            pos += n as u64;
        }

        Ok((count, valid_len, pos))
    }

    fn load_checkpoint(path: &Path, entries: u64) -> Result<u64> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(Error::Storage(format!("failed to read checkpoint: {e}")));
            }
        };

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(0);
        }

        let checkpoint = trimmed
            .parse::<u64>()
            .map_err(|_| Error::corruption(format!("unparsable checkpoint {trimmed:?}")))?;
        if checkpoint > entries {
            return Err(Error::corruption(format!(
                "checkpoint {checkpoint} is past the end of the log ({entries} entries)"
            )));
        }
        Ok(checkpoint)
    }

    /// Append an operation, returning its LSN once it is durable
    pub fn append(&self, op: &Operation) -> Result<Appended> {
        let mut inner = self.inner.write();

        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::Storage(
                "WAL is unusable after an unrepaired write failure".into(),
            ));
        }

        let lsn = self.next_lsn.load(Ordering::SeqCst);
        let line = LogEntry::new(lsn, op.clone()).to_string();
        let mut record = Vec::with_capacity(line.len() + 1);
        record.extend_from_slice(line.as_bytes());
        record.push(b'\n');

        if let Err(e) = write_record(&mut inner.file, &record, self.config.sync_on_write) {
            let durable_len = inner.len;
            if let Err(repair) = inner.file.set_len(durable_len) {
                self.poisoned.store(true, Ordering::Release);
                error!("Failed to cut back WAL after write error: {repair}");
            }
            return Err(Error::Storage(format!("failed to append LSN {lsn}: {e}")));
        }

        inner.len += record.len() as u64;
        self.next_lsn.store(lsn + 1, Ordering::SeqCst);
        debug!("Appended WAL entry {}", lsn);

        Ok(Appended { lsn, line })
    }

    /// Read every entry at 1-based `position` or later
    pub fn scan_from(&self, position: u64) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let position = position.max(1);

        let file = File::open(&self.path)
            .map_err(|e| Error::Storage(format!("failed to open WAL for scan: {e}")))?;
        let mut reader = BufReader::with_capacity(SCAN_BUFFER_SIZE, file.take(inner.len));

        let mut lines = Vec::new();
        let mut line_no = 0u64;
        loop {
            let mut buf = Vec::new();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| Error::Storage(format!("failed to read WAL: {e}")))?;
            if read == 0 {
                break;
            }
            line_no += 1;
            if line_no < position {
                continue;
            }
            lines.push(decode_line(line_no, buf));
        }
        Ok(lines)
    }

    /// Last assigned LSN, equal to the number of entries
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn.load(Ordering::SeqCst) - 1
    }

    pub fn next_lsn(&self) -> u64 {
        self.next_lsn.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoint.load(Ordering::SeqCst)
    }

    /// Advance the checkpoint durably
    ///
    /// The checkpoint never moves backwards and never passes the last LSN.
    pub fn set_checkpoint(&self, checkpoint: u64) -> Result<()> {
        let current = self.checkpoint();
        if checkpoint < current {
            return Err(Error::Storage(format!(
                "checkpoint cannot move backwards ({current} -> {checkpoint})"
            )));
        }
        self.write_checkpoint(checkpoint)
    }

    /// Replace the checkpoint with the store's applied marker during recovery
    pub(crate) fn restore_checkpoint(&self, checkpoint: u64) -> Result<()> {
        self.write_checkpoint(checkpoint)
    }

    fn write_checkpoint(&self, checkpoint: u64) -> Result<()> {
        let last = self.current_lsn();
        if checkpoint > last {
            return Err(Error::Storage(format!(
                "checkpoint {checkpoint} is past the last LSN {last}"
            )));
        }

        let tmp = self.checkpoint_path.with_extension("txt.tmp");
        let persisted = File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(checkpoint.to_string().as_bytes())?;
                f.sync_all()
            })
            .and_then(|()| std::fs::rename(&tmp, &self.checkpoint_path))
            .and_then(|()| sync_parent(&self.checkpoint_path));
        persisted.map_err(|e| Error::Storage(format!("failed to persist checkpoint: {e}")))?;

        self.checkpoint.store(checkpoint, Ordering::SeqCst);
        Ok(())
    }

}

/// Strip the line terminator and decode, replacing bytes that are not UTF-8
///
/// A damaged line still occupies its position so later LSNs stay aligned.
fn decode_line(line_no: u64, mut buf: Vec<u8>) -> String {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    String::from_utf8(buf).unwrap_or_else(|e| {
        warn!("WAL line {} is not valid UTF-8, decoding lossily", line_no);
        String::from_utf8_lossy(e.as_bytes()).into_owned()
    })
}

fn write_record(file: &mut File, record: &[u8], sync: bool) -> std::io::Result<()> {
    file.write_all(record)?;
    if sync {
        file.sync_data()
    } else {
        file.flush()
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> std::io::Result<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => File::open(dir)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
