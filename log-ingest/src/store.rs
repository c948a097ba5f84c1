//! Append-only AI-call log store.
//!
//! Each (tenant, app) pair owns one JSON-Lines data file,
//! `{tenant}__{app}.jsonl`, and a sidecar index `{tenant}__{app}.jsonl.idx.json`
//! holding the byte offset of every `index_stride`-th line. The index is
//! derived data: it only speeds up seeking and can be rebuilt from the data
//! file at any time. A stale index costs a longer scan, never a wrong answer.
//!
//! Writes are serialized per store. Readers do not take the writer lock and
//! only ever see complete lines, so a read concurrent with an append observes
//! the file either before or after it.
//!
//! Persistence is best effort. Public methods log and swallow I/O failures:
//! the batch was already admitted, and the ingestion API stays available even
//! when the disk does not.

use crate::config::StorageConfig;
use crate::metrics_defs::{STORE_APPENDED_RECORDS, STORE_WRITE_FAILURES};
use call_log::record::{IngestionRecord, UploadItem};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared::counter;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const DATA_EXTENSION: &str = ".jsonl";
const INDEX_SUFFIX: &str = ".idx.json";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub line_number: u64,
    pub byte_offset: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexFile {
    stride: u64,
    entries: Vec<IndexEntry>,
}

/// Result of a best-effort append.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum SaveOutcome {
    Saved(usize),
    Failed(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<IngestionRecord>,
    pub next_cursor: u64,
    pub has_more: bool,
}

pub struct LogStore {
    root: PathBuf,
    index_stride: u64,
    retention: Option<Duration>,
    sync_writes: bool,
    write_lock: Mutex<()>,
}

impl LogStore {
    pub fn new(config: &StorageConfig) -> Self {
        let retention = match config.retention_days {
            0 => None,
            days => Some(Duration::from_secs(days * 24 * 60 * 60)),
        };

        LogStore {
            root: config.dir.clone(),
            index_stride: config.index_stride.max(1),
            retention,
            sync_writes: config.sync_writes,
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Appends `items` for the given tenant and app. Never returns an error;
    /// a failed write is logged and reported as [`SaveOutcome::Failed`].
    pub fn save_batch(&self, tenant_id: &str, app_id: &str, items: &[UploadItem]) -> SaveOutcome {
        if items.is_empty() {
            return SaveOutcome::Saved(0);
        }

        match self.append(tenant_id, app_id, items) {
            Ok(count) => {
                counter!(STORE_APPENDED_RECORDS).increment(count as u64);
                SaveOutcome::Saved(count)
            }
            Err(e) => {
                counter!(STORE_WRITE_FAILURES).increment(1);
                tracing::error!(
                    tenant = tenant_id,
                    app = app_id,
                    items = items.len(),
                    error = %e,
                    "Failed to persist AI call batch"
                );
                SaveOutcome::Failed(e.to_string())
            }
        }
    }

    /// The last `limit` records in insertion order.
    pub fn query(&self, tenant_id: &str, app_id: &str, limit: usize) -> Vec<IngestionRecord> {
        let data_path = self.data_path(tenant_id, app_id);
        let result = count_lines(&data_path, &self.load_index(&data_path)).and_then(|total| {
            let start = total.saturating_sub(limit as u64);
            self.read_page(&data_path, start, limit)
        });

        match result {
            Ok(page) => page.items,
            Err(e) => {
                log_read_error(&data_path, &e);
                Vec::new()
            }
        }
    }

    /// Up to `limit` records starting at line `cursor`.
    pub fn query_page(&self, tenant_id: &str, app_id: &str, cursor: u64, limit: usize) -> Page {
        let data_path = self.data_path(tenant_id, app_id);
        match self.read_page(&data_path, cursor, limit) {
            Ok(page) => page,
            Err(e) => {
                log_read_error(&data_path, &e);
                Page {
                    items: Vec::new(),
                    next_cursor: cursor,
                    has_more: false,
                }
            }
        }
    }

    /// Recomputes the index sidecar of every data file. Returns the number of
    /// files rebuilt; zero if the store root cannot be read.
    pub fn rebuild_indexes(&self) -> usize {
        self.try_rebuild_indexes().unwrap_or_else(|e| {
            tracing::error!(root = %self.root.display(), error = %e, "Index rebuild failed");
            0
        })
    }

    /// Like [`rebuild_indexes`](Self::rebuild_indexes) but reports a failure to
    /// list the store root. Individual files that fail are logged and skipped.
    pub fn try_rebuild_indexes(&self) -> Result<usize, StoreError> {
        let mut rebuilt = 0;
        for data_path in self.data_files()? {
            match self.rebuild_index(&data_path) {
                Ok(()) => rebuilt += 1,
                Err(e) => {
                    tracing::warn!(file = %data_path.display(), error = %e, "Failed to rebuild index")
                }
            }
        }
        Ok(rebuilt)
    }

    /// Deletes data files (and their sidecars) not modified within the
    /// retention period. Returns the number of data files deleted.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(SystemTime::now())
    }

    pub fn purge_expired_at(&self, now: SystemTime) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };

        let files = match self.data_files() {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(root = %self.root.display(), error = %e, "Retention purge failed");
                return 0;
            }
        };

        let mut purged = 0;
        for data_path in files {
            if !is_expired(&data_path, now, retention) {
                continue;
            }

            let _guard = self.write_lock.lock();
            // An append may have landed between the listing and the lock.
            if !is_expired(&data_path, now, retention) {
                continue;
            }

            // Sidecar first: an index must never outlive its data file.
            match fs::remove_file(index_path(&data_path)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(file = %data_path.display(), error = %e, "Failed to remove index, keeping log file");
                    continue;
                }
            }

            match fs::remove_file(&data_path) {
                Ok(()) => {
                    purged += 1;
                    tracing::info!(file = %data_path.display(), "Purged expired log file");
                }
                Err(e) => {
                    tracing::warn!(file = %data_path.display(), error = %e, "Failed to purge log file")
                }
            }
        }
        purged
    }

    fn append(&self, tenant_id: &str, app_id: &str, items: &[UploadItem]) -> Result<usize, StoreError> {
        let ingested_at = call_log::now_epoch_ms();
        let tenant_id = sanitize(tenant_id);
        let app_id = sanitize(app_id);

        let mut lines = Vec::with_capacity(items.len());
        for item in items {
            let record = IngestionRecord {
                tenant_id: tenant_id.clone(),
                app_id: app_id.clone(),
                ingested_at,
                item: item.clone(),
            };
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            lines.push(line);
        }

        let _guard = self.write_lock.lock();
        fs::create_dir_all(&self.root)?;
        let data_path = self.root.join(file_name(&tenant_id, &app_id));

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&data_path)?;

        let mut offset = file.metadata()?.len();
        // A torn tail from an earlier crash is terminated so it stays a single
        // unparsable line instead of corrupting the first new record.
        if offset > 0 && !ends_with_newline(&mut file, offset)? {
            file.write_all(b"\n")?;
            offset += 1;
        }

        // A fresh file never inherits a sidecar left behind by its predecessor.
        let mut index = match offset {
            0 => IndexFile::default(),
            _ => self.load_index(&data_path),
        };
        let mut line_number = count_lines(&data_path, &index)?;

        let mut buffer = Vec::with_capacity(lines.iter().map(Vec::len).sum());
        for line in &lines {
            if line_number % self.index_stride == 0 {
                index.entries.push(IndexEntry {
                    line_number,
                    byte_offset: offset,
                });
            }
            offset += line.len() as u64;
            line_number += 1;
            buffer.extend_from_slice(line);
        }

        file.write_all(&buffer)?;
        file.flush()?;
        if self.sync_writes {
            file.sync_data()?;
        }

        index.stride = self.index_stride;
        index.entries.dedup_by_key(|e| e.line_number);
        if let Err(e) = write_index(&data_path, &index) {
            tracing::warn!(file = %data_path.display(), error = %e, "Failed to update index");
        }

        Ok(lines.len())
    }

    fn read_page(&self, data_path: &Path, cursor: u64, limit: usize) -> Result<Page, StoreError> {
        let empty = Page {
            items: Vec::new(),
            next_cursor: cursor,
            has_more: false,
        };

        let file = match File::open(data_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(empty),
            Err(e) => return Err(e.into()),
        };

        let start = seek_entry(&self.load_index(data_path), cursor);
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(start.byte_offset))?;

        let mut line_number = start.line_number;
        let mut buffer = Vec::new();
        let mut items = Vec::new();

        while line_number < cursor {
            if !read_complete_line(&mut reader, &mut buffer)? {
                return Ok(empty);
            }
            line_number += 1;
        }

        while items.len() < limit {
            if !read_complete_line(&mut reader, &mut buffer)? {
                return Ok(Page {
                    items,
                    next_cursor: line_number,
                    has_more: false,
                });
            }
            match serde_json::from_slice::<IngestionRecord>(&buffer) {
                Ok(record) => items.push(record),
                Err(e) => tracing::warn!(
                    file = %data_path.display(),
                    line = line_number,
                    error = %e,
                    "Skipping unreadable log line"
                ),
            }
            line_number += 1;
        }

        let has_more = read_complete_line(&mut reader, &mut buffer)?;
        Ok(Page {
            items,
            next_cursor: line_number,
            has_more,
        })
    }

    fn rebuild_index(&self, data_path: &Path) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut reader = BufReader::new(File::open(data_path)?);
        let mut buffer = Vec::new();
        let mut index = IndexFile {
            stride: self.index_stride,
            entries: Vec::new(),
        };

        let mut line_number = 0;
        let mut offset = 0;
        loop {
            let start = offset;
            buffer.clear();
            let read = reader.read_until(b'\n', &mut buffer)?;
            if read == 0 || buffer.last() != Some(&b'\n') {
                break;
            }
            if line_number % self.index_stride == 0 {
                index.entries.push(IndexEntry {
                    line_number,
                    byte_offset: start,
                });
            }
            offset += read as u64;
            line_number += 1;
        }

        write_index(data_path, &index)?;
        Ok(())
    }

    /// The sidecar of `data_path`, cut back to the entries that still line up
    /// with the data file. A missing or corrupt sidecar yields an empty index.
    fn load_index(&self, data_path: &Path) -> IndexFile {
        let path = index_path(data_path);
        let index = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(file = %path.display(), error = %e, "Ignoring corrupt index");
                IndexFile::default()
            }),
            Err(_) => IndexFile::default(),
        };
        if index.entries.is_empty() {
            return index;
        }

        check_index(data_path, index).unwrap_or_else(|e| {
            tracing::warn!(file = %path.display(), error = %e, "Cannot check index");
            IndexFile::default()
        })
    }

    fn data_files(&self) -> Result<Vec<PathBuf>, io::Error> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_data = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(DATA_EXTENSION));
            if is_data && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn data_path(&self, tenant_id: &str, app_id: &str) -> PathBuf {
        self.root.join(file_name(&sanitize(tenant_id), &sanitize(app_id)))
    }
}

/// Maps characters outside `[A-Za-z0-9._-]` to `_`; blank ids become `unknown`.
pub fn sanitize(id: &str) -> String {
    if id.trim().is_empty() {
        return "unknown".into();
    }
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn file_name(tenant_id: &str, app_id: &str) -> String {
    format!("{tenant_id}__{app_id}{DATA_EXTENSION}")
}

fn index_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_owned();
    name.push(INDEX_SUFFIX);
    PathBuf::from(name)
}

/// Replaces the sidecar atomically so concurrent readers never see a
/// half-written index.
fn write_index(data_path: &Path, index: &IndexFile) -> Result<(), StoreError> {
    let path = index_path(data_path);
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{:08x}", rand_suffix()));
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, serde_json::to_vec_pretty(index)?)?;
    if let Err(e) = fs::rename(&tmp, &path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn rand_suffix() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos ^ std::process::id()
}

/// Unreadable metadata counts as not expired.
fn is_expired(data_path: &Path, now: SystemTime, retention: Duration) -> bool {
    match fs::metadata(data_path).and_then(|m| m.modified()) {
        Ok(modified) => now.duration_since(modified).is_ok_and(|age| age > retention),
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(file = %data_path.display(), error = %e, "Cannot read file age");
            }
            false
        }
    }
}

/// Keeps the leading run of entries that point at line starts of the data
/// file: strictly ascending, inside the file and preceded by a newline.
fn check_index(data_path: &Path, mut index: IndexFile) -> io::Result<IndexFile> {
    let mut file = match File::open(data_path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            index.entries.clear();
            return Ok(index);
        }
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();

    let mut previous = None;
    let mut valid = 0;
    for entry in &index.entries {
        if !is_line_start(&mut file, len, entry, previous)? {
            break;
        }
        previous = Some(*entry);
        valid += 1;
    }

    if valid < index.entries.len() {
        tracing::warn!(
            file = %data_path.display(),
            kept = valid,
            dropped = index.entries.len() - valid,
            "Index does not match data file"
        );
        index.entries.truncate(valid);
    }
    Ok(index)
}

fn is_line_start(
    file: &mut File,
    len: u64,
    entry: &IndexEntry,
    previous: Option<IndexEntry>,
) -> io::Result<bool> {
    if entry.byte_offset >= len || entry.line_number > entry.byte_offset {
        return Ok(false);
    }
    if let Some(previous) = previous
        && (entry.line_number <= previous.line_number || entry.byte_offset <= previous.byte_offset)
    {
        return Ok(false);
    }
    if entry.byte_offset == 0 || entry.line_number == 0 {
        return Ok(entry.byte_offset == entry.line_number);
    }

    let mut before = [0u8; 1];
    file.seek(SeekFrom::Start(entry.byte_offset - 1))?;
    file.read_exact(&mut before)?;
    Ok(before[0] == b'\n')
}

/// Nearest index entry at or before `cursor`, or the start of the file.
fn seek_entry(index: &IndexFile, cursor: u64) -> IndexEntry {
    index
        .entries
        .iter()
        .rev()
        .find(|e| e.line_number <= cursor)
        .copied()
        .unwrap_or(IndexEntry {
            line_number: 0,
            byte_offset: 0,
        })
}

/// Number of complete lines, scanning forward from the last index entry.
fn count_lines(data_path: &Path, index: &IndexFile) -> Result<u64, StoreError> {
    let file = match File::open(data_path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let start = index.entries.last().copied().unwrap_or(IndexEntry {
        line_number: 0,
        byte_offset: 0,
    });
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(start.byte_offset))?;

    let mut buffer = Vec::new();
    let mut lines = start.line_number;
    while read_complete_line(&mut reader, &mut buffer)? {
        lines += 1;
    }
    Ok(lines)
}

/// Reads one newline-terminated line into `buffer`. Returns false at EOF or
/// when only a partial (still being written) line remains.
fn read_complete_line<R: BufRead>(reader: &mut R, buffer: &mut Vec<u8>) -> io::Result<bool> {
    buffer.clear();
    let read = reader.read_until(b'\n', buffer)?;
    Ok(read > 0 && buffer.last() == Some(&b'\n'))
}

fn ends_with_newline(file: &mut File, len: u64) -> io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn log_read_error(data_path: &Path, e: &StoreError) {
    tracing::error!(file = %data_path.display(), error = %e, "Failed to read AI call log");
}
