//! Quote corpus storage.
//!
//! The whole quotes file is held in one buffer. Individual quotes are
//! byte ranges into that buffer, rebuilt from scratch whenever the buffer
//! is replaced, so a range can never outlive the bytes it points into.
//!
//! Three divider policies are supported:
//! - `line`: every line is a quote
//! - `percent`: quotes are separated by lines consisting of a single `%`
//! - `file`: the whole file is one quote

use clap::ValueEnum;
use serde::Deserialize;
use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How a quotes file is split into individual quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Divider {
    Line,
    Percent,
    File,
}

impl Divider {
    /// Split `raw` into quote ranges according to this policy.
    pub fn segment(self, raw: &[u8]) -> Result<Vec<Range<usize>>, CorpusError> {
        match self {
            Divider::Line => Ok(segment_lines(raw)),
            Divider::Percent => segment_percent(raw),
            Divider::File => Ok(vec![0..raw.len()]),
        }
    }
}

/// Each `\n` terminates one entry; a non-empty remainder is one more.
fn segment_lines(raw: &[u8]) -> Vec<Range<usize>> {
    let mut entries = Vec::new();
    let mut start = 0;

    for (i, &byte) in raw.iter().enumerate() {
        if byte == b'\n' {
            entries.push(start..i);
            start = i + 1;
        }
    }

    if start < raw.len() {
        entries.push(start..raw.len());
    }

    entries
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watch {
    Idle,
    Newline,
    Percent,
}

/// Splits on `\n%\n`. The divider line and the newlines around it belong to
/// neither neighbour. A `%` line at the very start of the file also counts.
fn segment_percent(raw: &[u8]) -> Result<Vec<Range<usize>>, CorpusError> {
    let mut entries = Vec::new();
    let mut start = 0;
    let mut found = false;
    let mut watch = Watch::Newline;

    for (i, &byte) in raw.iter().enumerate() {
        watch = match (watch, byte) {
            (Watch::Percent, b'\n') => {
                // i - 2 is the newline in front of the `%`
                let end = i.saturating_sub(2).max(start);
                entries.push(start..end);
                start = i + 1;
                found = true;
                Watch::Newline
            }
            (_, b'\n') => Watch::Newline,
            (Watch::Newline, b'%') => Watch::Percent,
            _ => Watch::Idle,
        };
    }

    if !found {
        return Err(CorpusError::NoDelimiter);
    }

    if start < raw.len() {
        let end = if raw.ends_with(b"\n") {
            raw.len() - 1
        } else {
            raw.len()
        };
        entries.push(start..end.max(start));
    }

    Ok(entries)
}

/// An immutable, segmented snapshot of a quotes file.
#[derive(Debug)]
pub struct Corpus {
    raw: Vec<u8>,
    entries: Vec<Range<usize>>,
}

impl Corpus {
    /// Normalize and segment raw file contents.
    ///
    /// Embedded NUL bytes are replaced with spaces first.
    pub fn parse(mut raw: Vec<u8>, divider: Divider) -> Result<Self, CorpusError> {
        for byte in raw.iter_mut().filter(|b| **b == 0) {
            *byte = b' ';
        }

        let mut corpus = Corpus {
            raw,
            entries: Vec::new(),
        };
        corpus.segment(divider)?;
        Ok(corpus)
    }

    /// Rebuild the entry list from the buffer.
    ///
    /// On error the existing entries are left as they were.
    pub fn segment(&mut self, divider: Divider) -> Result<(), CorpusError> {
        self.entries = divider.segment(&self.raw)?;
        Ok(())
    }

    /// Number of entries, blank ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the text of entry `index`.
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.entries
            .get(index)
            .map(|range| &self.raw[range.clone()])
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.entries.iter().map(|range| &self.raw[range.clone()])
    }

    /// Whether at least one entry is non-blank.
    pub fn has_quotes(&self) -> bool {
        self.iter().any(|quote| !quote.is_empty())
    }

    /// Size of the underlying file buffer in bytes.
    pub fn size(&self) -> usize {
        self.raw.len()
    }
}

/// Modification time and length of the quotes file when it was last read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(FileStamp {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// Owner of the active corpus and the file it came from.
///
/// Readers take an `Arc<Corpus>` snapshot; a reload swaps in a new corpus
/// only after the replacement has been fully read and segmented.
#[derive(Debug)]
pub struct CorpusStore {
    path: PathBuf,
    divider: Divider,
    current: Arc<Corpus>,
    stamp: Option<FileStamp>,
}

impl CorpusStore {
    /// Read and segment the quotes file at `path`.
    pub fn open(path: impl Into<PathBuf>, divider: Divider) -> Result<Self, CorpusError> {
        let path = path.into();
        let (corpus, stamp) = read_corpus(&path, divider)?;

        info!(
            path = %path.display(),
            divider = ?divider,
            quotes = corpus.len(),
            bytes = corpus.size(),
            "Opened quotes file"
        );

        Ok(CorpusStore {
            path,
            divider,
            current: Arc::new(corpus),
            stamp,
        })
    }

    /// Re-read the quotes file unconditionally.
    ///
    /// The previous corpus stays active if the read or segmentation fails.
    pub fn reload(&mut self) -> Result<(), CorpusError> {
        let (corpus, stamp) = read_corpus(&self.path, self.divider)?;

        info!(
            path = %self.path.display(),
            quotes = corpus.len(),
            bytes = corpus.size(),
            "Reloaded quotes file"
        );

        self.current = Arc::new(corpus);
        self.stamp = stamp;
        Ok(())
    }

    /// Re-read the quotes file if it changed on disk since the last read.
    ///
    /// Returns whether a new corpus was installed.
    pub fn refresh(&mut self) -> Result<bool, CorpusError> {
        let stamp = FileStamp::of(&self.path).map_err(|e| CorpusError::Io(self.path.clone(), e))?;

        if self.stamp == Some(stamp) {
            return Ok(false);
        }

        debug!(path = %self.path.display(), "Quotes file changed on disk");
        // A broken replacement is not retried until it changes again.
        self.stamp = Some(stamp);
        self.reload()?;
        Ok(true)
    }

    /// Like `refresh`, but logs failures and keeps serving the old corpus.
    pub fn refresh_or_keep(&mut self) {
        if let Err(e) = self.refresh() {
            warn!(error = %e, "Unable to refresh quotes file, keeping previous quotes");
        }
    }

    /// Snapshot of the active corpus.
    pub fn corpus(&self) -> Arc<Corpus> {
        Arc::clone(&self.current)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn divider(&self) -> Divider {
        self.divider
    }
}

fn read_corpus(path: &Path, divider: Divider) -> Result<(Corpus, Option<FileStamp>), CorpusError> {
    // Stamp first so a write racing the read is picked up by the next refresh.
    let stamp = FileStamp::of(path).ok();
    let raw = fs::read(path).map_err(|e| CorpusError::Io(path.to_path_buf(), e))?;
    let corpus = Corpus::parse(raw, divider)?;

    if !corpus.has_quotes() {
        return Err(CorpusError::Empty);
    }

    Ok((corpus, stamp))
}

/// Corpus loading errors
#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("Unable to read quotes file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] io::Error),
    #[error(
        "No '%' divider lines were found in the quotes file; \
         use the `file` divider to serve the whole file as one quote"
    )]
    NoDelimiter,
    #[error("Quotes file has no non-empty quotes")]
    Empty,
}
