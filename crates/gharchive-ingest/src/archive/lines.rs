//! Streaming line reader over a gzip-compressed unit payload

use crate::archive::cache::remove_if_present;
use crate::error::SourceError;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

const READ_BUFFER_BYTES: usize = 256 * 1024;

/// Lines buffered between the blocking reader and the engine
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Lazy, finite sequence of raw lines from one cached archive
///
/// Lines keep their `\n` terminator. A truncated or corrupt stream deletes
/// the cached file and yields [`SourceError::Truncated`]; after any error
/// the source is exhausted. Re-open to restart.
pub struct LineSource {
    path: PathBuf,
    reader: Option<BufReader<MultiGzDecoder<File>>>,
    lines_read: u64,
}

impl LineSource {
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let reader = BufReader::with_capacity(READ_BUFFER_BYTES, MultiGzDecoder::new(file));

        Ok(Self {
            path,
            reader: Some(reader),
            lines_read: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    /// Decompress on the blocking pool and hand lines over a bounded channel
    ///
    /// Must be called inside a tokio runtime. Dropping the returned stream
    /// stops the reader at its next line.
    pub fn spawn(self) -> LineStream {
        let path = self.path.display().to_string();
        let (tx, lines) = mpsc::channel(LINE_CHANNEL_CAPACITY);

        let reader = tokio::task::spawn_blocking(move || {
            for line in self {
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });

        LineStream {
            path,
            lines,
            reader: Some(reader),
        }
    }

    fn fail(&mut self, source: std::io::Error) -> SourceError {
        // close the file before touching it on disk
        self.reader = None;
        let path = self.path.display().to_string();

        if is_corruption(&source) {
            warn!(
                path = %path,
                lines = self.lines_read,
                "Compressed archive ended before the end-of-stream marker, purging cache copy"
            );
            remove_if_present(&self.path);
            SourceError::Truncated { path, source }
        } else {
            SourceError::Io { path, source }
        }
    }
}

fn is_corruption(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::UnexpectedEof | ErrorKind::InvalidData | ErrorKind::InvalidInput
    )
}

impl Iterator for LineSource {
    type Item = Result<Vec<u8>, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        let mut line = Vec::new();

        match reader.read_until(b'\n', &mut line) {
            Ok(0) => {
                self.reader = None;
                None
            },
            Ok(_) => {
                self.lines_read += 1;
                Some(Ok(line))
            },
            Err(e) => Some(Err(self.fail(e))),
        }
    }
}

/// Receiving end of [`LineSource::spawn`]
pub struct LineStream {
    path: String,
    lines: mpsc::Receiver<Result<Vec<u8>, SourceError>>,
    reader: Option<JoinHandle<()>>,
}

impl LineStream {
    /// Next line, or `None` once the reader finished cleanly
    ///
    /// A reader that died without finishing surfaces as one final
    /// [`SourceError::Io`], never as a short clean end.
    pub async fn next(&mut self) -> Option<Result<Vec<u8>, SourceError>> {
        if let Some(line) = self.lines.recv().await {
            return Some(line);
        }

        match self.reader.take()?.await {
            Ok(()) => None,
            Err(e) => Some(Err(SourceError::Io {
                path: self.path.clone(),
                source: std::io::Error::other(e),
            })),
        }
    }
}
