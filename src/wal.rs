use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Upper bound on one encoded entry. A larger length prefix can only come
/// from a corrupt tail, so the writer refuses to produce one.
pub(crate) const MAX_ENTRY_BYTES: usize = 16 * 1024 * 1024;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_ENTRY_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("WAL entry of {} bytes exceeds {MAX_ENTRY_BYTES}", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash) is cut off by [`Wal::recover`] before any new
///   entry is appended, so later entries never sit behind garbage.
///
/// Nothing in the booking history is ever deleted, so the log is the data
/// and is never compacted.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful `flush_sync`.
    durable_len: u64,
    pending: u64,
    appended: u64,
    /// Set when a failed batch could not be cut back off the file.
    poisoned: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`, appending after its current end.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            durable_len,
            pending: 0,
            appended: 0,
            poisoned: false,
        })
    }

    /// Replay the log at `path` and open it for appending. Bytes after the
    /// last valid entry are truncated away and the truncation is fsynced first.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = scan(path)?;
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.len() > valid_len {
                warn!(
                    "WAL {}: discarding {} bytes after the last valid entry",
                    path.display(),
                    meta.len() - valid_len
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }
        Ok((Self::open(path)?, events))
    }

    /// Append a single event and fsync. The server path uses
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Append a single event to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit all buffered events,
    /// or `discard_pending()` to drop them.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL holds an unrecoverable failed batch"));
        }
        encode_event(&mut self.writer, event)?;
        self.pending += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len = self.writer.get_ref().metadata()?.len();
        self.appended += self.pending;
        self.pending = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`, both
    /// the buffered bytes and any that already reached the file. If the file
    /// cannot be cut back, the log refuses all further appends.
    pub fn discard_pending(&mut self) -> io::Result<()> {
        self.pending = 0;
        let result = self.truncate_to_durable();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        // into_parts hands back the buffer without writing it out
        let (_, _unwritten) = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events durably appended since this handle was opened.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Replay the WAL from disk, returning all valid events.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|(events, _)| events)
    }
}

/// All events up to the first torn, oversized or CRC-failing entry, and the
/// byte length they cover. An entry whose CRC matches but which does not
/// decode is an error: it was written whole, so cutting it off would lose data.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0u64;
    while let Some(payload) = read_entry(&mut reader)? {
        let event = bincode::deserialize::<Event>(&payload).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("WAL entry at byte {valid_len} does not decode: {e}"),
            )
        })?;
        events.push(event);
        valid_len += payload.len() as u64 + 8;
    }
    Ok((events, valid_len))
}

/// Next CRC-verified payload, or `None` at the end of the valid log.
fn read_entry(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_ENTRY_BYTES {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut payload)? || !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// `read_exact` that reports a short read as `false` instead of an error.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
