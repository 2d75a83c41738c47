use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::model::Event;

/// Frame one record as `[u32 len][bincode payload][u32 crc32]`.
fn write_record<R: Serialize>(writer: &mut impl Write, record: &R) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL record"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the log ended mid-record.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Upper bound on one framed payload. Anything larger is a damaged length prefix.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Next intact record and its framed size, or `None` at end of log / first
/// damaged record.
fn read_record<R: DeserializeOwned>(reader: &mut impl Read) -> io::Result<Option<(R, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<R>(&payload)
        .ok()
        .map(|record| (record, 8 + len as u64)))
}

/// Append-only log of serialised records.
///
/// A crash can leave a torn final record; the length prefix and CRC let
/// replay stop cleanly at the last intact one.
pub struct Log<R> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    _record: PhantomData<fn(R) -> R>,
}

/// The dispatch event log.
pub type Wal = Log<Event>;

impl<R: Serialize + DeserializeOwned> Log<R> {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    /// Append and fsync one record. The dispatch journal batches with
    /// `append_buffered` + `flush_sync` instead.
    pub fn append(&mut self, record: &R) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record without syncing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, record: &R) -> io::Result<()> {
        write_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a compacted log next to `path` and fsync it. Slow; the live log is untouched.
    pub fn write_compact_file(path: &Path, records: &[R]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for record in records {
            write_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn compact(&mut self, records: &[R]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    /// Every intact record in the log, oldest first. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<R>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(Self::read_intact(file)?.0)
    }

    /// Replay, then cut off anything after the last intact record so new
    /// appends don't land behind a torn tail.
    pub fn recover(path: &Path) -> io::Result<Vec<R>> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let (events, intact) = Self::read_intact(file.try_clone()?)?;
        let len = file.metadata()?.len();
        if len > intact {
            warn!(path = %path.display(), dropped_bytes = len - intact, "truncating damaged log tail");
            file.set_len(intact)?;
            file.sync_all()?;
        }
        Ok(events)
    }

    fn read_intact(file: File) -> io::Result<(Vec<R>, u64)> {
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut intact = 0;
        while let Some((record, size)) = read_record(&mut reader)? {
            records.push(record);
            intact += size;
        }
        Ok((records, intact))
    }
}
