use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::WalRecord;

/// Encode a single record as one [len][bincode][crc32] frame.
fn encode_frame(record: &WalRecord) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    let crc = crc32fast::hash(&payload);
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

fn encode_record(writer: &mut impl Write, record: &WalRecord) -> io::Result<()> {
    writer.write_all(&encode_frame(record)?)
}

/// Append-only Write-Ahead Log of committed atomic blocks.
///
/// Format per entry: `[u32: len][bincode: WalRecord][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - One entry holds every event of one block, so a torn entry drops the whole block.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by acknowledged appends.
    len: u64,
    /// Set when a failed append could not be cut back off the file.
    poisoned: bool,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            len,
            poisoned: false,
            appends_since_compact: 0,
        })
    }

    /// Append a record and fsync before returning.
    ///
    /// On error the file is truncated back to its length before the call, so a failed
    /// append leaves nothing for replay to find.
    pub fn append(&mut self, record: &WalRecord) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other(format!(
                "WAL {} is poisoned by an earlier failed append",
                self.path.display()
            )));
        }
        let frame = encode_frame(record)?;
        match self.write_frame(&frame) {
            Ok(()) => {
                self.len += frame.len() as u64;
                self.appends_since_compact += 1;
                Ok(())
            }
            Err(e) => {
                if let Err(undo) = self.rollback() {
                    tracing::error!(
                        "WAL {}: could not undo failed append ({undo}), refusing further appends",
                        self.path.display()
                    );
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.write_all(frame)?;
        self.flush_sync()
    }

    /// Drop whatever a failed append left behind, buffered or on disk.
    fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // Replacing the writer flushes its leftovers, so truncate after the swap.
        self.writer = BufWriter::new(file.try_clone()?);
        file.set_len(self.len)?;
        file.sync_all()
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted records to a temp file and fsync.
    pub fn write_compact_file(path: &Path, records: &[WalRecord]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replace the WAL with records that recreate the current state.
    pub fn compact(&mut self, records: &[WalRecord]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid records.
    /// A truncated or corrupt trailing record ends the replay and is cut off the file,
    /// so the next append lands right after the last good record.
    pub fn replay(path: &Path) -> io::Result<Vec<WalRecord>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len: u64 = 0;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!("WAL {}: CRC mismatch, discarding tail", path.display());
                break;
            }

            match bincode::deserialize::<WalRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
            valid_len += 8 + len as u64;
        }

        if valid_len < file_len {
            tracing::warn!(
                "WAL {}: dropping {} trailing bytes",
                path.display(),
                file_len - valid_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Event;
    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn slot_created(id: i64) -> Event {
        Event::SlotCreated {
            id,
            date: NaiveDate::from_ymd_opt(2025, 9, 21).unwrap(),
            time_start: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            time_end: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
            zone: None,
            capacity: 3,
            booked_count: 0,
        }
    }

    fn record(events: Vec<Event>) -> WalRecord {
        WalRecord { txn: Ulid::new(), events }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let records = vec![
            record(vec![slot_created(1)]),
            record(vec![
                Event::BookedCountChanged { slot_id: 1, booked_count: 1 },
                Event::BookedCountChanged { slot_id: 1, booked_count: 2 },
            ]),
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &records {
                wal.append(r).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 2);
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, records);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let first = record(vec![slot_created(1)]);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }

        // Tear a second multi-event record halfway through its payload.
        {
            let mut buf = Vec::new();
            encode_record(
                &mut buf,
                &record(vec![slot_created(2), Event::BookedCountChanged { slot_id: 2, booked_count: 1 }]),
            )
            .unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&buf[..buf.len() / 2]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first.clone()]);

        // The torn bytes are gone, so a later append is replayable.
        let next = record(vec![slot_created(3)]);
        Wal::open(&path).unwrap().append(&next).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, next]);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");

        {
            let payload = bincode::serialize(&record(vec![Event::BookingCancelled { id: 1 }])).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_reduces_wal_then_accepts_appends() {
        let path = tmp_path("compact.wal");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&record(vec![slot_created(1)])).unwrap();
            for n in 1..=20 {
                wal.append(&record(vec![Event::BookedCountChanged { slot_id: 1, booked_count: n % 3 }]))
                    .unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![record(vec![slot_created(1)])];
        let tail = record(vec![Event::BookedCountChanged { slot_id: 1, booked_count: 1 }]);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&tail).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], snapshot[0]);
        assert_eq!(replayed[1], tail);
    }

    #[test]
    fn rollback_cuts_partial_frame_off_the_file() {
        let path = tmp_path("rollback_partial.wal");
        let first = record(vec![slot_created(1)]);
        let next = record(vec![slot_created(2)]);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&first).unwrap();
        let committed = fs::metadata(&path).unwrap().len();

        // Half a frame reaches disk and more sits in the buffer, as after a failed write.
        let frame = encode_frame(&next).unwrap();
        wal.writer.write_all(&frame[..frame.len() / 2]).unwrap();
        wal.flush_sync().unwrap();
        wal.writer.write_all(&frame[frame.len() / 2..]).unwrap();
        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), committed);

        wal.append(&next).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, next]);
    }

    #[test]
    fn poisoned_wal_refuses_appends() {
        let path = tmp_path("poisoned.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&record(vec![slot_created(1)])).unwrap();
        let before = fs::metadata(&path).unwrap().len();

        wal.poisoned = true;
        assert!(wal.append(&record(vec![slot_created(2)])).is_err());
        assert_eq!(wal.appends_since_compact(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), before);
    }

    #[test]
    fn reopened_wal_tracks_existing_length() {
        let path = tmp_path("reopen_len.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&record(vec![slot_created(1)])).unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        assert_eq!(wal.len, fs::metadata(&path).unwrap().len());
        wal.writer.write_all(b"junk").unwrap();
        wal.rollback().unwrap();
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
    }
}
