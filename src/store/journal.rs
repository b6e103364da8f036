use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::observability;

/// Frame one record as `[u32 len][bincode Event][u32 crc32]`, little endian.
fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one framed record. `Ok(None)` marks the end of the usable log: clean
/// EOF, a torn tail from a crash, or a record that fails its checksum.
fn read_record(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
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
    Ok(bincode::deserialize(&payload).ok())
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only booking journal.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_rewrite: u64,
    /// File length and append count as of the last successful sync.
    synced_len: u64,
    synced_appends: u64,
}

impl Journal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_rewrite: 0,
            synced_len,
            synced_appends: 0,
        })
    }

    /// Buffer a record without syncing; `sync` makes the batch durable.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.writer, event)?;
        self.appends_since_rewrite += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.writer.get_ref().metadata()?.len();
        self.synced_appends = self.appends_since_rewrite;
        Ok(())
    }

    /// Discard everything appended since the last successful sync, buffered
    /// or already written, so none of it comes back on replay.
    pub fn rollback(&mut self) -> io::Result<()> {
        let fresh = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(fresh));
        // Unflushed bytes go down with the old writer.
        let (_file, _unflushed) = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.appends_since_rewrite = self.synced_appends;
        Ok(())
    }

    pub fn appends_since_rewrite(&self) -> u64 {
        self.appends_since_rewrite
    }

    /// Replace the journal with `events`: write a synced temp file, then
    /// rename it over the live file and reopen for appends.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                write_record(&mut tmp, event)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_rewrite = 0;
        self.synced_appends = 0;
        Ok(())
    }

    /// All intact records, oldest first. A missing file is an empty journal.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_record(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

// ── Group commit ─────────────────────────────────────────────────

pub(crate) enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceRewrite {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the journal. Appends that arrive while a batch is being collected
/// share one fsync; every sender hears the batch's result. A failed batch is
/// rolled back whole, so no sender told `Err` has its record replayed.
pub(crate) async fn writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            JournalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut journal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(JournalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut journal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut journal, cmd);
        }
    }
}

fn commit_batch(journal: &mut Journal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| journal.append_buffered(event))
        .and_then(|()| journal.sync());

    metrics::histogram!(observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("journal append failed for batch of {}: {e}", batch.len());
        if let Err(e) = journal.rollback() {
            tracing::error!("journal rollback failed, failed batch may replay: {e}");
        }
    }

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Rewrite { events, response } => {
            let _ = response.send(journal.rewrite(&events));
        }
        JournalCommand::AppendsSinceRewrite { response } => {
            let _ = response.send(journal.appends_since_rewrite());
        }
        JournalCommand::Append { event, response } => commit_batch(journal, vec![(event, response)]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, Provider, ProviderRef};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_journal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn status_event(status: BookingStatus) -> Event {
        Event::BookingStatusChanged {
            id: Ulid::new(),
            provider: ProviderRef::Text("p1".into()).key(),
            status,
        }
    }

    #[test]
    fn append_and_replay_in_order() {
        let path = tmp_path("append_replay.wal");
        let events = vec![
            Event::ProviderUpserted {
                provider: Provider::new(ProviderRef::Text("p1".into())),
            },
            status_event(BookingStatus::Cancelled),
            status_event(BookingStatus::Completed),
        ];
        {
            let mut journal = Journal::open(&path).unwrap();
            for e in &events {
                journal.append_buffered(e).unwrap();
            }
            journal.sync().unwrap();
            assert_eq!(journal.appends_since_rewrite(), 3);
        }
        assert_eq!(Journal::replay(&path).unwrap(), events);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Journal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let kept = status_event(BookingStatus::Cancelled);
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append_buffered(&kept).unwrap();
            journal.append_buffered(&status_event(BookingStatus::NoShow)).unwrap();
            journal.sync().unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        assert_eq!(Journal::replay(&path).unwrap(), vec![kept]);
    }

    #[test]
    fn checksum_mismatch_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append_buffered(&status_event(BookingStatus::Cancelled)).unwrap();
            journal.sync().unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(Journal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn rewrite_replaces_contents_and_keeps_appending() {
        let path = tmp_path("rewrite.wal");
        let mut journal = Journal::open(&path).unwrap();
        for _ in 0..10 {
            journal.append_buffered(&status_event(BookingStatus::Cancelled)).unwrap();
        }
        journal.sync().unwrap();

        let snapshot = vec![status_event(BookingStatus::Completed)];
        journal.rewrite(&snapshot).unwrap();
        assert_eq!(journal.appends_since_rewrite(), 0);

        let after = status_event(BookingStatus::NoShow);
        journal.append_buffered(&after).unwrap();
        journal.sync().unwrap();

        let replayed = Journal::replay(&path).unwrap();
        assert_eq!(replayed, vec![snapshot[0].clone(), after]);
    }

    #[test]
    fn rollback_discards_unsynced_records() {
        let path = tmp_path("rollback.wal");
        let kept = status_event(BookingStatus::Cancelled);
        let mut journal = Journal::open(&path).unwrap();
        journal.append_buffered(&kept).unwrap();
        journal.sync().unwrap();

        // Records bigger than the write buffer reach the file before any sync.
        let mut big = Provider::new(ProviderRef::Text("p1".into()));
        big.name = Some("x".repeat(16 * 1024));
        for _ in 0..3 {
            journal
                .append_buffered(&Event::ProviderUpserted {
                    provider: big.clone(),
                })
                .unwrap();
        }
        assert!(fs::metadata(&path).unwrap().len() > 16 * 1024);

        journal.rollback().unwrap();
        assert_eq!(journal.appends_since_rewrite(), 1);

        let after = status_event(BookingStatus::NoShow);
        journal.append_buffered(&after).unwrap();
        journal.sync().unwrap();
        assert_eq!(Journal::replay(&path).unwrap(), vec![kept, after]);
    }

    #[test]
    fn reopened_journal_rolls_back_to_existing_contents() {
        let path = tmp_path("rollback_reopen.wal");
        let kept = status_event(BookingStatus::Completed);
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append_buffered(&kept).unwrap();
            journal.sync().unwrap();
        }
        let mut journal = Journal::open(&path).unwrap();
        journal.append_buffered(&status_event(BookingStatus::NoShow)).unwrap();
        journal.rollback().unwrap();
        drop(journal);
        assert_eq!(Journal::replay(&path).unwrap(), vec![kept]);
    }

    #[tokio::test]
    async fn writer_loop_acknowledges_concurrent_appends() {
        let path = tmp_path("writer_loop.wal");
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(writer_loop(Journal::open(&path).unwrap(), rx));

        let mut acks = Vec::new();
        for _ in 0..20 {
            let (resp_tx, resp_rx) = oneshot::channel();
            tx.send(JournalCommand::Append {
                event: status_event(BookingStatus::Cancelled),
                response: resp_tx,
            })
            .await
            .unwrap();
            acks.push(resp_rx);
        }
        for ack in acks {
            ack.await.unwrap().unwrap();
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(JournalCommand::AppendsSinceRewrite { response: resp_tx })
            .await
            .unwrap();
        assert_eq!(resp_rx.await.unwrap(), 20);
        assert_eq!(Journal::replay(&path).unwrap().len(), 20);
    }
}
