use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::model::Event;
use crate::observability::{JOURNAL_FLUSH_BATCH_SIZE, JOURNAL_FLUSH_DURATION_SECONDS};

/// Encode one record as `[len][bincode][crc32]`.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Append-only journal of committed events.
///
/// Record format: `[u32 le: payload len][bincode Event][u32 le: crc32 of payload]`.
/// A torn or corrupt tail (crash mid-write) ends replay at the last good record.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Journal {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Buffer one record; nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("journal.tmp")
    }

    /// Write the snapshot to a side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the journal and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact record. A missing file is an empty journal.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        while let Some(len) = read_u32(&mut reader)? {
            let mut payload = vec![0u8; len as usize];
            if !read_full(&mut reader, &mut payload)? {
                warn!(path = %path.display(), records = events.len(), "journal ends in a torn record");
                break;
            }
            let Some(crc) = read_u32(&mut reader)? else {
                warn!(path = %path.display(), records = events.len(), "journal ends in a torn record");
                break;
            };
            if crc != crc32fast::hash(&payload) {
                warn!(path = %path.display(), records = events.len(), "journal checksum mismatch, stopping replay");
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(path = %path.display(), records = events.len(), "undecodable journal record: {e}");
                    break;
                }
            }
        }
        Ok(events)
    }
}

/// `Ok(false)` on clean or torn EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_u32(reader: &mut impl Read) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    Ok(read_full(reader, &mut buf)?.then(|| u32::from_le_bytes(buf)))
}

// ── Group commit ─────────────────────────────────────────

enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Start retaining appends so they survive the next `Compact`.
    BeginCompaction {
        response: oneshot::Sender<()>,
    },
    AbortCompaction,
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

/// Cheap, cloneable sender side of the journal writer task.
#[derive(Clone)]
pub struct JournalHandle {
    tx: mpsc::Sender<JournalCommand>,
}

impl JournalHandle {
    /// Move the journal into a background writer task. Must be called inside a tokio runtime.
    pub fn spawn(journal: Journal) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(journal, rx));
        Self { tx }
    }

    /// Durably append one event. Returns once its batch is fsynced.
    pub async fn append(&self, event: &Event) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.send(JournalCommand::Append {
            event: event.clone(),
            response,
        })
        .await?;
        rx.await
            .map_err(|_| io::Error::other("journal writer dropped response"))?
    }

    /// Mark the point a state snapshot is taken from. Events committed after the
    /// mark are re-appended behind the snapshot by `compact`.
    pub async fn begin_compaction(&self) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.send(JournalCommand::BeginCompaction { response }).await?;
        rx.await
            .map_err(|_| io::Error::other("journal writer dropped response"))
    }

    pub async fn abort_compaction(&self) {
        let _ = self.send(JournalCommand::AbortCompaction).await;
    }

    /// Replace the journal with `events` plus whatever was committed since
    /// `begin_compaction`.
    pub async fn compact(&self, events: Vec<Event>) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.send(JournalCommand::Compact { events, response }).await?;
        rx.await
            .map_err(|_| io::Error::other("journal writer dropped response"))?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self
            .send(JournalCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn send(&self, cmd: JournalCommand) -> io::Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| io::Error::other("journal writer shut down"))
    }
}

/// Owns the journal. Waits for an append, drains whatever else is already queued,
/// writes the batch with one fsync and answers every sender with the same result.
async fn writer_loop(journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    let mut writer = Writer {
        journal,
        retained: None,
    };
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            JournalCommand::Append { event, response } => (event, response),
            other => {
                writer.handle_control(other);
                continue;
            }
        };

        let mut batch: Pending = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                JournalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        writer.commit_batch(batch);
        if let Some(cmd) = deferred {
            writer.handle_control(cmd);
        }
    }
}

struct Writer {
    journal: Journal,
    /// Events committed since `BeginCompaction`, if one is in progress.
    retained: Option<Vec<Event>>,
}

impl Writer {
    fn commit_batch(&mut self, batch: Pending) {
        metrics::histogram!(JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let started = std::time::Instant::now();

        let appended = batch
            .iter()
            .try_for_each(|(event, _)| self.journal.append_buffered(event));
        // Flush even after a failed append so partial bytes never bleed into the next batch.
        let flushed = self.journal.flush_sync();
        let result = appended.and(flushed);

        metrics::histogram!(JOURNAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        match &result {
            Ok(()) => {
                if let Some(retained) = self.retained.as_mut() {
                    retained.extend(batch.iter().map(|(event, _)| event.clone()));
                }
            }
            Err(e) => warn!(records = batch.len(), "journal batch failed: {e}"),
        }
        for (_, tx) in batch {
            let reply = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(reply);
        }
    }

    fn handle_control(&mut self, cmd: JournalCommand) {
        match cmd {
            JournalCommand::BeginCompaction { response } => {
                self.retained = Some(Vec::new());
                let _ = response.send(());
            }
            JournalCommand::AbortCompaction => self.retained = None,
            JournalCommand::Compact { mut events, response } => {
                let tail = self.retained.take().unwrap_or_default();
                let tail_len = tail.len() as u64;
                events.extend(tail);
                let result = Journal::write_compact_file(self.journal.path(), &events)
                    .and_then(|()| self.journal.swap_compact_file());
                if result.is_ok() {
                    self.journal.appends_since_compact = tail_len;
                }
                let _ = response.send(result);
            }
            JournalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(self.journal.appends_since_compact());
            }
            JournalCommand::Append { event, response } => {
                self.commit_batch(vec![(event, response)])
            }
        }
    }
}
