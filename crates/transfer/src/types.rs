use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use lanshare_protocol::ProgressReport;
use sha2::{Digest, Sha256};

use crate::TransferError;
use crate::progress::{ProgressThrottle, SPEED_ALPHA, SPEED_MIN_WINDOW, SpeedEstimator};

/// Registry-assigned transfer identifier.
pub type TransferId = u64;

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    /// Present participle used in status lines.
    pub fn verb(self) -> &'static str {
        match self {
            Direction::Send => "Sending",
            Direction::Receive => "Receiving",
        }
    }
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Paused,
    WaitingAck,
    Complete,
    Failed,
}

impl TransferStatus {
    /// Returns `true` for `Complete` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Complete | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferStatus::InProgress => "in progress",
            TransferStatus::Paused => "paused",
            TransferStatus::WaitingAck => "waiting for ack",
            TransferStatus::Complete => "complete",
            TransferStatus::Failed => "failed",
        })
    }
}

/// Parameters for registering a new transfer.
#[derive(Debug, Clone)]
pub struct TransferSpec {
    /// Relative path as carried on the wire.
    pub path: String,
    /// Where the bytes are read from or written to.
    pub local_path: PathBuf,
    pub direction: Direction,
    pub total_bytes: u64,
    /// Key of the connection the transfer is bound to.
    pub connection_id: String,
}

/// Point-in-time view of a transfer for display and PROGRESS messages.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub id: TransferId,
    pub path: String,
    pub direction: Direction,
    pub status: TransferStatus,
    pub transferred: u64,
    pub total: u64,
    pub bytes_per_second: f64,
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    /// Completion percentage (0–100); an empty file counts as done.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.transferred as f64 * 100.0 / self.total as f64
        }
    }

    /// Speed in KB/s.
    pub fn speed_kbps(&self) -> f64 {
        self.bytes_per_second / 1024.0
    }

    /// Builds the PROGRESS payload for this snapshot.
    pub fn to_report(&self) -> ProgressReport {
        ProgressReport {
            path: self.path.clone(),
            bytes: self.transferred,
            total: self.total,
            speed_kbps: self.speed_kbps(),
        }
    }
}

/// One in-flight file, shared between its pump and control callers.
///
/// Status and counters sit behind a short-lived `RwLock`; the open file sits
/// in its own async slot so pause and cancel never wait on disk I/O to flip
/// status.
pub struct FileTransfer {
    id: TransferId,
    path: String,
    local_path: PathBuf,
    direction: Direction,
    connection_id: String,
    total_bytes: u64,
    inner: RwLock<TransferInner>,
    file: Mutex<FileSlot>,
}

/// The open file plus the SHA-256 of every byte written through it.
#[derive(Default)]
struct FileSlot {
    file: Option<File>,
    written: Sha256,
}

struct TransferInner {
    status: TransferStatus,
    transferred: u64,
    started_at: Instant,
    speed: SpeedEstimator,
    throttle: ProgressThrottle,
    checksum: Option<String>,
    error: Option<String>,
}

impl FileTransfer {
    /// Creates an InProgress transfer.
    pub fn new(id: TransferId, spec: TransferSpec) -> Self {
        let now = Instant::now();
        Self {
            id,
            path: spec.path,
            local_path: spec.local_path,
            direction: spec.direction,
            connection_id: spec.connection_id,
            total_bytes: spec.total_bytes,
            inner: RwLock::new(TransferInner {
                status: TransferStatus::InProgress,
                transferred: 0,
                started_at: now,
                speed: SpeedEstimator::new(SPEED_ALPHA, SPEED_MIN_WINDOW, now),
                throttle: ProgressThrottle::new(now),
                checksum: None,
                error: None,
            }),
            file: Mutex::new(FileSlot::default()),
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Relative path as carried on the wire.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.read().unwrap().status
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.inner.read().unwrap().transferred
    }

    /// Time since the transfer was registered.
    pub fn elapsed(&self) -> Duration {
        self.inner.read().unwrap().started_at.elapsed()
    }

    /// Failure reason, if the transfer failed.
    pub fn error(&self) -> Option<String> {
        self.inner.read().unwrap().error.clone()
    }

    /// Returns `true` while the transfer is InProgress, Paused or WaitingAck.
    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }

    /// Expected (receive) or computed (send) SHA-256, hex-encoded.
    pub fn checksum(&self) -> Option<String> {
        self.inner.read().unwrap().checksum.clone()
    }

    pub fn set_checksum(&self, checksum: Option<String>) {
        self.inner.write().unwrap().checksum = checksum;
    }

    /// Adds `bytes` to the counters; returns a snapshot when a report is due.
    pub fn record_progress(&self, bytes: u64) -> Option<ProgressSnapshot> {
        self.record_progress_at(bytes, Instant::now())
    }

    /// [`record_progress`](Self::record_progress) with an explicit clock.
    pub fn record_progress_at(&self, bytes: u64, now: Instant) -> Option<ProgressSnapshot> {
        let mut s = self.inner.write().unwrap();
        s.transferred += bytes;
        s.speed.record(bytes, now);
        let transferred = s.transferred;
        if s.throttle.should_emit(transferred, self.total_bytes, now) {
            Some(self.snapshot_locked(&s))
        } else {
            None
        }
    }

    /// Returns a snapshot of the current progress.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let s = self.inner.read().unwrap();
        self.snapshot_locked(&s)
    }

    fn snapshot_locked(&self, s: &TransferInner) -> ProgressSnapshot {
        ProgressSnapshot {
            id: self.id,
            path: self.path.clone(),
            direction: self.direction,
            status: s.status,
            transferred: s.transferred,
            total: self.total_bytes,
            bytes_per_second: s.speed.bytes_per_second(),
            eta: s
                .speed
                .eta(self.total_bytes.saturating_sub(s.transferred)),
        }
    }

    /// InProgress → Paused.
    pub fn pause(&self) -> Result<(), TransferError> {
        let mut s = self.inner.write().unwrap();
        match s.status {
            TransferStatus::InProgress => {
                s.status = TransferStatus::Paused;
                Ok(())
            }
            status => Err(TransferError::InvalidState {
                action: "pause",
                status,
            }),
        }
    }

    /// Paused → InProgress.
    pub fn resume(&self) -> Result<(), TransferError> {
        let mut s = self.inner.write().unwrap();
        match s.status {
            TransferStatus::Paused => {
                s.status = TransferStatus::InProgress;
                s.speed.restart_window(Instant::now());
                Ok(())
            }
            status => Err(TransferError::InvalidState {
                action: "resume",
                status,
            }),
        }
    }

    /// InProgress or Paused → WaitingAck, once every byte has been handed to
    /// the peer. A pause that lands after the last chunk has nothing left to
    /// hold back and is dropped.
    pub fn begin_ack_wait(&self) -> Result<(), TransferError> {
        let mut s = self.inner.write().unwrap();
        match s.status {
            TransferStatus::InProgress | TransferStatus::Paused => {
                s.status = TransferStatus::WaitingAck;
                Ok(())
            }
            status => Err(TransferError::InvalidState {
                action: "await the ack of",
                status,
            }),
        }
    }

    /// Marks the transfer complete. Returns `false` if it already finished.
    pub fn complete(&self) -> bool {
        let mut s = self.inner.write().unwrap();
        match s.status {
            TransferStatus::InProgress | TransferStatus::WaitingAck => {
                s.status = TransferStatus::Complete;
                true
            }
            _ => false,
        }
    }

    /// Marks the transfer failed. Returns `false` if it already finished.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let mut s = self.inner.write().unwrap();
        if s.status.is_terminal() {
            return false;
        }
        s.status = TransferStatus::Failed;
        s.error = Some(reason.into());
        true
    }

    /// Marks the transfer failed as cancelled; idempotent.
    pub fn cancel(&self) -> bool {
        self.fail("cancelled")
    }

    /// Blocks cooperatively while paused.
    ///
    /// Returns `true` once the transfer may continue, `false` if it was
    /// failed or cancelled meanwhile.
    pub async fn wait_while_paused(&self, poll: Duration) -> bool {
        loop {
            match self.status() {
                TransferStatus::Paused => tokio::time::sleep(poll).await,
                TransferStatus::InProgress | TransferStatus::WaitingAck => return true,
                TransferStatus::Complete | TransferStatus::Failed => return false,
            }
        }
    }

    // -- file slot ----------------------------------------------------------

    /// Hands the open file to the transfer.
    pub async fn attach_file(&self, file: File) {
        self.file.lock().await.file = Some(file);
    }

    /// Reads the next chunk. `Ok(None)` means the file was already closed.
    pub async fn read_chunk(&self, buf: &mut [u8]) -> Result<Option<usize>, TransferError> {
        let mut slot = self.file.lock().await;
        match slot.file.as_mut() {
            Some(file) => Ok(Some(file.read(buf).await?)),
            None => Ok(None),
        }
    }

    /// Appends a chunk and folds it into the running digest. Returns `false`
    /// if the file was already closed.
    pub async fn write_chunk(&self, data: &[u8]) -> Result<bool, TransferError> {
        let mut slot = self.file.lock().await;
        let FileSlot { file, written } = &mut *slot;
        match file.as_mut() {
            Some(file) => {
                file.write_all(data).await?;
                written.update(data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// SHA-256 hex digest of everything written so far.
    pub async fn written_checksum(&self) -> String {
        let digest = self.file.lock().await.written.clone().finalize();
        hex::encode(digest)
    }

    /// Flushes and closes the file.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub async fn close_file(&self) -> Result<bool, TransferError> {
        let taken = self.file.lock().await.file.take();
        match taken {
            Some(mut file) => {
                file.flush().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns `true` while a file handle is attached.
    pub async fn has_open_file(&self) -> bool {
        self.file.lock().await.file.is_some()
    }
}

impl fmt::Debug for FileTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileTransfer")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("direction", &self.direction)
            .field("status", &self.status())
            .field("transferred", &self.transferred_bytes())
            .field("total", &self.total_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn spec(direction: Direction, total: u64) -> TransferSpec {
        TransferSpec {
            path: "report.pdf".into(),
            local_path: PathBuf::from("/tmp/report.pdf"),
            direction,
            total_bytes: total,
            connection_id: "127.0.0.1:5000".into(),
        }
    }

    #[test]
    fn new_transfer_is_in_progress() {
        let t = FileTransfer::new(1, spec(Direction::Send, 10_000));
        assert_eq!(t.status(), TransferStatus::InProgress);
        assert!(t.is_active());
        assert_eq!(t.transferred_bytes(), 0);
        assert_eq!(t.snapshot().percent(), 0.0);
    }

    #[test]
    fn pause_only_from_in_progress() {
        let t = FileTransfer::new(1, spec(Direction::Send, 100));
        t.pause().unwrap();
        assert_eq!(t.status(), TransferStatus::Paused);
        assert!(matches!(
            t.pause(),
            Err(TransferError::InvalidState { action: "pause", .. })
        ));
        t.resume().unwrap();
        assert_eq!(t.status(), TransferStatus::InProgress);
        assert!(t.resume().is_err());
    }

    #[test]
    fn pause_resume_keeps_bytes_monotonic() {
        let t = FileTransfer::new(1, spec(Direction::Send, 1000));
        t.record_progress(300);
        let before = t.transferred_bytes();
        t.pause().unwrap();
        assert_eq!(t.transferred_bytes(), before);
        t.resume().unwrap();
        assert_eq!(t.transferred_bytes(), before);
        t.record_progress(200);
        assert_eq!(t.transferred_bytes(), 500);
    }

    #[test]
    fn completion_path_goes_through_waiting_ack() {
        let t = FileTransfer::new(1, spec(Direction::Send, 10));
        t.record_progress(10);
        t.begin_ack_wait().unwrap();
        assert_eq!(t.status(), TransferStatus::WaitingAck);
        assert!(t.is_active());
        assert!(t.complete());
        assert!(!t.complete());
        assert_eq!(t.status(), TransferStatus::Complete);
        assert!(!t.fail("late"));
        assert_eq!(t.status(), TransferStatus::Complete);
    }

    #[test]
    fn late_pause_does_not_block_ack_wait() {
        let t = FileTransfer::new(1, spec(Direction::Send, 10));
        t.record_progress(10);
        t.pause().unwrap();
        t.begin_ack_wait().unwrap();
        assert_eq!(t.status(), TransferStatus::WaitingAck);
        assert!(t.resume().is_err());
        assert!(t.complete());
    }

    #[test]
    fn ack_wait_refused_once_finished() {
        let t = FileTransfer::new(1, spec(Direction::Send, 10));
        t.cancel();
        assert!(matches!(
            t.begin_ack_wait(),
            Err(TransferError::InvalidState { status: TransferStatus::Failed, .. })
        ));
    }

    #[test]
    fn cancel_is_idempotent() {
        let t = FileTransfer::new(1, spec(Direction::Receive, 10));
        assert!(t.cancel());
        let first = (t.status(), t.error());
        assert!(!t.cancel());
        assert_eq!((t.status(), t.error()), first);
        assert_eq!(t.error().as_deref(), Some("cancelled"));
    }

    #[test]
    fn fail_from_paused() {
        let t = FileTransfer::new(1, spec(Direction::Send, 10));
        t.pause().unwrap();
        assert!(t.fail("disk full"));
        assert_eq!(t.status(), TransferStatus::Failed);
        assert_eq!(t.error().as_deref(), Some("disk full"));
    }

    #[test]
    fn record_progress_reports_final_chunk() {
        let t = FileTransfer::new(1, spec(Direction::Receive, 10_000));
        let snap = t.record_progress(10_000).expect("final chunk always reports");
        assert_eq!(snap.transferred, 10_000);
        assert_eq!(snap.percent(), 100.0);
        assert_eq!(snap.to_report().to_string().split('|').count(), 4);
    }

    #[test]
    fn empty_file_counts_as_done() {
        let t = FileTransfer::new(1, spec(Direction::Receive, 0));
        assert_eq!(t.snapshot().percent(), 100.0);
    }

    #[tokio::test]
    async fn file_slot_closes_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let t = FileTransfer::new(1, spec(Direction::Receive, 3));
        t.attach_file(File::create(&path).await.unwrap()).await;

        assert!(t.write_chunk(b"abc").await.unwrap());
        assert!(t.close_file().await.unwrap());
        assert!(!t.close_file().await.unwrap());
        assert!(!t.write_chunk(b"more").await.unwrap());
        assert!(!t.has_open_file().await);
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn written_checksum_tracks_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let t = FileTransfer::new(1, spec(Direction::Receive, 11));
        t.attach_file(File::create(&path).await.unwrap()).await;

        t.write_chunk(b"hello ").await.unwrap();
        t.write_chunk(b"world").await.unwrap();
        t.close_file().await.unwrap();
        // Bytes offered after close are not counted.
        t.write_chunk(b"!").await.unwrap();

        assert_eq!(t.written_checksum().await, crate::checksum_bytes(b"hello world"));
        assert_eq!(
            t.written_checksum().await,
            crate::calculate_file_checksum(&path).await.unwrap()
        );
    }

    #[tokio::test]
    async fn read_chunk_after_close_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"hello").unwrap();

        let t = FileTransfer::new(1, spec(Direction::Send, 5));
        t.attach_file(File::open(&path).await.unwrap()).await;
        let mut buf = [0u8; 16];
        assert_eq!(t.read_chunk(&mut buf).await.unwrap(), Some(5));
        assert_eq!(t.read_chunk(&mut buf).await.unwrap(), Some(0));
        t.close_file().await.unwrap();
        assert_eq!(t.read_chunk(&mut buf).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_while_paused_resumes() {
        let t = Arc::new(FileTransfer::new(1, spec(Direction::Send, 10)));
        t.pause().unwrap();

        let waiter = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.wait_while_paused(Duration::from_millis(500)).await })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!waiter.is_finished());
        t.resume().unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_while_paused_stops_on_cancel() {
        let t = Arc::new(FileTransfer::new(1, spec(Direction::Send, 10)));
        t.pause().unwrap();

        let waiter = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.wait_while_paused(Duration::from_millis(500)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        t.cancel();
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn concurrent_progress_updates() {
        use std::thread;

        let t = Arc::new(FileTransfer::new(1, spec(Direction::Receive, 100_000)));
        let mut handles = vec![];

        for _ in 0..10 {
            let t = Arc::clone(&t);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    t.record_progress(1);
                    let _ = t.snapshot();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(t.transferred_bytes(), 1000);
    }
}
