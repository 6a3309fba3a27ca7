//! Node-wide table of connections and transfers.
//!
//! One lock covers both maps so admission checks and inserts are atomic.
//! When a transfer's own state is needed too, this lock is taken first.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use lanshare_transfer::{Direction, FileTransfer, TransferId, TransferSpec, TransferStatus};

use crate::connection::Connection;
use crate::error::PeerError;

#[derive(Default)]
struct RegistryInner {
    connections: BTreeMap<String, Arc<Connection>>,
    transfers: BTreeMap<TransferId, Arc<FileTransfer>>,
    /// Receive currently fed by each connection's FILEDATA stream.
    receiving: HashMap<String, TransferId>,
    last_id: TransferId,
}

pub struct Registry {
    inner: Mutex<RegistryInner>,
    max_active: usize,
}

impl Registry {
    /// Creates a registry admitting at most `max_active` InProgress transfers.
    pub fn new(max_active: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_active,
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    // -- connections ------------------------------------------------------

    pub fn add_connection(&self, conn: Arc<Connection>) {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.insert(conn.id().to_string(), conn);
    }

    pub fn remove_connection(&self, id: &str) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock().unwrap();
        inner.receiving.remove(id);
        inner.connections.remove(id)
    }

    pub fn connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.inner.lock().unwrap().connections.get(id).cloned()
    }

    /// The connection user commands go to: the first in address order.
    pub fn primary_connection(&self) -> Option<Arc<Connection>> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .values()
            .next()
            .cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .values()
            .cloned()
            .collect()
    }

    // -- transfers --------------------------------------------------------

    /// Registers a transfer without an admission check.
    pub fn add_transfer(&self, spec: TransferSpec) -> Arc<FileTransfer> {
        let mut inner = self.inner.lock().unwrap();
        Self::insert(&mut inner, spec)
    }

    /// Registers a transfer if fewer than the cap are InProgress.
    pub fn try_add_transfer(&self, spec: TransferSpec) -> Result<Arc<FileTransfer>, PeerError> {
        let mut inner = self.inner.lock().unwrap();
        if Self::count_in_progress(&inner) >= self.max_active {
            return Err(PeerError::TooManyTransfers(self.max_active));
        }
        Ok(Self::insert(&mut inner, spec))
    }

    fn insert(inner: &mut RegistryInner, spec: TransferSpec) -> Arc<FileTransfer> {
        inner.last_id += 1;
        let id = inner.last_id;
        if spec.direction == Direction::Receive {
            inner.receiving.insert(spec.connection_id.clone(), id);
        }
        let transfer = Arc::new(FileTransfer::new(id, spec));
        inner.transfers.insert(id, Arc::clone(&transfer));
        transfer
    }

    pub fn remove_transfer(&self, id: TransferId) -> Option<Arc<FileTransfer>> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.transfers.remove(&id)?;
        if inner.receiving.get(removed.connection_id()) == Some(&id) {
            inner.receiving.remove(removed.connection_id());
        }
        Some(removed)
    }

    pub fn transfer(&self, id: TransferId) -> Option<Arc<FileTransfer>> {
        self.inner.lock().unwrap().transfers.get(&id).cloned()
    }

    /// All registered transfers in id order.
    pub fn transfers(&self) -> Vec<Arc<FileTransfer>> {
        self.inner
            .lock()
            .unwrap()
            .transfers
            .values()
            .cloned()
            .collect()
    }

    /// The receive currently fed by `conn_id`.
    pub fn current_receive(&self, conn_id: &str) -> Option<Arc<FileTransfer>> {
        let inner = self.inner.lock().unwrap();
        let id = inner.receiving.get(conn_id)?;
        inner.transfers.get(id).cloned()
    }

    /// Latest transfer on `conn_id` for `path` in `direction`.
    pub fn find_transfer(
        &self,
        conn_id: &str,
        path: &str,
        direction: Direction,
    ) -> Option<Arc<FileTransfer>> {
        self.inner
            .lock()
            .unwrap()
            .transfers
            .values()
            .rev()
            .find(|t| t.connection_id() == conn_id && t.path() == path && t.direction() == direction)
            .cloned()
    }

    pub fn transfers_for_connection(&self, conn_id: &str) -> Vec<Arc<FileTransfer>> {
        self.inner
            .lock()
            .unwrap()
            .transfers
            .values()
            .filter(|t| t.connection_id() == conn_id)
            .cloned()
            .collect()
    }

    fn count_in_progress(inner: &RegistryInner) -> usize {
        inner
            .transfers
            .values()
            .filter(|t| t.status() == TransferStatus::InProgress)
            .count()
    }

    /// Number of InProgress transfers.
    pub fn in_progress_count(&self) -> usize {
        Self::count_in_progress(&self.inner.lock().unwrap())
    }

    /// Whether one more transfer would be admitted right now.
    pub fn can_start_transfer(&self) -> bool {
        self.in_progress_count() < self.max_active
    }

    /// Whether any transfer is InProgress, Paused or WaitingAck.
    pub fn is_any_transfer_active(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .transfers
            .values()
            .any(|t| t.is_active())
    }
}
