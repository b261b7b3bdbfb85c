//! Durable validation queue.
//!
//! A ticket file exists on disk for every admitted artifact until its
//! validation reaches a terminal state, so work survives restarts. The
//! in-process channel only carries wakeups for tickets already on disk.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::error::{PushError, Result};
use crate::identity::PackageIdentity;
use crate::store::sha256_hex;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub identity: PackageIdentity,
    pub enqueued_at: DateTime<Utc>,
}

impl Ticket {
    pub fn new(identity: PackageIdentity) -> Self {
        Self {
            identity,
            enqueued_at: Utc::now(),
        }
    }
}

pub struct WorkQueue {
    dir: PathBuf,
    tx: mpsc::UnboundedSender<Ticket>,
    rx: Mutex<mpsc::UnboundedReceiver<Ticket>>,
    /// Keys dispatched in this process and not yet finished
    queued: DashMap<String, ()>,
    outstanding: AtomicUsize,
    idle: Notify,
}

impl WorkQueue {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            dir,
            tx,
            rx: Mutex::new(rx),
            queued: DashMap::new(),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    fn ticket_path(&self, identity: &PackageIdentity) -> PathBuf {
        self.dir.join(format!("{}.json", sha256_hex(identity.key().as_bytes())))
    }

    /// Persist a ticket, then dispatch it. Returns `false` if the identity
    /// is already queued.
    pub async fn enqueue(&self, ticket: Ticket) -> Result<bool> {
        let path = self.ticket_path(&ticket.identity);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&serde_json::to_vec_pretty(&ticket)?).await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp, &path).await?;
        Ok(self.dispatch(ticket))
    }

    /// Hand a ticket to the workers without touching disk.
    pub(crate) fn dispatch(&self, ticket: Ticket) -> bool {
        if self.queued.insert(ticket.identity.key(), ()).is_some() {
            return false;
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(ticket).is_err() {
            // Receiver lives as long as the queue; unreachable in practice.
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Tickets persisted by a previous process.
    pub async fn persisted(&self) -> Result<Vec<Ticket>> {
        let mut tickets = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Ticket>(&bytes) {
                    Ok(ticket) => tickets.push(ticket),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable ticket"),
                },
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tickets.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(tickets)
    }

    /// Re-dispatch every persisted ticket. Returns how many were dispatched.
    pub async fn recover(&self) -> Result<usize> {
        let mut dispatched = 0;
        for ticket in self.persisted().await? {
            if self.dispatch(ticket) {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    pub fn has_ticket(&self, identity: &PackageIdentity) -> bool {
        self.ticket_path(identity).exists()
    }

    /// Next ticket; `None` once the queue is closed.
    pub async fn next(&self) -> Option<Ticket> {
        self.rx.lock().await.recv().await
    }

    /// Finish a ticket. With `durable` the ticket file is deleted; otherwise
    /// it stays on disk and is picked up again on the next start.
    pub async fn finish(&self, ticket: &Ticket, durable: bool) -> Result<()> {
        let result = if durable {
            match fs::remove_file(self.ticket_path(&ticket.identity)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(PushError::from(e)),
            }
        } else {
            Ok(())
        };

        self.queued.remove(&ticket.identity.key());
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
        result
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Resolve once nothing is queued or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}
