//! Folder-level wait queue.
//!
//! Contenders register a ticket file under `<folder>/.queue/` and poll until
//! their ticket is the oldest surviving one. A ticket declares how long its
//! owner may take; once that time is exceeded any other poller evicts it, so a
//! crashed or hung holder cannot block the folder forever.
//!
//! Ticket registration and state transitions run under a short guard lock on
//! `<folder>/.queue/.lock`, which makes the sequence numbers a total order.
//! The guard is never held while the queued action runs.

use super::FileLock;
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Name of the queue folder inside a queued schema folder.
pub const QUEUE_FOLDER: &str = ".queue";

const GUARD_FILE: &str = ".lock";

/// Source of wall-clock time for ticket deadlines.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// One registered contender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub seq: u64,
    pub owner: String,
    pub registered_at: DateTime<Utc>,
    pub max_execution_ms: u64,
}

impl Ticket {
    pub fn deadline(&self) -> DateTime<Utc> {
        let max = i64::try_from(self.max_execution_ms).unwrap_or(i64::MAX);
        self.registered_at + chrono::Duration::milliseconds(max)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline()
    }

    fn file_name(&self) -> String {
        ticket_file_name(self.seq)
    }
}

fn ticket_file_name(seq: u64) -> String {
    format!("{seq:020}")
}

/// Where a ticket stands after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    /// Older tickets are still queued
    Waiting,
    /// Oldest surviving ticket: the owner has the folder
    Holding,
    /// The ticket outlived its declared max time and was removed
    Evicted,
}

pub struct TicketQueue<'a> {
    dir: PathBuf,
    clock: &'a dyn Clock,
    guard_timeout: Duration,
    poll: Duration,
}

impl<'a> TicketQueue<'a> {
    /// Queue for `folder`; its tickets live in `folder/.queue`.
    pub fn new(folder: &Path, clock: &'a dyn Clock, guard_timeout: Duration, poll: Duration) -> Self {
        TicketQueue {
            dir: folder.join(QUEUE_FOLDER),
            clock,
            guard_timeout,
            poll,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn guard(&self) -> Result<FileLock> {
        std::fs::create_dir_all(&self.dir)?;
        FileLock::acquire(&self.dir.join(GUARD_FILE), self.guard_timeout, self.poll)
    }

    /// Queued tickets in sequence order. Unreadable ticket files are dropped.
    fn tickets(&self) -> Result<Vec<Ticket>> {
        let mut tickets = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let parsed = std::fs::read(entry.path())
                .map_err(StoreError::from)
                .and_then(|bytes| serde_json::from_slice::<Ticket>(&bytes).map_err(StoreError::from));
            match parsed {
                Ok(ticket) => tickets.push(ticket),
                Err(e) => {
                    log::warn!("Dropping unreadable queue ticket {}: {e}", entry.path().display());
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        tickets.sort_by_key(|t| t.seq);
        Ok(tickets)
    }

    /// Append a ticket behind every ticket currently queued.
    pub fn register(&self, owner: &str, max_execution: Duration) -> Result<Ticket> {
        let _guard = self.guard()?;
        let seq = self.tickets()?.last().map(|t| t.seq + 1).unwrap_or(1);
        let ticket = Ticket {
            seq,
            owner: owner.to_string(),
            registered_at: self.clock.now(),
            max_execution_ms: u64::try_from(max_execution.as_millis()).unwrap_or(u64::MAX),
        };
        std::fs::write(self.dir.join(ticket.file_name()), serde_json::to_vec(&ticket)?)?;
        Ok(ticket)
    }

    /// Advance the ticket's state machine: evict expired tickets, then
    /// report whether `ticket` is the oldest survivor.
    pub fn poll(&self, ticket: &Ticket) -> Result<TicketState> {
        let _guard = self.guard()?;
        let now = self.clock.now();
        let mut mine_present = false;
        let mut oldest: Option<u64> = None;

        for queued in self.tickets()? {
            if queued.is_expired(now) {
                if queued.seq == ticket.seq {
                    log::warn!("Queue ticket {} of {} exceeded its max execution time", queued.seq, queued.owner);
                } else {
                    log::warn!(
                        "Evicting queue ticket {} of {} in {}",
                        queued.seq,
                        queued.owner,
                        self.dir.display()
                    );
                }
                let _ = std::fs::remove_file(self.dir.join(queued.file_name()));
                continue;
            }
            if queued.seq == ticket.seq && queued.owner == ticket.owner {
                mine_present = true;
            }
            oldest = Some(oldest.map_or(queued.seq, |o| o.min(queued.seq)));
        }

        Ok(if !mine_present {
            TicketState::Evicted
        } else if oldest == Some(ticket.seq) {
            TicketState::Holding
        } else {
            TicketState::Waiting
        })
    }

    /// Remove the ticket if it is still queued.
    pub fn release(&self, ticket: &Ticket) -> Result<()> {
        let _guard = self.guard()?;
        let path = self.dir.join(ticket.file_name());
        if let Ok(bytes) = std::fs::read(&path) {
            if let Ok(queued) = serde_json::from_slice::<Ticket>(&bytes) {
                if queued.owner == ticket.owner {
                    std::fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    /// Register and block until the ticket holds the folder.
    pub fn wait(&self, owner: &str, max_execution: Duration) -> Result<QueueHold<'_, 'a>> {
        let started = Instant::now();
        let ticket = self.register(owner, max_execution)?;

        loop {
            match self.poll(&ticket)? {
                TicketState::Holding => return Ok(QueueHold { queue: self, ticket }),
                TicketState::Waiting => std::thread::sleep(self.poll),
                TicketState::Evicted => {
                    return Err(StoreError::LockTimeout {
                        path: self.dir.clone(),
                        waited: started.elapsed(),
                    })
                }
            }
        }
    }
}

/// A held queue position; the ticket is released on drop.
pub struct QueueHold<'q, 'a> {
    queue: &'q TicketQueue<'a>,
    ticket: Ticket,
}

impl QueueHold<'_, '_> {
    pub fn ticket(&self) -> &Ticket {
        &self.ticket
    }
}

impl Drop for QueueHold<'_, '_> {
    fn drop(&mut self) {
        if let Err(e) = self.queue.release(&self.ticket) {
            log::warn!("Failed to release queue ticket {}: {e}", self.ticket.seq);
        }
    }
}
