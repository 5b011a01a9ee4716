// Session - per-store identity and deferred cleanup ("trash")

use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// A non-critical cleanup action postponed until the session ends.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Deferred {
    /// Remove a lock sidecar file, unless someone holds it right now
    RemoveLockFile(PathBuf),
}

/// Trash size at which idle entries are cleared without waiting for the end
/// of the session.
pub const TRASH_LIMIT: usize = 256;

/// Identity of one store instance plus its trash list.
///
/// The trash is flushed when the session is dropped, so no lock-file residue
/// outlives the instance even if an operation failed halfway.
pub struct Session {
    id: String,
    trash: Mutex<BTreeSet<Deferred>>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            id: uuid::Uuid::new_v4().to_string(),
            trash: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identity of the calling thread within this session, used as queue
    /// ticket owner.
    pub fn owner(&self) -> String {
        format!("{}:{:?}", self.id, std::thread::current().id())
    }

    pub fn defer(&self, action: Deferred) {
        let mut trash = self.trash.lock();
        trash.insert(action);
        if trash.len() < TRASH_LIMIT {
            return;
        }
        let actions = std::mem::take(&mut *trash);
        drop(trash);

        let busy: Vec<Deferred> = actions.into_iter().filter(|action| !settle(action)).collect();
        log::debug!("Trimmed trash of session {} ({} actions still busy)", self.id, busy.len());
        self.trash.lock().extend(busy);
    }

    pub fn pending(&self) -> usize {
        self.trash.lock().len()
    }

    /// Run and clear every deferred action.
    pub fn flush(&self) {
        let actions = std::mem::take(&mut *self.trash.lock());
        if actions.is_empty() {
            return;
        }
        log::debug!("Emptying trash of session {} ({} actions)", self.id, actions.len());
        for action in actions {
            settle(&action);
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Run one action; false when it has to wait because the file is in use.
fn settle(action: &Deferred) -> bool {
    match action {
        Deferred::RemoveLockFile(path) => remove_idle_lock_file(path),
    }
}

/// Remove a lock file only if nobody holds it; a contended file is left for
/// its holder's own session to clean up.
fn remove_idle_lock_file(path: &Path) -> bool {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(_) => return true,
    };
    if file.try_lock_exclusive().is_err() {
        return false;
    }
    if let Err(e) = std::fs::remove_file(path) {
        log::debug!("Could not remove lock file {}: {e}", path.display());
    }
    let _ = FileExt::unlock(&file);
    true
}
