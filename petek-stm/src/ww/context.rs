//! The wound-wait transaction engine.

use core::sync::atomic::Ordering;

use petek::Guard;

use crate::clock;
use crate::errors::{ConflictKind, StmError, StmResult};
use crate::ww::descriptor::{descriptor_deleter, TxDescriptor};
use crate::ww::status::TxStatus;
use crate::ww::var::{TMVar, TryWrite, VarOps};

struct ReadLogEntry {
    var: *const (),
    ops: VarOps,
    read_ts: u64,
}

struct WriteLogEntry {
    var: *const (),
    ops: VarOps,
    record: *mut (),
}

/// Per-thread wound-wait transaction context.
///
/// The context is long-lived and reused; each `begin` pins the thread,
/// clears the logs and mints a fresh descriptor. The descriptor, not the
/// context, is what other transactions see and wound.
pub struct TxContext {
    guard: Option<Guard>,
    desc: *mut TxDescriptor,
    start_ts: u64,
    active: bool,
    read_set: Vec<ReadLogEntry>,
    write_set: Vec<WriteLogEntry>,
}

impl TxContext {
    pub(crate) fn new() -> Self {
        Self {
            guard: None,
            desc: core::ptr::null_mut(),
            start_ts: 0,
            active: false,
            read_set: Vec::new(),
            write_set: Vec::new(),
        }
    }

    pub(crate) fn begin(&mut self) {
        // A previous attempt that unwound mid-flight left its records
        // installed; release them before starting over.
        if !self.desc.is_null() {
            self.abort();
        }
        self.guard = Some(petek::pin());
        self.read_set.clear();
        self.write_set.clear();
        self.start_ts = clock::now();
        self.desc = TxDescriptor::boxed(self.start_ts);
        self.active = true;
    }

    /// Still runnable? Flips `active` off when a wounder got us.
    fn ensure_active(&mut self) -> bool {
        if self.desc.is_null() || !self.active {
            return false;
        }
        // SAFETY: `desc` is ours and alive until cleanup retires it.
        if unsafe { &*self.desc }.status.load(Ordering::Acquire) == TxStatus::Aborted {
            self.active = false;
        }
        self.active
    }

    fn guard(&self) -> &Guard {
        self.guard.as_ref().expect("operation outside a transaction")
    }

    /// Read a variable.
    ///
    /// First read of a variable is double-checked against its data version
    /// and logged; repeated reads go straight through the proxy (which also
    /// serves read-your-own-writes).
    pub fn load<T>(&mut self, var: &TMVar<T>) -> StmResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        if !self.ensure_active() {
            return Err(StmError::Conflict(ConflictKind::Wounded));
        }
        let addr = var as *const TMVar<T> as *const ();

        if self.read_set.iter().any(|entry| entry.var == addr) {
            return Ok(var.read_proxy(self.desc, self.guard()));
        }

        let (pre, value, post) = {
            let guard = self.guard();
            let pre = var.data_version(guard);
            let value = var.read_proxy(self.desc, guard);
            let post = var.data_version(guard);
            (pre, value, post)
        };

        if pre != post {
            // A commit landed mid-read; the snapshot is torn.
            self.abort();
            return Err(StmError::Conflict(ConflictKind::Stale));
        }

        self.read_set.push(ReadLogEntry {
            var: addr,
            ops: TMVar::<T>::OPS,
            read_ts: pre,
        });
        Ok(value)
    }

    /// Write a variable, resolving ownership conflicts by wound-wait.
    pub fn store<T>(&mut self, var: &TMVar<T>, value: T) -> StmResult<()>
    where
        T: Send + Sync + 'static,
    {
        if !self.ensure_active() {
            return Err(StmError::Conflict(ConflictKind::Wounded));
        }
        let addr = var as *const TMVar<T> as *const ();
        let reentrant = self.write_set.iter().any(|entry| entry.var == addr);
        let mut value = value;

        loop {
            // SAFETY: `desc` is live and we are pinned through `self.guard`.
            let outcome = unsafe { var.try_write(self.desc, value, self.guard()) };

            match outcome {
                TryWrite::Installed(record) => {
                    if reentrant {
                        // Keep the log entry pointing at the live record; it
                        // can have been replaced if the original was stolen
                        // while we were being wounded.
                        if let Some(entry) =
                            self.write_set.iter_mut().find(|entry| entry.var == addr)
                        {
                            entry.record = record as *mut ();
                        }
                        return Ok(());
                    }

                    // Write-after-read guard: holding the cell proves
                    // nothing about the version we read earlier. If it
                    // moved, release immediately and abort rather than
                    // commit a lost update.
                    if let Some(read_ts) = self
                        .read_set
                        .iter()
                        .find(|entry| entry.var == addr)
                        .map(|entry| entry.read_ts)
                    {
                        if var.data_version(self.guard()) != read_ts {
                            unsafe { var.abort_restore(record, self.guard()) };
                            self.abort();
                            return Err(StmError::Conflict(ConflictKind::Stale));
                        }
                    }

                    self.write_set.push(WriteLogEntry {
                        var: addr,
                        ops: TMVar::<T>::OPS,
                        record: record as *mut (),
                    });
                    return Ok(());
                }
                TryWrite::Owned { owner, value: returned } => {
                    value = returned;
                    self.resolve_conflict(owner);
                    if !self.ensure_active() {
                        self.abort();
                        return Err(StmError::Conflict(ConflictKind::Wounded));
                    }
                    std::thread::yield_now();
                }
                TryWrite::Stolen => {
                    self.abort();
                    return Err(StmError::Conflict(ConflictKind::Wounded));
                }
            }
        }
    }

    /// Wound-wait: the older transaction wounds the younger; the younger
    /// self-aborts. Ties in `start_ts` break by descriptor address, so the
    /// order is total and no pair can wound each other.
    fn resolve_conflict(&mut self, enemy: *const TxDescriptor) {
        // SAFETY: descriptors are retired through EBR; our pin keeps the
        // enemy's alive even if it finishes concurrently.
        let enemy_ref = unsafe { &*enemy };
        match enemy_ref.status.load(Ordering::Acquire) {
            // Already terminal: the retry loop can steal or wait it out.
            TxStatus::Aborted | TxStatus::Committed => {}
            TxStatus::Active => {
                let my_ts = self.start_ts;
                let enemy_ts = enemy_ref.start_ts;
                let i_am_older = my_ts < enemy_ts
                    || (my_ts == enemy_ts && (self.desc as usize) < (enemy as usize));
                if i_am_older {
                    // Wound. If the CAS loses, the enemy just committed or
                    // aborted on its own; either way the cell resolves.
                    enemy_ref.status.try_abort();
                } else {
                    self.abort();
                }
            }
        }
    }

    /// Commit: validate reads, then linearize on the status CAS.
    pub(crate) fn commit(&mut self) -> bool {
        if !self.ensure_active() {
            self.abort();
            return false;
        }

        if !self.validate_read_set() {
            self.abort();
            return false;
        }

        if self.write_set.is_empty() {
            // Read-only: linearized at begin, nothing to publish.
            self.cleanup();
            return true;
        }

        // SAFETY: `desc` is live until cleanup.
        if !unsafe { &*self.desc }.status.try_commit() {
            // A wounder won the race (B3): our commit loses.
            self.abort();
            return false;
        }

        let wv = clock::tick();
        for entry in &self.write_set {
            // SAFETY: each entry was created by the typed `store` for its
            // variable; commit_release is safe now that we are Committed.
            unsafe { (entry.ops.commit)(entry.var, entry.record, wv) };
        }

        self.cleanup();
        true
    }

    /// Abort: idempotent; releases held records in reverse order.
    pub(crate) fn abort(&mut self) {
        if self.desc.is_null() {
            return;
        }
        // SAFETY: `desc` is live until cleanup.
        unsafe { &*self.desc }.status.try_abort();
        self.active = false;

        for entry in self.write_set.iter().rev() {
            // SAFETY: entries are well-typed; abort_restore tolerates
            // records that were already stolen.
            unsafe { (entry.ops.abort)(entry.var, entry.record) };
        }
        self.cleanup();
    }

    fn validate_read_set(&self) -> bool {
        for entry in &self.read_set {
            // A variable we hold cannot have moved under us.
            if self.write_set.iter().any(|w| w.var == entry.var) {
                continue;
            }
            // SAFETY: entry is well-typed for its variable.
            let current = unsafe { (entry.ops.data_version)(entry.var) };
            if current != entry.read_ts {
                return false;
            }
        }
        true
    }

    fn cleanup(&mut self) {
        self.read_set.clear();
        self.write_set.clear();
        self.active = false;
        if !self.desc.is_null() {
            // A concurrent transaction may still reach the descriptor
            // through a record it loaded before we released; EBR gates the
            // free.
            unsafe { petek::retire(self.desc as *mut (), descriptor_deleter) };
            self.desc = core::ptr::null_mut();
        }
        // Leave the epoch.
        self.guard = None;
    }
}
