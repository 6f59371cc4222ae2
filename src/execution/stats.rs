use crate::prelude::*;

use std::sync::atomic::{AtomicI64, Ordering::Relaxed};

#[derive(Default, Serialize)]
pub struct Counter(pub AtomicI64);

impl Counter {
    pub fn inc(&self, by: i64) {
        self.0.fetch_add(by, Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Relaxed)
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Self(AtomicI64::new(self.get()))
    }
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get())
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Serialize, Default, Clone)]
pub struct ReconcileStats {
    pub num_observed: Counter,
    pub num_insertions: Counter,
    /// Known objects whose fingerprint changed; reset to pending.
    pub num_updates: Counter,
    pub num_no_change: Counter,
    /// Known objects an import left alone without comparing.
    pub num_skipped: Counter,
    /// Import lines that could not be parsed.
    pub num_malformed: Counter,
}

impl ReconcileStats {
    pub fn num_mutations(&self) -> i64 {
        self.num_insertions.get() + self.num_updates.get()
    }
}

impl std::fmt::Display for ReconcileStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} objects observed", self.num_observed)?;
        let mut details = Vec::new();
        for (count, label) in [
            (&self.num_insertions, "ADDED"),
            (&self.num_updates, "CHANGED"),
            (&self.num_no_change, "NO CHANGE"),
            (&self.num_skipped, "ALREADY KNOWN"),
            (&self.num_malformed, "MALFORMED"),
        ] {
            if count.get() > 0 {
                details.push(format!("{count} {label}"));
            }
        }
        if !details.is_empty() {
            write!(f, " ({})", details.join(", "))?;
        }
        Ok(())
    }
}

/// Live counters of one copy run, shared by all workers.
#[derive(Debug, Serialize, Default, Clone)]
pub struct CopyStats {
    pub num_completed: Counter,
    pub num_exists: Counter,
    pub num_errors: Counter,
    /// Entries given back to `pending` because the run was cancelled.
    pub num_cancelled: Counter,
    /// Entries another claimant got to first.
    pub num_claim_lost: Counter,
    pub num_in_process: Counter,
    pub bytes_copied: Counter,
}

impl CopyStats {
    pub fn num_finished(&self) -> i64 {
        self.num_completed.get() + self.num_exists.get() + self.num_errors.get()
    }

    pub fn start_processing(&self) {
        self.num_in_process.inc(1);
    }

    pub fn finish_processing(&self) {
        self.num_in_process.inc(-1);
    }
}

impl std::fmt::Display for CopyStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut messages = Vec::new();
        let num_errors = self.num_errors.get();
        if num_errors > 0 {
            messages.push(format!("{num_errors} objects FAILED"));
        }
        let num_completed = self.num_completed.get();
        if num_completed > 0 {
            messages.push(format!(
                "{num_completed} objects COPIED ({} bytes)",
                self.bytes_copied
            ));
        }
        let num_exists = self.num_exists.get();
        if num_exists > 0 {
            messages.push(format!("{num_exists} objects ALREADY AT DESTINATION"));
        }
        let num_cancelled = self.num_cancelled.get();
        if num_cancelled > 0 {
            messages.push(format!("{num_cancelled} objects CANCELLED"));
        }
        let num_in_process = self.num_in_process.get();
        if num_in_process > 0 {
            messages.push(format!("{num_in_process} objects IN PROCESS"));
        }

        if messages.is_empty() {
            write!(f, "Nothing to copy")
        } else {
            write!(f, "{}", messages.join("; "))
        }
    }
}
