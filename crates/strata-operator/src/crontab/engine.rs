//! In-memory cron engine
//!
//! Each installed entry is one tokio task that sleeps until the trigger's
//! next occurrence and fires the job on a task of its own, so removing an
//! entry never cancels a job that is already running. The entry table is a
//! plain mutex held only for inserts and removals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{Job, SchedulerError, Trigger};

type EntryTable = Arc<Mutex<HashMap<i64, Entry>>>;

struct Entry {
    trigger: Trigger,
    task: JoinHandle<()>,
}

enum Schedule {
    Cron(Cron),
    At(DateTime<Utc>),
}

impl Schedule {
    fn parse(trigger: &Trigger) -> Result<Self, SchedulerError> {
        match trigger {
            Trigger::Cron(expression) => parse_cron(expression).map(Self::Cron),
            Trigger::At(at) => Ok(Self::At(*at)),
        }
    }

    fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(cron) => cron.find_next_occurrence(&now, false).ok(),
            Self::At(at) => Some(*at),
        }
    }

    fn is_one_shot(&self) -> bool {
        matches!(self, Self::At(_))
    }
}

/// Parse a 5-field cron expression
pub(crate) fn parse_cron(expression: &str) -> Result<Cron, SchedulerError> {
    Cron::new(expression)
        .parse()
        .map_err(|e| SchedulerError::InvalidSchedule {
            expression: expression.to_string(),
            message: e.to_string(),
        })
}

fn lock(table: &Mutex<HashMap<i64, Entry>>) -> MutexGuard<'_, HashMap<i64, Entry>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Table of running cron entries keyed by engine-assigned ids
pub struct CronEngine {
    next_id: AtomicI64,
    entries: EntryTable,
}

impl Default for CronEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CronEngine {
    /// Create an empty engine; ids start at 1
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Install a job under a trigger and return its entry id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add(&self, trigger: Trigger, job: Job) -> Result<i64, SchedulerError> {
        let schedule = Schedule::parse(&trigger)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        // the lock is held across spawn so a one-shot that fires at once
        // cannot try to remove itself before it is inserted
        let mut entries = lock(&self.entries);
        let task = tokio::spawn(run_entry(id, schedule, job, Arc::clone(&self.entries)));
        entries.insert(id, Entry { trigger, task });
        debug!(entry_id = id, "cron entry installed");
        Ok(id)
    }

    /// Remove an entry, returning whether it existed
    pub fn remove(&self, id: i64) -> bool {
        let removed = lock(&self.entries).remove(&id);
        match removed {
            Some(entry) => {
                entry.task.abort();
                debug!(entry_id = id, "cron entry removed");
                true
            }
            None => false,
        }
    }

    /// Whether an entry is installed
    pub fn contains(&self, id: i64) -> bool {
        lock(&self.entries).contains_key(&id)
    }

    /// Trigger an entry was installed with
    pub fn trigger(&self, id: i64) -> Option<Trigger> {
        lock(&self.entries).get(&id).map(|e| e.trigger.clone())
    }

    /// Number of installed entries
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether no entries are installed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for CronEngine {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.entries).drain() {
            entry.task.abort();
        }
    }
}

async fn run_entry(id: i64, schedule: Schedule, job: Job, entries: EntryTable) {
    loop {
        let now = Utc::now();
        let Some(next) = schedule.next_after(now) else {
            break;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        trace!(entry_id = id, ?wait, "cron entry sleeping");
        tokio::time::sleep(wait).await;

        debug!(entry_id = id, "cron entry firing");
        tokio::spawn(job());

        if schedule.is_one_shot() {
            break;
        }
    }
    lock(&entries).remove(&id);
}
