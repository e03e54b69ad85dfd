//! Mailbox autoscan
//!
//! Each mailbox with a non-zero scan interval gets one background process
//! that scans it on a fixed cadence. After each scan the process sleeps one
//! full interval, measured from the moment the scan returned. Interval
//! changes take effect mid-sleep: the sleeper wakes, recomputes the time
//! remaining until sleep-start plus the new interval and goes back to
//! sleep, so repeated edits never compound. A manual trigger runs a scan immediately and restarts the cadence
//! from that scan; triggers arriving while a scan is already running are
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::data::get_autoscan_mailboxes;
use crate::network::ScanOutcome;
use crate::protocol::error::ProtocolError;
use crate::protocol::types::Key;

/// Performs one scan of one mailbox
#[async_trait]
pub trait MailboxScanner: Send + Sync {
    async fn scan(&self, mailbox_key: &Key) -> Result<ScanOutcome, ProtocolError>;
}

struct Shared {
    interval_secs: AtomicU64,
    running: AtomicBool,
    /// True only while the process sits in its sleep, not while scanning.
    /// Triggers are honored only in that window.
    sleeping: AtomicBool,
    scan_now: AtomicBool,
    wake: Notify,
}

/// One running autoscan loop for one mailbox
pub struct AutoscanProcess {
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl AutoscanProcess {
    /// Spawn the scan loop. The first scan runs immediately.
    pub fn spawn(
        mailbox_key: Key,
        interval_secs: u64,
        scanner: Arc<dyn MailboxScanner>,
    ) -> AutoscanProcess {
        let shared = Arc::new(Shared {
            interval_secs: AtomicU64::new(interval_secs),
            running: AtomicBool::new(true),
            sleeping: AtomicBool::new(false),
            scan_now: AtomicBool::new(false),
            wake: Notify::new(),
        });

        let handle = {
            let shared = shared.clone();
            tokio::spawn(async move {
                scan_loop(mailbox_key, shared, scanner).await;
            })
        };

        AutoscanProcess { shared, handle }
    }

    /// Change the interval; takes effect on the current sleep. Zero stops
    /// the process.
    pub fn set_interval(&self, interval_secs: u64) {
        self.shared
            .interval_secs
            .store(interval_secs, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Run a scan now if the process is between scans; dropped while a
    /// scan is already running
    pub fn trigger_now(&self) {
        if self.shared.sleeping.load(Ordering::SeqCst) {
            self.shared.scan_now.store(true, Ordering::SeqCst);
            self.shared.wake.notify_one();
        }
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn scan_loop(mailbox_key: Key, shared: Arc<Shared>, scanner: Arc<dyn MailboxScanner>) {
    loop {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        match scanner.scan(&mailbox_key).await {
            Ok(outcome) => {
                info!(
                    mailbox_key = %hex::encode(mailbox_key),
                    new = outcome.new_count,
                    old = outcome.old_count,
                    err = outcome.err_count,
                    "mailbox scan finished"
                );
            }
            Err(e) => {
                error!(
                    mailbox_key = %hex::encode(mailbox_key),
                    error = %e,
                    "mailbox scan failed"
                );
            }
        }

        // Sleep one full interval from here, re-reading the interval on
        // every wakeup so changes rebase against this sleep's start
        let sleep_start = Instant::now();
        loop {
            if !shared.running.load(Ordering::SeqCst) {
                return;
            }
            let interval = shared.interval_secs.load(Ordering::SeqCst);
            if interval == 0 {
                debug!(
                    mailbox_key = %hex::encode(mailbox_key),
                    "autoscan interval cleared, stopping"
                );
                return;
            }
            let time_left = Duration::from_secs(interval).saturating_sub(sleep_start.elapsed());
            if time_left.is_zero() {
                break;
            }

            shared.sleeping.store(true, Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(time_left) => {}
                _ = shared.wake.notified() => {}
            }
            shared.sleeping.store(false, Ordering::SeqCst);

            if shared.scan_now.swap(false, Ordering::SeqCst) {
                break;
            }
        }
    }
}

/// All autoscan processes of a node, keyed by mailbox
pub struct AutoscanManager {
    scanner: Arc<dyn MailboxScanner>,
    processes: Mutex<HashMap<Key, AutoscanProcess>>,
}

impl AutoscanManager {
    pub fn new(scanner: Arc<dyn MailboxScanner>) -> Self {
        Self {
            scanner,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Apply a new interval for a mailbox: spawn, retune or stop its
    /// process as needed
    pub async fn update(&self, mailbox_key: Key, interval_secs: u64) {
        let mut processes = self.processes.lock().await;

        let finished = processes
            .get(&mailbox_key)
            .map(|p| p.is_finished())
            .unwrap_or(false);
        if finished {
            processes.remove(&mailbox_key);
        }

        if interval_secs == 0 {
            if let Some(process) = processes.remove(&mailbox_key) {
                process.stop();
            }
            return;
        }

        match processes.get(&mailbox_key) {
            Some(process) => process.set_interval(interval_secs),
            None => {
                let process =
                    AutoscanProcess::spawn(mailbox_key, interval_secs, self.scanner.clone());
                processes.insert(mailbox_key, process);
            }
        }
    }

    /// Trigger an immediate scan. With no recurring process for this
    /// mailbox a one-off scan pass is run instead; the return value says
    /// whether a recurring process was there.
    pub async fn trigger(&self, mailbox_key: &Key) -> bool {
        let mut processes = self.processes.lock().await;

        let finished = processes
            .get(mailbox_key)
            .map(|p| p.is_finished())
            .unwrap_or(false);
        if finished {
            processes.remove(mailbox_key);
        }

        match processes.get(mailbox_key) {
            Some(process) => {
                process.trigger_now();
                true
            }
            None => {
                // Interval 0 scans once and stops; the detached handle is
                // fine since the process cleans itself up
                let _ = AutoscanProcess::spawn(*mailbox_key, 0, self.scanner.clone());
                false
            }
        }
    }

    /// Spawn a process for every stored mailbox with autoscan enabled.
    /// Returns how many were started.
    pub async fn start_from_store(
        &self,
        db: &Arc<Mutex<Connection>>,
    ) -> Result<usize, ProtocolError> {
        let mailboxes = {
            let conn = db.lock().await;
            get_autoscan_mailboxes(&conn)?
        };
        let count = mailboxes.len();
        for mailbox in mailboxes {
            self.update(mailbox.mailbox_key, mailbox.scan_interval).await;
        }
        Ok(count)
    }

    pub async fn stop_all(&self) {
        let mut processes = self.processes.lock().await;
        for process in processes.values() {
            process.stop();
        }
        processes.clear();
    }
}
