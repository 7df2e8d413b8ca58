//! Ban-record broker.
//!
//! Accepts produced records on a well-known queue, deduplicates them
//! through a [`DedupIndex`], and pushes every accepted record to all
//! currently registered subscribers. Subscribers register over a
//! registration queue and hold a lease they must renew; a fresh
//! subscriber is brought up to date with a full snapshot of the live
//! index. On stop the index is checkpointed to a gzip file and reloaded
//! through the normal dedup path on the next start.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::frame::{self, Frame};
use crate::index::{DedupIndex, Insert};
use crate::record::{ticks_now, BanRecord, TICKS_PER_SECOND};
use crate::shutdown::Shutdown;
use crate::throttle::LimitedLog;
use crate::transport::{QueueMessage, Transport, TransportError};

const RETRY_BASE: Duration = Duration::from_millis(250);

struct Shared {
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    index: Mutex<DedupIndex>,
    /// subscriber queue name -> last renewal (ticks)
    subscribers: Mutex<HashMap<String, i64>>,
    shutdown: Shutdown,
    /// Re-checked by the sweep loops immediately before they mutate
    /// shared state, closing the shutdown race with an already-due tick.
    sweeps_enabled: AtomicBool,
}

/// Broker lifecycle: `new` → `start` → `stop`. Multiple independent
/// instances may coexist over distinct queue names.
pub struct Broker {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl Broker {
    pub fn new(config: BrokerConfig, transport: Arc<dyn Transport>) -> Result<Broker> {
        config.validate()?;
        let capacity = config.max_entries;
        Ok(Broker {
            shared: Arc::new(Shared {
                config,
                transport,
                index: Mutex::new(DedupIndex::new(capacity)),
                subscribers: Mutex::new(HashMap::new()),
                shutdown: Shutdown::new(),
                sweeps_enabled: AtomicBool::new(false),
            }),
            threads: Vec::new(),
        })
    }

    /// Load the checkpoint (if any) and start the intake, registration
    /// and sweep threads.
    pub fn start(&mut self) -> Result<()> {
        if !self.threads.is_empty() {
            return Err(Error::Lifecycle("broker already running".to_string()));
        }
        if self.shared.shutdown.is_triggered() {
            return Err(Error::Lifecycle("broker already stopped".to_string()));
        }

        if let Some(path) = self.shared.config.checkpoint_file.clone() {
            // a corrupt or missing checkpoint degrades to an empty index
            if let Err(e) = load_checkpoint(&self.shared, &path) {
                log::warn!("checkpoint not loaded, starting empty: {}", e);
            }
        }

        // open the well-known queues up front; failures here are retried
        // lazily by the receive loops
        for queue in [
            &self.shared.config.producer_queue,
            &self.shared.config.registration_queue,
        ] {
            if let Err(e) = self.shared.transport.create_queue(queue) {
                log::warn!("unable to create queue {}: {}", queue, e);
            }
        }

        self.shared.sweeps_enabled.store(true, Ordering::SeqCst);

        let mut spawn = |name: &str, f: Box<dyn FnOnce() + Send>| -> Result<()> {
            let handle = std::thread::Builder::new()
                .name(format!("broker-{}", name))
                .spawn(f)?;
            self.threads.push(handle);
            Ok(())
        };

        let shared = self.shared.clone();
        spawn("intake", Box::new(move || intake_loop(&shared)))?;

        let shared = self.shared.clone();
        spawn("registration", Box::new(move || registration_loop(&shared)))?;

        if self.shared.config.lease_secs > 0 {
            let shared = self.shared.clone();
            spawn("lease-sweep", Box::new(move || lease_sweep_loop(&shared)))?;
        }

        if self.shared.config.expiry_sweep_secs > 0 {
            let shared = self.shared.clone();
            spawn("expiry-sweep", Box::new(move || expiry_sweep_loop(&shared)))?;
        }

        log::info!(
            "broker started (producer={}, registration={})",
            self.shared.config.producer_queue,
            self.shared.config.registration_queue
        );
        Ok(())
    }

    /// Stop all loops, join them, and write the checkpoint.
    pub fn stop(&mut self) -> Result<()> {
        if self.threads.is_empty() {
            return Err(Error::Lifecycle("broker not running".to_string()));
        }

        self.shared.sweeps_enabled.store(false, Ordering::SeqCst);
        self.shared.shutdown.trigger();

        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            log::info!("waiting for {} to finish", name);
            if handle.join().is_err() {
                log::error!("{} panicked", name);
            }
        }

        if let Some(path) = self.shared.config.checkpoint_file.clone() {
            save_checkpoint(&self.shared, &path)?;
        }

        log::info!("broker stopped");
        Ok(())
    }

    /// Number of live index entries.
    pub fn entry_count(&self) -> usize {
        self.shared.index.lock().len()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            let _ = self.stop();
        }
    }
}

/// Receive produced records, index them, fan out the accepted ones.
fn intake_loop(shared: &Shared) {
    log::info!("intake loop starting");

    let queue = shared.config.producer_queue.clone();
    let mut trouble = LimitedLog::default();
    let mut capacity_log = LimitedLog::default();

    while !shared.shutdown.is_triggered() {
        match shared.transport.receive(&queue, shared.config.poll_timeout()) {
            Ok(message) => {
                trouble.reset();
                handle_producer_message(shared, &message, &mut capacity_log);
            }
            Err(e) => handle_receive_error(shared, &queue, e, &mut trouble),
        }
    }

    log::info!("intake loop finished");
}

fn handle_producer_message(shared: &Shared, message: &QueueMessage, capacity_log: &mut LimitedLog) {
    let frames = match frame::read_message(&message.body) {
        Ok(frames) => frames,
        Err(e) => {
            log::warn!("dropping malformed producer message: {}", e);
            return;
        }
    };

    for item in frames {
        let record = match item {
            Frame::Record(record) => record,
            other => {
                log::warn!("ignoring non-record frame on producer queue: {:?}", other);
                continue;
            }
        };

        let now = ticks_now();
        let outcome = shared.index.lock().insert(&record, now);

        match outcome {
            Insert::Applied | Insert::ReplacedOlder { .. } => {
                fan_out(shared, &record, &message.label);
            }
            Insert::RejectedOlder => {
                log::debug!("duplicate not newer: {}", record);
            }
            Insert::ExpiredOnArrival => {
                log::info!("skipping record that expired on arrival: {}", record);
            }
            Insert::RejectedCapacity => {
                capacity_log.warn("distinct-target cap reached, dropping new ban record");
            }
        }
    }
}

/// Push one accepted record to every registered subscriber. A slow or
/// missing subscriber only affects its own queue backlog.
fn fan_out(shared: &Shared, record: &BanRecord, label: &str) {
    let targets: Vec<String> = shared.subscribers.lock().keys().cloned().collect();
    if targets.is_empty() {
        return;
    }

    log::debug!("fanning out {} to {} subscribers", record, targets.len());
    let body = frame::encode_record_message(record);

    for queue in targets {
        let mut message = QueueMessage::new(label, body.clone());
        if let Some(ttl) = shared.config.message_ttl() {
            message = message.with_ttl(ttl);
        }

        let result = match shared.transport.send(&queue, message.clone()) {
            // subscriber queue vanished underneath us: recreate lazily
            Err(TransportError::QueueNotFound(_)) | Err(TransportError::QueueDeleted(_)) => shared
                .transport
                .create_queue(&queue)
                .and_then(|_| shared.transport.send(&queue, message)),
            other => other,
        };
        if let Err(e) = result {
            log::warn!("fan-out to {} failed: {}", queue, e);
        }
    }
}

/// Handle subscribe/unsubscribe traffic on the registration queue.
fn registration_loop(shared: &Shared) {
    log::info!("registration loop starting");

    let queue = shared.config.registration_queue.clone();
    let mut trouble = LimitedLog::default();

    while !shared.shutdown.is_triggered() {
        match shared.transport.receive(&queue, shared.config.poll_timeout()) {
            Ok(message) => {
                trouble.reset();
                handle_registration_message(shared, &message);
            }
            Err(e) => handle_receive_error(shared, &queue, e, &mut trouble),
        }
    }

    log::info!("registration loop finished");
}

fn handle_registration_message(shared: &Shared, message: &QueueMessage) {
    let frames = match frame::read_message(&message.body) {
        Ok(frames) => frames,
        Err(e) => {
            log::warn!("dropping malformed registration message: {}", e);
            return;
        }
    };

    // only the first frame of a registration message counts
    let (subscribe, registration) = match frames.into_iter().next() {
        Some(Frame::Subscribe(reg)) => (true, reg),
        Some(Frame::Unsubscribe(reg)) => (false, reg),
        Some(other) => {
            log::warn!("ignoring non-registration frame: {:?}", other);
            return;
        }
        None => {
            log::warn!("empty registration message");
            return;
        }
    };

    let queue = registration.queue_name();
    log::info!(
        "{} subscriber {} ({})",
        if subscribe { "registering" } else { "unregistering" },
        queue,
        message.label
    );

    if subscribe {
        if let Err(e) = shared.transport.create_queue(&queue) {
            log::warn!("unable to create subscriber queue {}: {}", queue, e);
            return;
        }

        let is_new = {
            let mut subscribers = shared.subscribers.lock();
            let now = ticks_now();
            subscribers.insert(queue.clone(), now).is_none()
        };

        // renewals are idempotent; only a new identity gets the full state
        if is_new {
            send_snapshot(shared, &queue);
        }
    } else {
        shared.subscribers.lock().remove(&queue);
        match shared.transport.delete_queue(&queue) {
            Ok(()) | Err(TransportError::QueueNotFound(_)) => {}
            Err(e) => log::warn!("unable to delete subscriber queue {}: {}", queue, e),
        }
    }
}

/// Push the full non-expired state to a newly registered subscriber,
/// batched under the aggregate-size bound.
fn send_snapshot(shared: &Shared, queue: &str) {
    let now = ticks_now();
    let records = shared.index.lock().snapshot(now);
    if records.is_empty() {
        log::info!("no live records to snapshot for {}", queue);
        return;
    }

    let batches = frame::batch_records(
        records.iter().map(|r| r.as_slice()),
        shared.config.max_batch_bytes,
        shared.config.compress_batches,
    );
    let parts = batches.len();
    log::info!(
        "sending snapshot of {} records to {} in {} parts",
        records.len(),
        queue,
        parts
    );

    for (i, body) in batches.into_iter().enumerate() {
        let label = if i + 1 == parts {
            format!("banrelay snapshot part {} (last)", i + 1)
        } else {
            format!("banrelay snapshot part {}", i + 1)
        };
        let mut message = QueueMessage::new(&label, body);
        if let Some(ttl) = shared.config.message_ttl() {
            message = message.with_ttl(ttl);
        }
        if let Err(e) = shared.transport.send(queue, message) {
            log::warn!("snapshot push to {} failed: {}", queue, e);
            return;
        }
    }
}

/// Shared recovery for both receive loops: timeouts are the idle path,
/// missing queues are recreated lazily, anything else backs off with a
/// cap.
fn handle_receive_error(
    shared: &Shared,
    queue: &str,
    error: TransportError,
    trouble: &mut LimitedLog,
) {
    match error {
        TransportError::Timeout => {}
        TransportError::QueueDeleted(_) => {
            log::info!("queue {} was deleted, reopening", queue);
        }
        TransportError::QueueNotFound(_) => match shared.transport.create_queue(queue) {
            Ok(()) => log::info!("created queue {}", queue),
            Err(e) => {
                trouble.warn(&format!("unable to create queue {}: {}", queue, e));
                backoff(shared, trouble.streak());
            }
        },
        TransportError::Unavailable(reason) => {
            trouble.warn(&format!("queue {} unavailable: {}", queue, reason));
            backoff(shared, trouble.streak());
        }
    }
}

fn backoff(shared: &Shared, streak: u32) {
    shared.shutdown.wait(RETRY_BASE * streak.clamp(1, 10));
}

/// Drop subscribers whose lease ran out and tear down their queues.
fn lease_sweep_loop(shared: &Shared) {
    let interval = Duration::from_secs(shared.config.lease_secs);
    let lease_ticks = shared.config.lease_secs as i64 * TICKS_PER_SECOND;

    loop {
        if shared.shutdown.wait(interval) {
            break;
        }
        if !shared.sweeps_enabled.load(Ordering::SeqCst) {
            continue;
        }

        let now = ticks_now();
        let stale: Vec<String> = {
            let mut subscribers = shared.subscribers.lock();
            let stale: Vec<String> = subscribers
                .iter()
                .filter(|(_, &renewed)| now - renewed > lease_ticks)
                .map(|(queue, _)| queue.clone())
                .collect();
            for queue in &stale {
                subscribers.remove(queue);
            }
            stale
        };

        for queue in stale {
            log::info!("removing subscriber with expired lease: {}", queue);
            match shared.transport.delete_queue(&queue) {
                Ok(()) | Err(TransportError::QueueNotFound(_)) => {}
                Err(e) => log::warn!("unable to delete queue {}: {}", queue, e),
            }
        }
    }
}

/// Periodically drop expired index entries.
fn expiry_sweep_loop(shared: &Shared) {
    let interval = Duration::from_secs(shared.config.expiry_sweep_secs);

    loop {
        if shared.shutdown.wait(interval) {
            break;
        }
        if !shared.sweeps_enabled.load(Ordering::SeqCst) {
            continue;
        }

        let before;
        let after;
        {
            let mut index = shared.index.lock();
            before = index.len();
            index.sweep(ticks_now());
            after = index.len();
        }
        log::info!("expiry sweep finished (records {} -> {})", before, after);
    }
}

/// Write the swept index to `path` as a gzip-compressed concatenation
/// of record frames, newest-expiring first.
fn save_checkpoint(shared: &Shared, path: &Path) -> Result<()> {
    log::info!("writing checkpoint to {}", path.display());

    let now = ticks_now();
    let records = {
        let mut index = shared.index.lock();
        index.sweep(now);
        index.snapshot_newest_first(now)
    };

    let file = File::create(path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    let mut buf = Vec::new();
    for record in &records {
        buf.clear();
        frame::append_record_frame(&mut buf, record);
        encoder.write_all(&buf)?;
    }
    encoder.finish()?;

    log::info!("checkpointed {} records", records.len());
    Ok(())
}

/// Load a checkpoint through the normal dedup path, so a stale or
/// tampered file cannot violate index invariants.
fn load_checkpoint(shared: &Shared, path: &Path) -> Result<()> {
    if !path.exists() {
        log::info!("no checkpoint at {}", path.display());
        return Ok(());
    }
    log::info!("reading checkpoint from {}", path.display());

    let file = File::open(path)?;
    let mut raw = Vec::new();
    GzDecoder::new(file)
        .read_to_end(&mut raw)
        .map_err(|e| Error::CorruptCheckpoint(e.to_string()))?;

    let frames =
        frame::read_message(&raw).map_err(|e| Error::CorruptCheckpoint(e.to_string()))?;

    let now = ticks_now();
    let mut loaded = 0usize;
    let mut capacity_log = LimitedLog::default();
    let mut index = shared.index.lock();
    for item in frames {
        if let Frame::Record(record) = item {
            match index.insert(&record, now) {
                Insert::Applied | Insert::ReplacedOlder { .. } => loaded += 1,
                Insert::ExpiredOnArrival => log::debug!("checkpoint record expired: {}", record),
                Insert::RejectedOlder => log::debug!("checkpoint record duplicated: {}", record),
                Insert::RejectedCapacity => {
                    capacity_log.warn("distinct-target cap reached while loading checkpoint")
                }
            }
        }
    }

    log::info!("loaded {} records from checkpoint", loaded);
    Ok(())
}
