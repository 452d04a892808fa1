use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::events::{BusHandle, FsEvent};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Ticks a record waits after its last refresh before a dirty snapshot
    /// is emitted.
    pub initial_countdown: u32,
    pub tick_interval: Duration,
    /// Ticks a clean record may sit at countdown zero before it is evicted.
    pub idle_eviction: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_countdown: 3,
            tick_interval: Duration::from_secs(1),
            idle_eviction: 10,
        }
    }
}

struct MonitoredFile {
    content: Vec<u8>,
    countdown: u32,
    dirty: bool,
    idle_ticks: u32,
}

/// Write-coalescing engine.
///
/// Kernel writes arrive in block-sized fragments; committing each one to the
/// DHT would amplify cost and mint worthless version history. Every mutating
/// callback refreshes the path's record instead, and only once a record's
/// countdown drains with no further refresh does the tick emit one
/// `CompleteWrite` for the whole quiescent burst.
///
/// The map is the unit of atomicity: add, get, remove and tick serialize on
/// one lock. Emission happens after the lock is released and goes through
/// the bus channel, so a tick never blocks on listener I/O.
pub struct FileMonitor {
    files: Mutex<HashMap<String, MonitoredFile>>,
    bus: BusHandle,
    config: MonitorConfig,
    stop: AtomicBool,
}

impl FileMonitor {
    pub fn new(bus: BusHandle, config: MonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(HashMap::new()),
            bus,
            config,
            stop: AtomicBool::new(false),
        })
    }

    /// Insert or refresh the record for `path`. A new record starts dirty; a
    /// replaced one turns dirty only when the snapshot changed. Either way
    /// the countdown restarts, pushing the flush out while writes continue.
    pub fn add(&self, path: &str, content: Vec<u8>) {
        let mut files = match self.files.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        match files.get_mut(path) {
            Some(record) => {
                if record.content != content {
                    record.content = content;
                    record.dirty = true;
                }
                record.countdown = self.config.initial_countdown;
                record.idle_ticks = 0;
            }
            None => {
                files.insert(
                    path.to_string(),
                    MonitoredFile {
                        content,
                        countdown: self.config.initial_countdown,
                        dirty: true,
                        idle_ticks: 0,
                    },
                );
            }
        }
    }

    /// Latest snapshot for `path`, serving reads that land before the flush.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .ok()?
            .get(path)
            .map(|record| record.content.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files
            .lock()
            .map(|files| files.contains_key(path))
            .unwrap_or(false)
    }

    pub fn monitored_paths(&self) -> Vec<String> {
        self.files
            .lock()
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the record for `path`; a pending emission is cancelled with it.
    /// Removing an unknown path is a no-op.
    pub fn remove(&self, path: &str) {
        if let Ok(mut files) = self.files.lock() {
            files.remove(path);
        }
    }

    /// One countdown step over every record. Dirty records reaching zero are
    /// emitted and stay in the map with a fresh countdown so continued
    /// writes keep being detected; clean records at zero age toward
    /// eviction.
    pub fn tick(&self) {
        let mut emissions = Vec::new();
        {
            let mut files = match self.files.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let mut evict = Vec::new();
            for (path, record) in files.iter_mut() {
                if record.countdown > 0 {
                    record.countdown -= 1;
                    continue;
                }
                if record.dirty {
                    emissions.push((path.clone(), record.content.clone()));
                    record.dirty = false;
                    record.countdown = self.config.initial_countdown;
                    record.idle_ticks = 0;
                } else {
                    record.idle_ticks += 1;
                    if record.idle_ticks >= self.config.idle_eviction {
                        evict.push(path.clone());
                    }
                }
            }
            for path in evict {
                debug!("evicting idle monitor record for {}", path);
                files.remove(&path);
            }
        }
        for (path, content) in emissions {
            debug!("complete write for {} ({} bytes)", path, content.len());
            self.bus.publish(FsEvent::CompleteWrite { path, content });
        }
    }

    /// Ask the loop to stop; it exits within one tick interval.
    pub fn terminate(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if monitor.stop.load(Ordering::SeqCst) {
                    break;
                }
                monitor.tick();
            }
            info!("file monitor loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, FsEventListener, COMPLETE_WRITE_EVENT};
    use async_trait::async_trait;
    use tokio::time::sleep;

    struct Capture {
        events: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl FsEventListener for Capture {
        fn event_name(&self) -> &'static str {
            COMPLETE_WRITE_EVENT
        }

        async fn handle_event(&self, event: &FsEvent) {
            let FsEvent::CompleteWrite { path, content } = event;
            self.events
                .lock()
                .unwrap()
                .push((path.clone(), content.clone()));
        }
    }

    fn test_monitor(countdown: u32, idle: u32) -> (Arc<FileMonitor>, Arc<Capture>) {
        let capture = Arc::new(Capture {
            events: Mutex::new(Vec::new()),
        });
        let mut bus = EventBus::new();
        bus.register(capture.clone());
        let (handle, _task) = bus.spawn();
        let monitor = FileMonitor::new(
            handle,
            MonitorConfig {
                initial_countdown: countdown,
                tick_interval: Duration::from_millis(10),
                idle_eviction: idle,
            },
        );
        (monitor, capture)
    }

    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_emits_after_countdown_drains() {
        let (monitor, capture) = test_monitor(2, 10);
        monitor.add("/a.txt", b"hello".to_vec());

        monitor.tick();
        monitor.tick();
        settle().await;
        assert!(capture.events.lock().unwrap().is_empty());

        monitor.tick();
        settle().await;
        let events = capture.events.lock().unwrap();
        assert_eq!(*events, vec![("/a.txt".to_string(), b"hello".to_vec())]);
    }

    #[tokio::test]
    async fn test_refresh_resets_countdown() {
        let (monitor, capture) = test_monitor(2, 10);
        monitor.add("/a.txt", b"one".to_vec());
        monitor.tick();
        monitor.tick();

        // refreshed just before the deadline; the flush moves out
        monitor.add("/a.txt", b"two".to_vec());
        monitor.tick();
        settle().await;
        assert!(capture.events.lock().unwrap().is_empty());

        monitor.tick();
        monitor.tick();
        settle().await;
        let events = capture.events.lock().unwrap();
        assert_eq!(*events, vec![("/a.txt".to_string(), b"two".to_vec())]);
    }

    #[tokio::test]
    async fn test_emission_carries_latest_snapshot() {
        let (monitor, capture) = test_monitor(1, 10);
        monitor.add("/a.txt", b"first".to_vec());
        monitor.add("/a.txt", b"second".to_vec());

        monitor.tick();
        monitor.tick();
        settle().await;
        let events = capture.events.lock().unwrap();
        assert_eq!(*events, vec![("/a.txt".to_string(), b"second".to_vec())]);
    }

    #[tokio::test]
    async fn test_clean_reemission_requires_new_content() {
        let (monitor, capture) = test_monitor(1, 100);
        monitor.add("/a.txt", b"same".to_vec());
        monitor.tick();
        monitor.tick();
        settle().await;
        assert_eq!(capture.events.lock().unwrap().len(), 1);

        // same bytes again: countdown restarts but the record stays clean
        monitor.add("/a.txt", b"same".to_vec());
        monitor.tick();
        monitor.tick();
        monitor.tick();
        settle().await;
        assert_eq!(capture.events.lock().unwrap().len(), 1);

        monitor.add("/a.txt", b"changed".to_vec());
        monitor.tick();
        monitor.tick();
        settle().await;
        assert_eq!(capture.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_cancels_pending_emission() {
        let (monitor, capture) = test_monitor(2, 10);
        monitor.add("/a.txt", b"data".to_vec());
        monitor.tick();
        monitor.remove("/a.txt");
        monitor.remove("/a.txt"); // idempotent
        monitor.tick();
        monitor.tick();
        settle().await;
        assert!(capture.events.lock().unwrap().is_empty());
        assert!(!monitor.contains("/a.txt"));
    }

    #[tokio::test]
    async fn test_idle_record_evicted() {
        let (monitor, _capture) = test_monitor(1, 2);
        monitor.add("/a.txt", b"data".to_vec());
        // one tick to drain, one to emit, two idle ticks to evict
        for _ in 0..5 {
            monitor.tick();
        }
        settle().await;
        assert!(!monitor.contains("/a.txt"));
    }

    #[tokio::test]
    async fn test_loop_terminates_within_a_tick() {
        let (monitor, _capture) = test_monitor(1, 10);
        let task = monitor.spawn();
        monitor.terminate();
        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("monitor loop did not stop in time")
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_serves_unflushed_snapshot() {
        let (monitor, _capture) = test_monitor(3, 10);
        monitor.add("/a.txt", b"pending".to_vec());
        assert_eq!(monitor.get("/a.txt"), Some(b"pending".to_vec()));
        assert_eq!(monitor.get("/other"), None);
    }
}
