//! Panel monitoring: message registry, delegates and heartbeat.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use aqualogic_common::PanelSnapshot;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::registry::{MessageKind, MessageRegistry};

/// Receives panel notifications from a [`PanelMonitor`].
pub trait PanelDelegate: Send + Sync {
    /// Called for every decoded panel state change.
    fn handle_panel_changed(&mut self, snapshot: &PanelSnapshot);

    /// Called whenever the panel shows signs of life.
    fn set_heartbeat_time(&mut self, at: Instant);
}

/// Owns the message registry and fans panel activity out to delegates.
///
/// Delegates are notified in the order they were added.
pub struct PanelMonitor {
    registry: MessageRegistry,
    delegates: Vec<Box<dyn PanelDelegate>>,
}

impl PanelMonitor {
    pub fn new(registry: MessageRegistry) -> Self {
        Self {
            registry,
            delegates: Vec::new(),
        }
    }

    /// Register a delegate. It receives an initial heartbeat immediately.
    pub fn add_delegate(&mut self, mut delegate: Box<dyn PanelDelegate>) {
        delegate.set_heartbeat_time(Instant::now());
        self.delegates.push(delegate);
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    pub fn handle_panel_changed(&mut self, snapshot: &PanelSnapshot) {
        for delegate in &mut self.delegates {
            delegate.handle_panel_changed(snapshot);
        }
    }

    /// Record a display update.
    ///
    /// The current check-system message goes into the registry as a system
    /// message and the display line is checked against the watched patterns.
    /// Every delegate gets a heartbeat.
    pub fn text_updated(&mut self, text: &str, check_system_message: Option<&str>, now: Instant) {
        tracing::debug!(text = %text, "Panel text updated");

        self.registry
            .observe_at(check_system_message, MessageKind::System, now);
        self.registry.observe_at(Some(text), MessageKind::Text, now);

        for delegate in &mut self.delegates {
            delegate.set_heartbeat_time(now);
        }
    }
}

/// Panel availability as seen by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelStatus {
    Online,
    Stale,
}

impl std::fmt::Display for PanelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PanelStatus::Online => write!(f, "online"),
            PanelStatus::Stale => write!(f, "stale"),
        }
    }
}

/// Heartbeat tracking shared between the monitor and the watchdog.
#[derive(Debug)]
pub struct PanelLiveness {
    /// Reference point for the millisecond offsets below.
    epoch: Instant,
    /// Last heartbeat, in millis since `epoch`.
    last_heartbeat_ms: AtomicU64,
    /// Panel state changes seen.
    updates: AtomicU64,
    stale: AtomicBool,
}

impl PanelLiveness {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(epoch: Instant) -> Self {
        Self {
            epoch,
            last_heartbeat_ms: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            stale: AtomicBool::new(false),
        }
    }

    pub fn record_heartbeat(&self, at: Instant) {
        let ms = at.saturating_duration_since(self.epoch).as_millis() as u64;
        self.last_heartbeat_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_heartbeat_ms.load(Ordering::Relaxed))
    }

    pub fn status(&self) -> PanelStatus {
        if self.stale.load(Ordering::Relaxed) {
            PanelStatus::Stale
        } else {
            PanelStatus::Online
        }
    }

    /// Re-evaluate liveness at `now`.
    ///
    /// Returns the new status only when it changed.
    pub fn check(&self, now: Instant, timeout: Duration) -> Option<PanelStatus> {
        let silent = now.saturating_duration_since(self.last_heartbeat()) > timeout;
        let was_stale = self.stale.swap(silent, Ordering::Relaxed);
        match (was_stale, silent) {
            (false, true) => Some(PanelStatus::Stale),
            (true, false) => Some(PanelStatus::Online),
            _ => None,
        }
    }
}

impl Default for PanelLiveness {
    fn default() -> Self {
        Self::new()
    }
}

impl PanelDelegate for Arc<PanelLiveness> {
    fn handle_panel_changed(&mut self, _snapshot: &PanelSnapshot) {
        self.record_update();
    }

    fn set_heartbeat_time(&mut self, at: Instant) {
        self.record_heartbeat(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MessageFilter;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl PanelDelegate for Recorder {
        fn handle_panel_changed(&mut self, _snapshot: &PanelSnapshot) {
            self.log.lock().unwrap().push(format!("{}:changed", self.name));
        }

        fn set_heartbeat_time(&mut self, _at: Instant) {
            self.log.lock().unwrap().push(format!("{}:heartbeat", self.name));
        }
    }

    fn monitor() -> PanelMonitor {
        let registry = MessageRegistry::new(Duration::from_secs(60), ["no flow"]).unwrap();
        PanelMonitor::new(registry)
    }

    #[test]
    fn test_delegates_in_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut monitor = monitor();
        monitor.add_delegate(Box::new(Recorder {
            name: "a",
            log: log.clone(),
        }));
        monitor.add_delegate(Box::new(Recorder {
            name: "b",
            log: log.clone(),
        }));

        monitor.handle_panel_changed(&PanelSnapshot::new());
        monitor.text_updated("Pool Temp 80", None, Instant::now());

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "a:heartbeat",
                "b:heartbeat",
                "a:changed",
                "b:changed",
                "a:heartbeat",
                "b:heartbeat",
            ]
        );
    }

    #[test]
    fn test_text_updated_feeds_registry() {
        let start = Instant::now();
        let liveness = Arc::new(PanelLiveness::starting_at(start));
        let mut monitor = monitor();
        monitor.add_delegate(Box::new(liveness.clone()));
        let now = start + Duration::from_secs(1);

        monitor.text_updated("Pool NO FLOW", Some("Check System\0\0"), now);

        let registry = monitor.registry();
        assert_eq!(
            registry.query_messages_at(MessageFilter::System, now),
            vec!["Check System"]
        );
        assert!(registry.has_message_at("no flow", MessageFilter::Text, now));
        assert_eq!(liveness.last_heartbeat(), now);
    }

    #[test]
    fn test_liveness_transitions() {
        let start = Instant::now();
        let timeout = Duration::from_secs(60);
        let liveness = PanelLiveness::starting_at(start);
        liveness.record_heartbeat(start);

        assert_eq!(liveness.check(start + Duration::from_secs(30), timeout), None);
        assert_eq!(
            liveness.check(start + Duration::from_secs(61), timeout),
            Some(PanelStatus::Stale)
        );
        assert_eq!(liveness.check(start + Duration::from_secs(90), timeout), None);
        assert_eq!(liveness.status(), PanelStatus::Stale);

        liveness.record_heartbeat(start + Duration::from_secs(95));
        assert_eq!(
            liveness.check(start + Duration::from_secs(96), timeout),
            Some(PanelStatus::Online)
        );
        assert_eq!(liveness.status(), PanelStatus::Online);
    }

    #[test]
    fn test_liveness_as_delegate() {
        let start = Instant::now();
        let liveness = Arc::new(PanelLiveness::starting_at(start));
        let mut monitor = monitor();
        monitor.add_delegate(Box::new(liveness.clone()));

        monitor.handle_panel_changed(&PanelSnapshot::new());
        monitor.handle_panel_changed(&PanelSnapshot::new());
        monitor.text_updated("x", None, start + Duration::from_secs(5));

        assert_eq!(liveness.updates(), 2);
        assert_eq!(liveness.last_heartbeat(), start + Duration::from_secs(5));
    }
}
