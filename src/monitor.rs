use std::os::fd::AsRawFd as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context as _;
use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::config::KeyboardConfig;
use crate::messages::{HotplugAction, RawHotplugEvent};

/// How long the listener thread blocks in poll() before re-checking the
/// shutdown flag.
const POLL_TIMEOUT_MS: i32 = 500;

/// Identity of the watched keyboard. udev reports ID_VENDOR_ID / ID_MODEL_ID
/// in lowercase hex; the configured ids are normalized once here so matching
/// is case-insensitive.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    vendor_id: String,
    product_id: String,
}

impl DeviceIdentity {
    pub fn new(config: &KeyboardConfig) -> Self {
        DeviceIdentity {
            vendor_id: config.vendor_id.to_lowercase(),
            product_id: config.product_id.to_lowercase(),
        }
    }

    pub fn matches(&self, event: &RawHotplugEvent) -> bool {
        if !event.is_usb || !event.is_keyboard {
            return false;
        }
        let (Some(vendor), Some(product)) = (&event.vendor_id, &event.product_id) else {
            return false;
        };
        vendor.to_lowercase() == self.vendor_id && product.to_lowercase() == self.product_id
    }
}

/// Maps a raw event to the presence value it implies, or `None` when the
/// event is not about the watched keyboard.
pub fn relevant_presence(identity: &DeviceIdentity, event: &RawHotplugEvent) -> Option<bool> {
    if !identity.matches(event) {
        return None;
    }
    Some(event.action == HotplugAction::Add)
}

/// Collapses runs of identical presence values so downstream only ever sees
/// changes. A keyboard exposing several USB interfaces produces one add event
/// per interface; only the first one for a given value gets through.
pub struct PresenceTracker {
    last: Option<bool>,
}

impl PresenceTracker {
    pub fn seeded(initial: bool) -> Self {
        PresenceTracker {
            last: Some(initial),
        }
    }

    pub fn observe(&mut self, present: bool) -> Option<bool> {
        if self.last == Some(present) {
            return None;
        }
        self.last = Some(present);
        Some(present)
    }
}

fn raw_event(action: HotplugAction, device: &udev::Device) -> RawHotplugEvent {
    let prop = |name: &str| {
        device
            .property_value(name)
            .map(|v| v.to_string_lossy().into_owned())
    };
    RawHotplugEvent {
        action,
        vendor_id: prop("ID_VENDOR_ID"),
        product_id: prop("ID_MODEL_ID"),
        is_usb: prop("ID_BUS").as_deref() == Some("usb"),
        is_keyboard: prop("ID_INPUT_KEYBOARD").as_deref() == Some("1"),
    }
}

/// Synchronously enumerates the input subsystem and reports whether the
/// watched keyboard is currently attached. Run once at startup to seed the
/// presence state; errors here are fatal.
pub fn scan_once(identity: &DeviceIdentity) -> anyhow::Result<bool> {
    let mut enumerator = udev::Enumerator::new().context("creating udev enumerator")?;
    enumerator
        .match_subsystem("input")
        .context("filtering input subsystem")?;
    for device in enumerator.scan_devices().context("enumerating devices")? {
        let event = raw_event(HotplugAction::Add, &device);
        if identity.matches(&event) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Spawns the dedicated udev listener thread.
///
/// The thread owns the MonitorSocket (which is not Send) and forwards raw
/// add/remove events from the input subsystem into `tx`. It blocks in poll()
/// with a timeout so the shutdown flag is observed within half a second.
/// Returns once the socket is listening; a socket setup failure is reported
/// here so startup can fail fast.
pub fn spawn_listener(
    tx: mpsc::Sender<RawHotplugEvent>,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::io::Result<()>>();

    std::thread::spawn(move || {
        let socket = match udev::MonitorBuilder::new()
            .and_then(|b| b.match_subsystem("input"))
            .and_then(|b| b.listen())
        {
            Ok(socket) => {
                let _ = ready_tx.send(Ok(()));
                socket
            }
            Err(err) => {
                let _ = ready_tx.send(Err(err));
                return;
            }
        };

        let fd = socket.as_raw_fd();
        info!("USB hotplug listener started");

        while !shutdown.load(Ordering::Relaxed) {
            let mut poll_fd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let poll_result = unsafe { libc::poll(&mut poll_fd, 1, POLL_TIMEOUT_MS) };

            if poll_result < 0 {
                error!(
                    "Error polling udev socket: {}",
                    std::io::Error::last_os_error()
                );
                break;
            }
            if poll_result == 0 {
                continue;
            }

            for event in socket.iter() {
                let action = match event.event_type() {
                    udev::EventType::Add => HotplugAction::Add,
                    udev::EventType::Remove => HotplugAction::Remove,
                    _ => continue,
                };
                if tx.blocking_send(raw_event(action, &event)).is_err() {
                    debug!("Hotplug channel closed, stopping listener");
                    return;
                }
            }
        }
        info!("USB hotplug listener stopped");
    });

    ready_rx
        .recv()
        .context("udev listener thread exited before reporting readiness")?
        .context("creating udev monitor socket")?;
    Ok(())
}

/// Consumes raw events, keeps only those about the watched keyboard, and
/// forwards change-only presence values. Exits when either channel closes.
pub async fn run_filter(
    identity: DeviceIdentity,
    mut tracker: PresenceTracker,
    mut raw_rx: mpsc::Receiver<RawHotplugEvent>,
    presence_tx: mpsc::Sender<bool>,
) {
    while let Some(event) = raw_rx.recv().await {
        let Some(present) = relevant_presence(&identity, &event) else {
            continue;
        };
        match tracker.observe(present) {
            Some(present) => {
                info!(
                    "Keyboard {}",
                    if present { "connected" } else { "disconnected" }
                );
                if presence_tx.send(present).await.is_err() {
                    break;
                }
            }
            None => {
                debug!("Presence unchanged ({present}), skipping");
            }
        }
    }
    debug!("Presence filter exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new(&KeyboardConfig {
            vendor_id: "046D".to_string(),
            product_id: "c52b".to_string(),
            name: None,
        })
    }

    fn event(action: HotplugAction, vendor: &str, product: &str) -> RawHotplugEvent {
        RawHotplugEvent {
            action,
            vendor_id: Some(vendor.to_string()),
            product_id: Some(product.to_string()),
            is_usb: true,
            is_keyboard: true,
        }
    }

    #[test]
    fn test_identity_match_is_case_insensitive() {
        let id = identity();
        assert!(id.matches(&event(HotplugAction::Add, "046d", "C52B")));
    }

    #[test]
    fn test_irrelevant_events_filtered() {
        let id = identity();
        // Wrong vendor/product
        assert_eq!(
            relevant_presence(&id, &event(HotplugAction::Add, "1234", "c52b")),
            None
        );
        assert_eq!(
            relevant_presence(&id, &event(HotplugAction::Add, "046d", "ffff")),
            None
        );
        // Right ids but not a USB keyboard
        let mut mouse = event(HotplugAction::Add, "046d", "c52b");
        mouse.is_keyboard = false;
        assert_eq!(relevant_presence(&id, &mouse), None);
        let mut bluetooth = event(HotplugAction::Add, "046d", "c52b");
        bluetooth.is_usb = false;
        assert_eq!(relevant_presence(&id, &bluetooth), None);
        // Missing properties
        let mut bare = event(HotplugAction::Add, "046d", "c52b");
        bare.vendor_id = None;
        assert_eq!(relevant_presence(&id, &bare), None);
    }

    #[test]
    fn test_relevant_events_map_to_presence() {
        let id = identity();
        assert_eq!(
            relevant_presence(&id, &event(HotplugAction::Add, "046d", "c52b")),
            Some(true)
        );
        assert_eq!(
            relevant_presence(&id, &event(HotplugAction::Remove, "046d", "c52b")),
            Some(false)
        );
    }

    #[test]
    fn test_tracker_collapses_repeats() {
        // Multi-interface keyboard: several adds, no intervening remove
        let mut tracker = PresenceTracker::seeded(false);
        assert_eq!(tracker.observe(true), Some(true));
        assert_eq!(tracker.observe(true), None);
        assert_eq!(tracker.observe(true), None);
        assert_eq!(tracker.observe(false), Some(false));
        assert_eq!(tracker.observe(false), None);
    }

    #[test]
    fn test_tracker_seed_suppresses_matching_first_event() {
        let mut tracker = PresenceTracker::seeded(true);
        // Initial scan already said present; a late add event is a no-op
        assert_eq!(tracker.observe(true), None);
        assert_eq!(tracker.observe(false), Some(false));
    }

    #[tokio::test]
    async fn test_filter_emits_changes_only() {
        let id = identity();
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (presence_tx, mut presence_rx) = mpsc::channel(16);

        let filter = tokio::spawn(run_filter(
            id,
            PresenceTracker::seeded(false),
            raw_rx,
            presence_tx,
        ));

        for _ in 0..3 {
            raw_tx
                .send(event(HotplugAction::Add, "046d", "c52b"))
                .await
                .unwrap();
        }
        // Noise from another device in between
        raw_tx
            .send(event(HotplugAction::Add, "dead", "beef"))
            .await
            .unwrap();
        raw_tx
            .send(event(HotplugAction::Remove, "046d", "c52b"))
            .await
            .unwrap();
        drop(raw_tx);

        assert_eq!(presence_rx.recv().await, Some(true));
        assert_eq!(presence_rx.recv().await, Some(false));
        assert_eq!(presence_rx.recv().await, None);
        filter.await.unwrap();
    }
}
