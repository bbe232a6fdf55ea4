//! Per-device connection: screenshot/UI-dump contracts, lock-state
//! detection, unlock, and app control (spec.md §4.2). Grounded on the
//! teacher's `Perception::capture_screenshot_adb`/`dump_ui_tree`/
//! `is_screen_on`, generalized with caching, retries, and a lock/unlock
//! state machine the teacher never needed.

use super::backend::AdaptiveSelector;
use crate::error::{EngineError, Result};
use crate::ui::{parse_ui_hierarchy, UiTree};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const SCREENSHOT_SANITY_FLOOR_BYTES: usize = 1000;
const UI_DUMP_RETRIES: u32 = 2;
const DUMP_PATH: &str = "/sdcard/sensorbridge_ui_dump.xml";
const OVERLAY_CLEAR_STRATEGIES: usize = 8;

/// Full lock-state machine (spec.md §4.2/§9), combining power state,
/// keyguard flags, and the currently focused window's class. Samsung's
/// lock-screen window identifies itself as `NotificationShade`, the same
/// class a real notification panel uses, which is why this can't be a
/// two-flag binary test — see [`resolve_lock_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    ScreenOff,
    Dreaming,
    LockedLockscreen,
    LockedPinEntry,
    /// A real notification/status-bar shade pulled down over an unlocked
    /// foreground, distinct from Samsung's lock-screen window that also
    /// reports this class.
    NotificationShade,
    Unlocked,
}

impl LockState {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, LockState::Unlocked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceFamily {
    Samsung,
    Pixel,
    OnePlus,
    Other,
}

struct Cached<T> {
    value: T,
    at: Instant,
}

pub struct DeviceConnection {
    pub serial: String,
    backend: Arc<AdaptiveSelector>,
    screenshot_cache: Mutex<Option<Cached<Vec<u8>>>>,
    ui_dump_cache: Mutex<Option<Cached<UiTree>>>,
    screenshot_ttl: Duration,
    ui_dump_ttl: Duration,
    unlock_attempts: Mutex<u32>,
    max_unlock_attempts: u32,
    locked_out_until: Mutex<Option<Instant>>,
    unlock_cooldown: Duration,
    family_cache: Mutex<Option<DeviceFamily>>,
}

impl DeviceConnection {
    pub fn new(
        serial: String,
        backend: Arc<AdaptiveSelector>,
        screenshot_ttl_ms: u64,
        ui_dump_ttl_ms: u64,
        max_unlock_attempts: u32,
        unlock_cooldown_secs: u64,
    ) -> Self {
        Self {
            serial,
            backend,
            screenshot_cache: Mutex::new(None),
            ui_dump_cache: Mutex::new(None),
            screenshot_ttl: Duration::from_millis(screenshot_ttl_ms),
            ui_dump_ttl: Duration::from_millis(ui_dump_ttl_ms),
            unlock_attempts: Mutex::new(0),
            max_unlock_attempts,
            locked_out_until: Mutex::new(None),
            unlock_cooldown: Duration::from_secs(unlock_cooldown_secs),
            family_cache: Mutex::new(None),
        }
    }

    pub async fn shell(&self, args: &[&str]) -> Result<String> {
        self.backend.shell(&self.serial, args).await
    }

    /// Captures a PNG screenshot, honoring the cache TTL. Below the sanity
    /// floor is treated as a capture failure rather than a valid-but-tiny
    /// image (spec.md's "all screenshot paths returned below the sanity
    /// floor" -> `CaptureFailed`).
    pub async fn screenshot(&self, force: bool) -> Result<Vec<u8>> {
        {
            let cache = self.screenshot_cache.lock().await;
            if !force {
                if let Some(c) = cache.as_ref() {
                    if c.at.elapsed() < self.screenshot_ttl {
                        return Ok(c.value.clone());
                    }
                }
            }
        }

        let bytes = self.backend.shell_bytes_via_subprocess(&self.serial, &["exec-out", "screencap", "-p"]).await?;
        if bytes.len() < SCREENSHOT_SANITY_FLOOR_BYTES {
            return Err(EngineError::CaptureFailed);
        }
        *self.screenshot_cache.lock().await = Some(Cached { value: bytes.clone(), at: Instant::now() });
        Ok(bytes)
    }

    /// Dumps the UI hierarchy via `uiautomator dump`, retrying up to
    /// [`UI_DUMP_RETRIES`] times on an empty/invalid result, then caches it
    /// until the TTL expires or [`invalidate_ui_cache`] is called (e.g.
    /// after a tap/swipe changes the screen).
    pub async fn ui_hierarchy(&self, bounds_only: bool) -> Result<UiTree> {
        {
            let cache = self.ui_dump_cache.lock().await;
            if let Some(c) = cache.as_ref() {
                if c.at.elapsed() < self.ui_dump_ttl {
                    return Ok(c.value.clone());
                }
            }
        }

        let mut last_err = None;
        for attempt in 0..=UI_DUMP_RETRIES {
            match self.dump_ui_once(bounds_only).await {
                Ok(tree) if !tree.elements.is_empty() => {
                    *self.ui_dump_cache.lock().await = Some(Cached { value: tree.clone(), at: Instant::now() });
                    return Ok(tree);
                }
                Ok(_) => {
                    debug!(serial = %self.serial, attempt, "uiautomator dump returned an empty tree, retrying");
                    last_err = Some(EngineError::Extraction { sensor_id: "ui_dump".into(), message: "empty tree".into() });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::transport(&self.serial, "ui dump exhausted retries")))
    }

    async fn dump_ui_once(&self, bounds_only: bool) -> Result<UiTree> {
        self.shell(&["uiautomator", "dump", DUMP_PATH]).await?;
        let xml = self.shell(&["cat", DUMP_PATH]).await?;
        if !xml.contains("<hierarchy") {
            return Ok(UiTree::default());
        }
        Ok(parse_ui_hierarchy(&xml, bounds_only))
    }

    pub async fn invalidate_ui_cache(&self) {
        *self.ui_dump_cache.lock().await = None;
    }

    pub async fn is_screen_on(&self) -> bool {
        self.shell(&["dumpsys", "power"])
            .await
            .map(|s| s.contains("mWakefulness=Awake") || s.contains("Display Power: state=ON"))
            .unwrap_or(false)
    }

    /// Detects the full lock state (spec.md §4.2/§9) by combining
    /// `dumpsys power`'s wakefulness with `dumpsys window`'s keyguard flags
    /// and focused-window class. All of the quirk logic lives in
    /// [`resolve_lock_state`] so family-specific behavior has one place to
    /// grow.
    pub async fn lock_state(&self) -> Result<LockState> {
        let power = self.shell(&["dumpsys", "power"]).await?;
        let window = self.shell(&["dumpsys", "window"]).await?;

        let power_awake = power.contains("mWakefulness=Awake") || power.contains("Display Power: state=ON");
        let dreaming = power.contains("mWakefulness=Dreaming") || window.contains("mDreamingLockscreen=true");
        let keyguard_showing =
            window.contains("mShowingLockscreen=true") || window.contains("isStatusBarKeyguard=true") || window.contains("mKeyguardShowing=true");
        let focused_window = window
            .lines()
            .find(|l| l.contains("mCurrentFocus") || l.contains("mFocusedWindow") || l.contains("mFocusedApp"))
            .unwrap_or("")
            .to_string();

        Ok(resolve_lock_state(power_awake, dreaming, keyguard_showing, &focused_window))
    }

    async fn device_family(&self) -> DeviceFamily {
        {
            if let Some(family) = *self.family_cache.lock().await {
                return family;
            }
        }
        let manufacturer = self.shell(&["getprop", "ro.product.manufacturer"]).await.unwrap_or_default().to_lowercase();
        let family = if manufacturer.contains("samsung") {
            DeviceFamily::Samsung
        } else if manufacturer.contains("google") {
            DeviceFamily::Pixel
        } else if manufacturer.contains("oneplus") {
            DeviceFamily::OnePlus
        } else {
            DeviceFamily::Other
        };
        *self.family_cache.lock().await = Some(family);
        family
    }

    /// Swipes up from the bottom of the screen. For Samsung devices the
    /// first swipe may only open the notification shade; callers should
    /// re-check `lock_state` and swipe again if so.
    pub async fn unlock_swipe(&self, screen_w: i32, screen_h: i32) -> Result<()> {
        if self.unlock_locked_out().await {
            return Err(EngineError::device_locked(&self.serial, "max unlock attempts exceeded, cooling down"));
        }
        let x = screen_w / 2;
        let y1 = (screen_h as f64 * 0.9) as i32;
        let y2 = (screen_h as f64 * 0.2) as i32;
        self.shell(&["input", "swipe", &x.to_string(), &y1.to_string(), &x.to_string(), &y2.to_string(), "300"])
            .await?;
        self.invalidate_ui_cache().await;
        self.record_unlock_attempt().await;
        Ok(())
    }

    /// Wake + reveal the PIN keypad (hidden behind a swipe-up on most lock
    /// screens) + type the PIN + confirm. Confirm varies by device family
    /// (spec.md §4.2): Samsung/Pixel require the Enter keyevent to submit;
    /// OnePlus auto-confirms on the last digit, but Enter is sent anyway as
    /// a harmless fallback in case auto-confirm didn't fire.
    pub async fn unlock_with_pin(&self, pin: &str) -> Result<()> {
        if self.unlock_locked_out().await {
            return Err(EngineError::device_locked(&self.serial, "max unlock attempts exceeded, cooling down"));
        }
        let family = self.device_family().await;

        // Reveal the PIN entry affordance.
        self.shell(&["input", "keyevent", "KEYCODE_WAKEUP"]).await?;
        self.shell(&["input", "swipe", "540", "1900", "540", "1000", "200"]).await?;
        tokio::time::sleep(Duration::from_millis(300)).await;

        self.shell(&["input", "text", pin]).await?;
        match family {
            DeviceFamily::OnePlus => {
                let _ = self.shell(&["input", "keyevent", "66"]).await; // KEYCODE_ENTER, best-effort fallback
            }
            DeviceFamily::Samsung | DeviceFamily::Pixel | DeviceFamily::Other => {
                self.shell(&["input", "keyevent", "66"]).await?; // KEYCODE_ENTER
            }
        }
        self.invalidate_ui_cache().await;
        self.record_unlock_attempt().await;
        Ok(())
    }

    async fn record_unlock_attempt(&self) {
        let mut attempts = self.unlock_attempts.lock().await;
        *attempts += 1;
        if *attempts >= self.max_unlock_attempts {
            warn!(serial = %self.serial, attempts = *attempts, "unlock attempts exhausted, entering cooldown");
            *self.locked_out_until.lock().await = Some(Instant::now() + self.unlock_cooldown);
        }
    }

    async fn unlock_locked_out(&self) -> bool {
        let mut guard = self.locked_out_until.lock().await;
        match *guard {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *guard = None;
                *self.unlock_attempts.lock().await = 0;
                false
            }
            None => false,
        }
    }

    pub async fn launch_app(&self, package: &str) -> Result<()> {
        self.clear_overlays().await;
        self.shell(&["monkey", "-p", package, "-c", "android.intent.category.LAUNCHER", "1"]).await?;
        self.invalidate_ui_cache().await;
        Ok(())
    }

    /// Up to 8 progressively more forceful strategies to dismiss the status
    /// bar / notification shade before launching an app (spec.md §4.2).
    /// Stops at the first one that leaves the foreground clean.
    async fn clear_overlays(&self) {
        for n in 1..=OVERLAY_CLEAR_STRATEGIES {
            let _ = self.overlay_clear_strategy(n).await;
            match self.lock_state().await {
                Ok(LockState::NotificationShade) => continue,
                _ => return,
            }
        }
    }

    async fn overlay_clear_strategy(&self, n: usize) -> Result<()> {
        match n {
            1 | 5 => self.shell(&["cmd", "statusbar", "collapse"]).await.map(|_| ()),
            2 | 7 => self.shell(&["am", "broadcast", "-a", "android.intent.action.CLOSE_SYSTEM_DIALOGS"]).await.map(|_| ()),
            3 | 8 => self.shell(&["input", "keyevent", "KEYCODE_HOME"]).await.map(|_| ()),
            4 => {
                self.shell(&["input", "swipe", "540", "300", "540", "1000", "150"]).await?;
                self.shell(&["input", "swipe", "540", "1000", "540", "300", "150"]).await.map(|_| ())
            }
            6 => self.shell(&["input", "keyevent", "KEYCODE_BACK"]).await.map(|_| ()),
            _ => Ok(()),
        }
    }

    pub async fn force_stop(&self, package: &str) -> Result<()> {
        self.shell(&["am", "force-stop", package]).await?;
        self.invalidate_ui_cache().await;
        Ok(())
    }

    pub async fn tap(&self, x: i32, y: i32) -> Result<()> {
        self.shell(&["input", "tap", &x.to_string(), &y.to_string()]).await?;
        self.invalidate_ui_cache().await;
        Ok(())
    }

    pub async fn swipe(&self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u64) -> Result<()> {
        self.shell(&["input", "swipe", &x1.to_string(), &y1.to_string(), &x2.to_string(), &y2.to_string(), &duration_ms.to_string()])
            .await?;
        self.invalidate_ui_cache().await;
        Ok(())
    }
}

/// Combines power state, keyguard flags, and the focused window's class
/// into one of the six lock states (spec.md §4.2/§9). Kept as one pure
/// function so the Samsung NotificationShade-vs-lockscreen ambiguity has
/// exactly one place to live: Samsung's lock-screen window identifies as
/// `NotificationShade`, so that class alone can't distinguish "shade is
/// open" from "device is locked" — only the keyguard flag can.
fn resolve_lock_state(power_awake: bool, dreaming: bool, keyguard_showing: bool, focused_window: &str) -> LockState {
    if !power_awake {
        return LockState::ScreenOff;
    }
    if dreaming {
        return LockState::Dreaming;
    }
    if focused_window.contains("NotificationShade") {
        return if keyguard_showing { LockState::LockedLockscreen } else { LockState::NotificationShade };
    }
    if keyguard_showing {
        if focused_window.contains("PinEntry") || focused_window.contains("KeyguardPinView") {
            return LockState::LockedPinEntry;
        }
        return LockState::LockedLockscreen;
    }
    LockState::Unlocked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::backend::AdaptiveSelector;

    fn connection(max_unlock_attempts: u32, cooldown_secs: u64) -> DeviceConnection {
        DeviceConnection::new("emulator-5554".into(), Arc::new(AdaptiveSelector::new(50)), 1000, 1000, max_unlock_attempts, cooldown_secs)
    }

    #[tokio::test]
    async fn stays_unlocked_below_the_max_attempt_count() {
        let conn = connection(3, 60);
        conn.record_unlock_attempt().await;
        conn.record_unlock_attempt().await;
        assert!(!conn.unlock_locked_out().await);
    }

    #[tokio::test]
    async fn enters_cooldown_exactly_at_the_max_attempt_count() {
        let conn = connection(3, 60);
        conn.record_unlock_attempt().await;
        conn.record_unlock_attempt().await;
        conn.record_unlock_attempt().await;
        assert!(conn.unlock_locked_out().await);
    }

    #[tokio::test]
    async fn unlock_swipe_and_pin_both_reject_while_locked_out() {
        let conn = connection(1, 60);
        conn.record_unlock_attempt().await;
        assert!(conn.unlock_swipe(1080, 2280).await.is_err());
        assert!(conn.unlock_with_pin("1234").await.is_err());
    }

    #[tokio::test]
    async fn cooldown_clears_and_resets_attempts_once_it_expires() {
        let conn = connection(1, 0);
        conn.record_unlock_attempt().await;
        // cooldown of 0s has already elapsed by the time we check.
        assert!(!conn.unlock_locked_out().await);
        assert_eq!(*conn.unlock_attempts.lock().await, 0);
    }

    #[test]
    fn lock_states_are_distinguished_by_variant() {
        assert_ne!(LockState::LockedLockscreen, LockState::Unlocked);
        assert_ne!(LockState::LockedLockscreen, LockState::NotificationShade);
    }

    #[test]
    fn screen_off_wins_over_every_other_signal() {
        assert_eq!(resolve_lock_state(false, true, true, "NotificationShade"), LockState::ScreenOff);
    }

    #[test]
    fn dreaming_is_reported_even_when_keyguard_flags_are_unset() {
        assert_eq!(resolve_lock_state(true, true, false, ""), LockState::Dreaming);
    }

    #[test]
    fn samsung_notification_shade_window_with_keyguard_showing_is_locked_not_shade() {
        assert_eq!(resolve_lock_state(true, false, true, "mCurrentFocus=NotificationShade"), LockState::LockedLockscreen);
    }

    #[test]
    fn notification_shade_window_without_keyguard_is_a_real_shade() {
        assert_eq!(resolve_lock_state(true, false, false, "mCurrentFocus=NotificationShade"), LockState::NotificationShade);
    }

    #[test]
    fn pin_entry_window_is_distinguished_from_plain_lockscreen() {
        assert_eq!(resolve_lock_state(true, false, true, "mCurrentFocus=com.android.systemui/.keyguard.KeyguardPinView"), LockState::LockedPinEntry);
    }

    #[test]
    fn awake_unlocked_with_no_keyguard_flags_is_unlocked() {
        assert_eq!(resolve_lock_state(true, false, false, "mCurrentFocus=com.x/.MainActivity"), LockState::Unlocked);
    }
}
