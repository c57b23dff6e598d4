// Process signal integration
//
// A single listener thread is installed on first use. On SIGINT or SIGTERM
// it sets every registered flag that is still alive.

use parking_lot::{const_mutex, Mutex};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use crate::queue::{Flag, WeakFlag};

static REGISTRY: Mutex<Vec<WeakFlag>> = const_mutex(Vec::new());
static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static LISTENER: OnceLock<bool> = OnceLock::new();

fn ensure_listener() -> bool {
    *LISTENER.get_or_init(|| {
        let mut signals = match Signals::new([SIGINT, SIGTERM]) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Signal handlers unavailable: {}", e);
                return false;
            }
        };
        let spawned = std::thread::Builder::new()
            .name("datamux-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    tracing::info!("Received signal {}, stopping tasks", signal);
                    INTERRUPTED.store(true, Ordering::SeqCst);
                    trigger();
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Could not start signal listener: {}", e);
            return false;
        }
        true
    })
}

/// Set `flag` when the process receives SIGINT or SIGTERM.
pub fn register(flag: &Flag) {
    ensure_listener();
    let mut registry = REGISTRY.lock();
    registry.retain(|w| w.upgrade().is_some());
    registry.push(flag.downgrade());
}

/// Set every registered flag, as a signal would.
pub fn trigger() {
    set_all(&REGISTRY.lock());
}

fn set_all(flags: &[WeakFlag]) {
    for flag in flags.iter().filter_map(WeakFlag::upgrade) {
        flag.set();
    }
}

/// True once SIGINT or SIGTERM has been received.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_all_skips_dropped_flags() {
        let live = Flag::new();
        let dropped = Flag::new();
        let flags = vec![live.downgrade(), dropped.downgrade()];
        drop(dropped);

        set_all(&flags);
        assert!(live.is_set());
    }

    #[test]
    fn test_register_prunes_dead_entries() {
        let kept = Flag::new();
        register(&kept);
        register(&Flag::new());
        register(&Flag::new());
        let registry = REGISTRY.lock();
        assert!(registry.iter().any(|w| w.upgrade().map(|f| f.same_flag(&kept)).unwrap_or(false)));
        assert!(!kept.is_set());
    }
}
