//! Feature selection and the lock-free activation word.
//!
//! The activation word packs the active and paused bits together with the
//! feature set into a single `AtomicU32` so that hot paths (label push/pop,
//! marker insertion) can decide whether to do any work at all without taking
//! the profiler lock.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Profiler features. At most 30 bits; the two top bits of the activation
    /// word are reserved for the active and paused flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        const MAIN_THREAD_IO = 1 << 0;
        const PRIVACY = 1 << 1;
        const RESPONSIVENESS = 1 << 2;
        const SCREENSHOTS = 1 << 3;
        const STACK_WALK = 1 << 4;
        const LEAF = 1 << 5;
        /// Profile all registered threads, not just the main thread.
        const THREADS = 1 << 6;
        /// Sample counters and markers only; never suspend threads.
        const NO_STACK_SAMPLING = 1 << 7;
    }
}

impl Features {
    pub fn default_features() -> Features {
        Features::LEAF | Features::STACK_WALK
    }

    /// Extra features enabled by default for startup profiling. Startup is
    /// heavy on main thread IO, so capture it.
    pub fn startup_extra_default_features() -> Features {
        Features::MAIN_THREAD_IO
    }

    pub const NAMES: [(&'static str, Features); 8] = [
        ("mainthreadio", Features::MAIN_THREAD_IO),
        ("privacy", Features::PRIVACY),
        ("responsiveness", Features::RESPONSIVENESS),
        ("screenshots", Features::SCREENSHOTS),
        ("stackwalk", Features::STACK_WALK),
        ("leaf", Features::LEAF),
        ("threads", Features::THREADS),
        ("nostacksampling", Features::NO_STACK_SAMPLING),
    ];

    pub fn from_feature_name(name: &str) -> Option<Features> {
        if name == "default" {
            return Some(Features::default_features());
        }
        Features::NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, f)| *f)
    }
}

const ACTIVE: u32 = 1 << 31;
const PAUSED: u32 = 1 << 30;

static ACTIVE_AND_FEATURES: AtomicU32 = AtomicU32::new(0);

/// The racy activation flag. Setters run under the profiler lock at
/// start/stop/pause/resume; readers are lock-free and may observe a slightly
/// stale value, which is fine for the short-circuit checks they guard.
pub(crate) struct RacyFeatures;

impl RacyFeatures {
    pub fn set_active(features: Features) {
        ACTIVE_AND_FEATURES.store(ACTIVE | features.bits(), Ordering::Relaxed);
    }

    pub fn set_inactive() {
        ACTIVE_AND_FEATURES.store(0, Ordering::Relaxed);
    }

    pub fn set_paused() {
        ACTIVE_AND_FEATURES.fetch_or(PAUSED, Ordering::Relaxed);
    }

    pub fn set_unpaused() {
        ACTIVE_AND_FEATURES.fetch_and(!PAUSED, Ordering::Relaxed);
    }

    pub fn is_active() -> bool {
        ACTIVE_AND_FEATURES.load(Ordering::Relaxed) & ACTIVE != 0
    }

    pub fn is_paused() -> bool {
        ACTIVE_AND_FEATURES.load(Ordering::Relaxed) & PAUSED != 0
    }

    pub fn is_active_with_feature(feature: Features) -> bool {
        let word = ACTIVE_AND_FEATURES.load(Ordering::Relaxed);
        (word & ACTIVE != 0) && (word & feature.bits() != 0)
    }

    pub fn is_active_without_privacy() -> bool {
        let word = ACTIVE_AND_FEATURES.load(Ordering::Relaxed);
        (word & ACTIVE != 0) && (word & Features::PRIVACY.bits() == 0)
    }

    pub fn is_active_and_unpaused_without_privacy() -> bool {
        let word = ACTIVE_AND_FEATURES.load(Ordering::Relaxed);
        (word & ACTIVE != 0)
            && (word & PAUSED == 0)
            && (word & Features::PRIVACY.bits() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The activation word is process-global, so exercise the whole life
    // cycle in a single test to avoid interference between tests.
    #[test]
    fn activation_word_round_trip() {
        assert!(!RacyFeatures::is_active());

        RacyFeatures::set_active(Features::STACK_WALK | Features::THREADS);
        assert!(RacyFeatures::is_active());
        assert!(RacyFeatures::is_active_with_feature(Features::STACK_WALK));
        assert!(RacyFeatures::is_active_with_feature(Features::THREADS));
        assert!(!RacyFeatures::is_active_with_feature(Features::PRIVACY));
        assert!(RacyFeatures::is_active_without_privacy());
        assert!(RacyFeatures::is_active_and_unpaused_without_privacy());

        RacyFeatures::set_paused();
        assert!(RacyFeatures::is_active());
        assert!(RacyFeatures::is_paused());
        assert!(!RacyFeatures::is_active_and_unpaused_without_privacy());
        RacyFeatures::set_unpaused();
        assert!(!RacyFeatures::is_paused());

        RacyFeatures::set_active(Features::PRIVACY);
        assert!(!RacyFeatures::is_active_without_privacy());

        RacyFeatures::set_inactive();
        assert!(!RacyFeatures::is_active());
        assert!(!RacyFeatures::is_active_with_feature(Features::STACK_WALK));
    }

    #[test]
    fn feature_names_parse() {
        assert_eq!(Features::from_feature_name("stackwalk"), Some(Features::STACK_WALK));
        assert_eq!(
            Features::from_feature_name("nostacksampling"),
            Some(Features::NO_STACK_SAMPLING)
        );
        assert_eq!(Features::from_feature_name("bogus"), None);
    }
}
