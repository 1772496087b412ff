//! Runtime options.
//!
//! Every option can be overridden with an environment variable prefixed
//! with `QUIESCE_` (e.g. `QUIESCE_THREAD_SUSPEND_TIMEOUT_NS=2000000000`).
//! Invalid values are rejected with a warning and the default is kept.

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])* $name: $type [$validator] = $default),*);
    ];
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),*) => [
        /// The options for an instance of the suspension core.
        #[derive(Clone, Debug)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }
        impl Options {
            /// Set an option from a string value. Returns true if the
            /// value parsed and passed the option's validator.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    $(stringify!($name) => if let Ok(parsed) = val.parse::<$type>() {
                        let validate_fn = $validator;
                        let is_valid = validate_fn(&parsed);
                        if is_valid {
                            self.$name = parsed;
                        } else {
                            warn!("Unable to set {}={:?}: invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}: can't parse value. Default value will be used.", s, val);
                        false
                    },)*
                    _ => {
                        warn!("Invalid option key: {}", s);
                        false
                    }
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };
                // Pick up QUIESCE_-prefixed env var overrides.
                const PREFIX: &str = "QUIESCE_";
                for (key, val) in std::env::vars() {
                    if let Some(rest) = key.strip_prefix(PREFIX) {
                        options.set_from_str(&rest.to_lowercase(), &val);
                    }
                }
                options
            }
        }
    ];
}

options! {
    /// Total time a suspend request may take before the requester starts
    /// producing diagnostics and, eventually, aborts in the unresponsive
    /// thread. Staged waits subdivide this value; see
    /// `ThreadList::wait_for_suspend_barrier`.
    thread_suspend_timeout_ns: u64 [|v: &u64| *v >= 100_000_000] = 4_000_000_000,
    /// Double every suspend timeout so that platform ANR detection (which
    /// produces a user-friendlier report) wins the race against our own
    /// aborts. The `anr_friendly_timeouts` cargo feature flips the default.
    anr_friendly_timeouts: bool [always_valid] = cfg!(feature = "anr_friendly_timeouts"),
}

impl Options {
    /// The suspend timeout with the ANR friendliness multiplier applied.
    pub fn effective_suspend_timeout_ns(&self) -> u64 {
        if self.anr_friendly_timeouts {
            self.thread_suspend_timeout_ns * 2
        } else {
            self.thread_suspend_timeout_ns
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout() {
        let opts = Options {
            thread_suspend_timeout_ns: 4_000_000_000,
            anr_friendly_timeouts: false,
        };
        assert_eq!(opts.effective_suspend_timeout_ns(), 4_000_000_000);
    }

    #[test]
    fn set_from_str() {
        let mut opts = Options {
            thread_suspend_timeout_ns: 4_000_000_000,
            anr_friendly_timeouts: false,
        };
        assert!(opts.set_from_str("thread_suspend_timeout_ns", "2000000000"));
        assert_eq!(opts.thread_suspend_timeout_ns, 2_000_000_000);
        assert!(opts.set_from_str("anr_friendly_timeouts", "true"));
        assert_eq!(opts.effective_suspend_timeout_ns(), 4_000_000_000);
    }

    #[test]
    fn reject_invalid() {
        let mut opts = Options {
            thread_suspend_timeout_ns: 4_000_000_000,
            anr_friendly_timeouts: false,
        };
        // Below the 100ms floor.
        assert!(!opts.set_from_str("thread_suspend_timeout_ns", "1000"));
        assert_eq!(opts.thread_suspend_timeout_ns, 4_000_000_000);
        assert!(!opts.set_from_str("thread_suspend_timeout_ns", "not-a-number"));
    }
}
