//! The option system.  Every knob the collector consults is resolved here,
//! once, before the heap is constructed.  There is no renegotiation of an
//! option mid-cycle; decision points read the final values.

use crate::util::constants::{DEFAULT_MIN_BYTES_PER_CYCLE, DEFAULT_STRESS_FACTOR};

/// How aggressively the heap limit grows relative to the live set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::EnumString, strum_macros::Display)]
pub enum GrowthMode {
    Default,
    Aggressive,
}

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($(#[$outer:meta])*$name:ident: $type:ty [$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])*$name: $type [$validator] = $default),*);
    ];
    ($($(#[$outer:meta])*$name:ident: $type:ty [$validator:expr] = $default:expr),*) => [
        /// The resolved set of collector options.
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }
        impl Options {
            /// Set an option from a string value.  Returns false (leaving the
            /// option at its previous value) if parsing or validation fails.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            self.$name = val.clone();
                        } else {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key: {}", s)
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };

                // If we have env vars that start with TIDEMARK_ and match any option
                // (such as TIDEMARK_STRESS_FACTOR), we set the option to its value
                // (if it is a valid value).  Otherwise, use the default value.
                const PREFIX: &str = "TIDEMARK_";
                for (key, val) in std::env::vars() {
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    /// Number of marker threads.
    num_gc_markers:             usize      [|v: &usize| *v > 0] = num_cpus::get(),
    /// Let the mutator run while the collector marks.
    use_concurrent_gc:          bool       [always_valid] = true,
    /// Run Eden collections between full collections.
    use_generational_gc:        bool       [always_valid] = true,
    /// Drive collections from a dedicated collector thread.  When disabled,
    /// the mutator holds the conn and drives every cycle itself.
    use_collector_thread:       bool       [always_valid] = true,
    /// The fraction of wall-clock time the mutator should get while a
    /// concurrent collection is running.
    max_mutator_utilization:    f64        [|v: &f64| *v > 0.0 && *v < 1.0] = 0.7,
    /// Length of one space-time scheduling window.
    concurrent_gc_period_ms:    f64        [|v: &f64| *v > 0.0] = 2.0,
    /// The pause budget for a stop-the-world marking increment before the
    /// collector hands marking off to the concurrent phase.
    min_gc_pause_ms:            f64        [|v: &f64| *v > 0.0] = 0.3,
    /// The mutator performs a marking increment once it has banked this many
    /// bytes of marking debt.
    gc_increment_bytes:         usize      [|v: &usize| *v > 0] = 16384,
    /// How many bytes of marking debt each allocated byte accrues while a
    /// concurrent collection is running.
    gc_increment_scale:         f64        [|v: &f64| *v >= 0.0] = 1.0,
    /// How much the mutator may allocate beyond the trigger limit while the
    /// collector is already running, before it is stalled outright.
    concurrent_gc_max_headroom: f64        [|v: &f64| *v >= 1.0] = 1.5,
    /// Collections never trigger below this many bytes allocated.
    min_bytes_per_cycle:        usize      [|v: &usize| *v > 0] = DEFAULT_MIN_BYTES_PER_CYCLE,
    /// Heap limit as a multiple of the live set after a full collection.
    heap_growth_factor:         f64        [|v: &f64| *v > 1.0] = 1.7,
    /// Growth aggressiveness.
    growth_mode:                GrowthMode [always_valid] = GrowthMode::Default,
    /// Small heaps are capped at this fraction of RAM.
    small_heap_ram_fraction:    f64        [|v: &f64| *v > 0.0 && *v <= 1.0] = 0.25,
    /// No heap grows beyond this fraction of RAM.
    large_heap_ram_fraction:    f64        [|v: &f64| *v > 0.0 && *v <= 1.0] = 0.5,
    /// Above this fraction of RAM the eden limit is tightened.
    critical_ram_fraction:      f64        [|v: &f64| *v > 0.0 && *v <= 1.0] = 0.8,
    /// `collect_now_full_if_not_done_recently` is a no-op if a full
    /// collection completed within this window.
    full_gc_recency_ms:         f64        [|v: &f64| *v >= 0.0] = 10_000.0,
    /// Force the fenced (concurrent-safe) write barrier even outside
    /// collection cycles.
    force_fenced_barrier:       bool       [always_valid] = false,
    /// Merge policy for GC requests that name no scope: when true they rank
    /// below Eden requests; when false they rank between Eden and Full.
    /// This is a documented policy choice, not inferred intent.
    unscoped_requests_are_weakest: bool    [always_valid] = true,
    /// Trigger a collection every N allocated bytes (0 disables).
    stress_factor:              usize      [always_valid] = DEFAULT_STRESS_FACTOR,
}

impl Options {
    /// Panic if the resolved options are mutually incoherent.  Called once at
    /// heap construction, before any collection can run.
    pub fn assert_coherent(&self) {
        assert!(
            self.max_mutator_utilization > 0.0 && self.max_mutator_utilization < 1.0,
            "max_mutator_utilization must leave the collector a share of the period"
        );
        assert!(self.num_gc_markers > 0, "need at least one marker thread");
        assert!(
            self.concurrent_gc_max_headroom >= 1.0,
            "headroom below 1.0 would stall the mutator before the trigger limit"
        );
        assert!(
            !(self.use_concurrent_gc && !self.use_collector_thread),
            "concurrent collection requires the dedicated collector thread"
        );
        assert!(
            self.small_heap_ram_fraction <= self.large_heap_ram_fraction,
            "small-heap RAM fraction may not exceed the large-heap fraction"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_cleanup};

    #[test]
    fn no_env_var() {
        serial_test(|| {
            let options = Options::default();
            assert_eq!(options.stress_factor, DEFAULT_STRESS_FACTOR);
            assert!(options.use_concurrent_gc);
        })
    }

    #[test]
    fn with_valid_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("TIDEMARK_STRESS_FACTOR", "4096");

                    let options = Options::default();
                    assert_eq!(options.stress_factor, 4096);
                },
                || {
                    std::env::remove_var("TIDEMARK_STRESS_FACTOR");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_value() {
        serial_test(|| {
            with_cleanup(
                || {
                    // The value cannot be parsed, so the default is kept.
                    std::env::set_var("TIDEMARK_NUM_GC_MARKERS", "abc");

                    let options = Options::default();
                    assert_eq!(options.num_gc_markers, num_cpus::get());
                },
                || {
                    std::env::remove_var("TIDEMARK_NUM_GC_MARKERS");
                },
            )
        })
    }

    #[test]
    fn rejected_by_validator() {
        serial_test(|| {
            with_cleanup(
                || {
                    // Parses fine but fails validation.
                    std::env::set_var("TIDEMARK_MAX_MUTATOR_UTILIZATION", "1.5");

                    let options = Options::default();
                    assert_eq!(options.max_mutator_utilization, 0.7);
                },
                || {
                    std::env::remove_var("TIDEMARK_MAX_MUTATOR_UTILIZATION");
                },
            )
        })
    }

    #[test]
    fn enum_option_from_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("TIDEMARK_GROWTH_MODE", "Aggressive");

                    let options = Options::default();
                    assert_eq!(options.growth_mode, GrowthMode::Aggressive);
                },
                || {
                    std::env::remove_var("TIDEMARK_GROWTH_MODE");
                },
            )
        })
    }

    #[test]
    #[should_panic]
    fn incoherent_options_panic() {
        let mut options = Options::default();
        options.use_concurrent_gc = true;
        options.use_collector_thread = false;
        options.assert_coherent();
    }
}
