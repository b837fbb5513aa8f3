//! Per-participant knobs for local GC behavior.

/// Controls how aggressively a single thread participates in garbage
/// collection. Most callers never touch this; it exists for
/// latency-sensitive code paths that want to defer or disable
/// reclamation locally, mirroring the `enable_gc_scope!`/
/// `disable_gc_scope!` macros built on top of it.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Will this thread run the local collector. Default `true`.
    pub local_gc: bool,
    /// Will this thread attempt to advance the global epoch. Default `true`.
    pub global_gc: bool,
    /// Migrate local garbage to the global chain instead of collecting
    /// it directly. Default `true`.
    pub migrate_local: bool,
    /// Forcibly disables GC regardless of the flags above, so that a
    /// misbehaving dependency can't reintroduce latency spikes by
    /// flipping `local_gc`/`global_gc` back on. Default `false`.
    pub force_no_gc: bool,
    /// Garbage-count threshold that triggers a collection attempt.
    /// Default `32`.
    pub gc_threshold: usize,
    /// Maximum items reclaimed in one collection pass. Default
    /// unbounded.
    pub items_per_gc: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            local_gc: true,
            global_gc: true,
            migrate_local: true,
            force_no_gc: false,
            gc_threshold: 32,
            items_per_gc: usize::MAX,
        }
    }
}

impl Options {
    pub fn will_run_local_gc(&self) -> bool {
        !self.force_no_gc && self.local_gc
    }

    pub fn will_run_global_gc(&self) -> bool {
        !self.force_no_gc && self.global_gc
    }
}
