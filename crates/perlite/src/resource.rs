use std::{
    fmt,
    time::{Duration, Instant},
};

/// Threshold in bytes above which `check_large_result` is consulted.
///
/// Operations that may produce results larger than this threshold (100KB) should call
/// `check_large_result` before performing the operation, so that `'x' x 1e9` or
/// `1 .. 2147483648` is rejected before the memory is committed.
pub const LARGE_RESULT_THRESHOLD: usize = 100_000;

/// Default recursion ceiling for native call frames.
///
/// Perl itself warns at 100 via the `recursion` category; we allow far more but
/// stop before the host stack does.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1_000;

/// Error returned when a resource limit is exceeded during execution.
///
/// These are not `die`-able conditions: `eval` does not catch them, and the
/// interpreter surfaces them to the embedder as fatal diagnostics.
#[derive(Debug, Clone)]
pub enum ResourceError {
    /// Maximum number of cell allocations exceeded.
    Allocation { limit: usize, count: usize },
    /// Maximum bytecode operations exceeded.
    Operation { limit: usize, count: usize },
    /// Maximum execution time exceeded.
    Time { limit: Duration, elapsed: Duration },
    /// Maximum memory usage exceeded, or a single over-large result.
    Memory { limit: usize, used: usize },
    /// Maximum native recursion depth exceeded.
    Recursion { limit: usize, depth: usize },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation { limit, count } => {
                write!(f, "allocation limit exceeded: {count} > {limit}")
            }
            Self::Operation { limit, count } => {
                write!(f, "operation limit exceeded: {count} > {limit}")
            }
            Self::Time { limit, elapsed } => {
                write!(f, "time limit exceeded: {elapsed:?} > {limit:?}")
            }
            Self::Memory { limit, used } => {
                write!(f, "Out of memory! ({used} bytes > {limit} bytes)")
            }
            Self::Recursion { .. } => {
                write!(f, "Deep recursion limit exceeded")
            }
        }
    }
}

impl std::error::Error for ResourceError {}

/// Trait for tracking resource usage during compilation and execution.
///
/// Implementations can enforce limits on allocations, time, and memory. The
/// default [`NoLimitTracker`] compiles every check away; [`LimitedTracker`]
/// enforces the ceilings in a [`ResourceLimits`].
pub trait ResourceTracker: fmt::Debug {
    /// Called before each heap cell allocation.
    ///
    /// # Arguments
    /// * `get_size` - Lazily computed approximate size in bytes.
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError>;

    /// Called before growing an existing container (push, hash insert, splice).
    ///
    /// Routes through `on_allocate` by default so container growth still counts
    /// against the allocation budget.
    fn on_container_insert(&mut self) -> Result<(), ResourceError> {
        self.on_allocate(|| 0)
    }

    /// Called at statement boundaries to check operation and time limits.
    fn check_time(&mut self) -> Result<(), ResourceError>;

    /// Called before pushing a native call frame.
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError>;

    /// Called before operations that may produce large results (>100KB),
    /// e.g. `x` repetition, range materialisation, `pack` with huge counts.
    fn check_large_result(&self, estimated_bytes: usize) -> Result<(), ResourceError>;

    /// Total allocations tracked, if this tracker records them.
    fn allocation_count(&self) -> Option<usize> {
        None
    }

    /// Current approximate memory usage in bytes, if tracked.
    fn current_memory_bytes(&self) -> Option<usize> {
        None
    }
}

/// Resource limits for a [`LimitedTracker`].
///
/// `None` fields are unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum number of heap cell allocations.
    pub max_allocations: Option<usize>,
    /// Maximum number of statement-boundary checks (a proxy for executed ops).
    pub max_operations: Option<usize>,
    /// Wall-clock execution ceiling.
    pub max_duration: Option<Duration>,
    /// Approximate memory ceiling in bytes.
    pub max_memory: Option<usize>,
    /// Native recursion ceiling; defaults to [`DEFAULT_MAX_RECURSION_DEPTH`].
    pub max_recursion_depth: Option<usize>,
}

/// Tracker with no limits beyond the default recursion ceiling.
///
/// All checks are trivially `Ok`, so with monomorphization the checks cost
/// nothing in release builds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimitTracker;

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn on_allocate(&mut self, _get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn check_time(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        if current_depth >= DEFAULT_MAX_RECURSION_DEPTH {
            return Err(ResourceError::Recursion { limit: DEFAULT_MAX_RECURSION_DEPTH, depth: current_depth });
        }
        Ok(())
    }

    #[inline]
    fn check_large_result(&self, _estimated_bytes: usize) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// Tracker enforcing the ceilings of a [`ResourceLimits`].
#[derive(Debug, Clone)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    allocation_count: usize,
    operation_count: usize,
    current_memory: usize,
    started: Instant,
}

impl LimitedTracker {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits, allocation_count: 0, operation_count: 0, current_memory: 0, started: Instant::now() }
    }

    /// Resets the wall clock, e.g. between `compile` and `run`.
    pub fn restart_clock(&mut self) {
        self.started = Instant::now();
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        self.allocation_count += 1;
        if let Some(limit) = self.limits.max_allocations
            && self.allocation_count > limit
        {
            return Err(ResourceError::Allocation { limit, count: self.allocation_count });
        }
        if let Some(limit) = self.limits.max_memory {
            self.current_memory += get_size();
            if self.current_memory > limit {
                return Err(ResourceError::Memory { limit, used: self.current_memory });
            }
        }
        Ok(())
    }

    fn check_time(&mut self) -> Result<(), ResourceError> {
        self.operation_count += 1;
        if let Some(limit) = self.limits.max_operations
            && self.operation_count > limit
        {
            return Err(ResourceError::Operation { limit, count: self.operation_count });
        }
        // Checking the clock on every boundary would dominate tight loops.
        if self.operation_count % 1024 == 0
            && let Some(limit) = self.limits.max_duration
        {
            let elapsed = self.started.elapsed();
            if elapsed > limit {
                return Err(ResourceError::Time { limit, elapsed });
            }
        }
        Ok(())
    }

    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        let limit = self.limits.max_recursion_depth.unwrap_or(DEFAULT_MAX_RECURSION_DEPTH);
        if current_depth >= limit {
            return Err(ResourceError::Recursion { limit, depth: current_depth });
        }
        Ok(())
    }

    fn check_large_result(&self, estimated_bytes: usize) -> Result<(), ResourceError> {
        if estimated_bytes < LARGE_RESULT_THRESHOLD {
            return Ok(());
        }
        if let Some(limit) = self.limits.max_memory
            && self.current_memory.saturating_add(estimated_bytes) > limit
        {
            return Err(ResourceError::Memory { limit, used: self.current_memory + estimated_bytes });
        }
        Ok(())
    }

    fn allocation_count(&self) -> Option<usize> {
        Some(self.allocation_count)
    }

    fn current_memory_bytes(&self) -> Option<usize> {
        Some(self.current_memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_limit_tracker_allows_everything_small() {
        let mut t = NoLimitTracker;
        assert!(t.on_allocate(|| 1 << 20).is_ok());
        assert!(t.check_time().is_ok());
        assert!(t.check_large_result(usize::MAX).is_ok());
        assert!(t.check_recursion_depth(10).is_ok());
        assert!(t.check_recursion_depth(DEFAULT_MAX_RECURSION_DEPTH).is_err());
    }

    #[test]
    fn limited_tracker_enforces_allocation_ceiling() {
        let mut t = LimitedTracker::new(ResourceLimits { max_allocations: Some(2), ..Default::default() });
        assert!(t.on_allocate(|| 8).is_ok());
        assert!(t.on_allocate(|| 8).is_ok());
        assert!(matches!(t.on_allocate(|| 8), Err(ResourceError::Allocation { limit: 2, count: 3 })));
    }

    #[test]
    fn limited_tracker_enforces_memory_on_large_results() {
        let t = LimitedTracker::new(ResourceLimits { max_memory: Some(1 << 20), ..Default::default() });
        assert!(t.check_large_result(64).is_ok());
        assert!(matches!(t.check_large_result(1 << 21), Err(ResourceError::Memory { .. })));
    }
}
