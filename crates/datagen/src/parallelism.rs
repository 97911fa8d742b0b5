//! Effective-parallelism calculation for the trial worker pool.

/// Resolve the worker-pool size: a positive configured cap wins, otherwise
/// the hardware parallelism (1 if it cannot be determined).
pub fn effective_parallelism(configured: Option<usize>) -> usize {
    match configured {
        Some(n) if n > 0 => n,
        _ => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    }
}
