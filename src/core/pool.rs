//! Bounded worker pool over `rayon::scope`.
//!
//! A fixed number of workers (clamped to `[1, 32]`) pull items through a
//! shared atomic cursor until it is exhausted. Completion order is
//! nondeterministic; results are returned in original item order. A cancel
//! flag is consulted between items, which is the cooperative cancellation
//! point for long pipelines.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Default worker count when the caller does not size the pool.
pub const DEFAULT_JOBS: usize = 4;
/// Hard ceiling on pool width.
pub const MAX_JOBS: usize = 32;

/// Clamp a requested concurrency to the supported range.
pub fn clamp_jobs(requested: usize) -> usize {
    requested.clamp(1, MAX_JOBS)
}

/// Run `worker` over `items` with at most `jobs` workers.
///
/// Returns one slot per item, in input order. A slot is `None` only when the
/// cancel flag was raised before that item was pulled.
pub fn run_pool<T, R, F>(
    items: &[T],
    jobs: usize,
    cancel: &AtomicBool,
    worker: F,
) -> Vec<Option<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T, usize) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let jobs = clamp_jobs(jobs).min(items.len());
    let cursor = AtomicUsize::new(0);
    let slots: Vec<Mutex<Option<R>>> = (0..items.len()).map(|_| Mutex::new(None)).collect();

    rayon::scope(|s| {
        for _ in 0..jobs {
            s.spawn(|_| {
                loop {
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    let idx = cursor.fetch_add(1, Ordering::SeqCst);
                    if idx >= items.len() {
                        break;
                    }
                    let out = worker(&items[idx], idx);
                    *slots[idx].lock().unwrap() = Some(out);
                }
            });
        }
    });

    slots
        .into_iter()
        .map(|m| m.into_inner().unwrap())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_clamp_jobs_bounds() {
        assert_eq!(clamp_jobs(0), 1);
        assert_eq!(clamp_jobs(4), 4);
        assert_eq!(clamp_jobs(1000), MAX_JOBS);
    }

    #[test]
    fn test_results_ordered_by_input_index() {
        let items: Vec<u64> = (0..100).collect();
        let cancel = AtomicBool::new(false);
        let results = run_pool(&items, 8, &cancel, |item, idx| (*item, idx));
        for (i, slot) in results.iter().enumerate() {
            let (item, idx) = slot.expect("completed");
            assert_eq!(item as usize, i);
            assert_eq!(idx, i);
        }
    }

    #[test]
    fn test_every_item_processed_exactly_once() {
        let items: Vec<usize> = (0..257).collect();
        let cancel = AtomicBool::new(false);
        let seen = AtomicUsize::new(0);
        let results = run_pool(&items, 32, &cancel, |item, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            *item
        });
        assert_eq!(seen.load(Ordering::SeqCst), items.len());
        let distinct: BTreeSet<usize> = results.into_iter().flatten().collect();
        assert_eq!(distinct.len(), items.len());
    }

    #[test]
    fn test_cancel_skips_remaining_items() {
        let items: Vec<usize> = (0..64).collect();
        let cancel = AtomicBool::new(true);
        let results = run_pool(&items, 4, &cancel, |item, _| *item);
        assert!(results.iter().all(|slot| slot.is_none()));
    }

    #[test]
    fn test_empty_items_returns_empty() {
        let items: Vec<usize> = Vec::new();
        let cancel = AtomicBool::new(false);
        let results = run_pool(&items, 4, &cancel, |item, _| *item);
        assert!(results.is_empty());
    }

    #[test]
    fn test_single_worker_is_sequential_over_all_items() {
        let items: Vec<usize> = (0..10).collect();
        let cancel = AtomicBool::new(false);
        let results = run_pool(&items, 1, &cancel, |item, _| item * 2);
        let collected: Vec<usize> = results.into_iter().flatten().collect();
        assert_eq!(collected, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
    }
}
