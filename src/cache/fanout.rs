//! Concurrent dispatch of per-shard backend calls on the blocking path.

use std::thread;

/// Upper bound on scoped threads started by one [`scatter`] call.
pub(crate) const MAX_FANOUT: usize = 16;

/// Run `op` on every item concurrently and collect the results in item order.
///
/// Items are split into at most [`MAX_FANOUT`] contiguous runs, each handled
/// by one scoped thread.
pub(crate) fn scatter<T, R, F>(items: &[T], op: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if items.len() <= 1 {
        return items.iter().map(&op).collect();
    }

    let run = items.len().div_ceil(MAX_FANOUT);
    thread::scope(|scope| {
        let op = &op;
        let handles: Vec<_> = items
            .chunks(run)
            .map(|part| scope.spawn(move || part.iter().map(op).collect::<Vec<R>>()))
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    })
}
