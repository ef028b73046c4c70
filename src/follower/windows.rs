// Window planning and checkpoint reordering
//
// The planner slices [next, tree_size) into half-open fetch windows. Fetch
// workers complete windows out of order; the reorder buffer tracks the
// largest k such that everything in [next, k] is ingested, which is the only
// value a checkpoint may ever record.

use std::collections::BTreeMap;

/// Half-open range `[start, end)` of log entry indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: u64,
    pub end: u64,
}

impl Window {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Windows of at most `batch_size` covering `[next, tree_size)`.
pub fn plan_windows(next: u64, tree_size: u64, batch_size: u64) -> impl Iterator<Item = Window> {
    let batch = batch_size.max(1);
    (next..tree_size).step_by(batch as usize).map(move |start| Window {
        start,
        end: (start + batch).min(tree_size),
    })
}

/// Tracks out-of-order window completions and surfaces the contiguous
/// frontier as an inclusive max-entry value.
pub struct ReorderBuffer {
    next: u64,
    completed: BTreeMap<u64, u64>,
}

impl ReorderBuffer {
    /// `next` is the first entry index not yet durably ingested.
    pub fn new(next: u64) -> ReorderBuffer {
        ReorderBuffer { next, completed: BTreeMap::new() }
    }

    /// Record a completed window. Returns the new inclusive frontier when it
    /// advanced, None otherwise.
    pub fn complete(&mut self, window: Window) -> Option<u64> {
        if window.is_empty() {
            return None;
        }
        self.completed.insert(window.start, window.end);

        let before = self.next;
        while let Some((&start, &end)) = self.completed.first_key_value() {
            if start > self.next {
                break;
            }
            // Overlap cannot happen with a well-formed planner; tolerate it
            // by taking the max end.
            self.next = self.next.max(end);
            self.completed.remove(&start);
        }

        if self.next > before {
            Some(self.next - 1)
        } else {
            None
        }
    }

    /// Number of completed windows still waiting on an earlier gap.
    pub fn pending(&self) -> usize {
        self.completed.len()
    }
}
