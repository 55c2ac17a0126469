//! Copy-on-write snapshot cell.
//!
//! Readers take the current snapshot without blocking. Writers build a new
//! snapshot from the one they read and publish it with compare-and-swap,
//! rebuilding from the fresh value whenever another writer got there first.
//! A failed swap always means some other writer succeeded, so the retry loop
//! is lock-free.

use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};

pub(crate) struct SnapshotCell<T> {
    inner: ArcSwap<T>,
}

impl<T> SnapshotCell<T> {
    pub(crate) fn new(initial: T) -> Self {
        Self {
            inner: ArcSwap::from_pointee(initial),
        }
    }

    /// The currently visible snapshot.
    pub(crate) fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the snapshot with one derived from it.
    ///
    /// `build` receives the current snapshot and returns the next one plus a
    /// value handed back to the caller, or `None` to leave the cell as is.
    /// `build` may run more than once under contention.
    pub(crate) fn update<R>(&self, mut build: impl FnMut(&T) -> Option<(T, R)>) -> Option<R> {
        let mut current = self.inner.load_full();
        loop {
            let (next, out) = build(current.as_ref())?;
            let previous = self.inner.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&*previous, &current) {
                return Some(out);
            }
            current = Guard::into_inner(previous);
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_returns_none_without_swapping() {
        let cell = SnapshotCell::new(vec![1, 2, 3]);
        let before = cell.load();
        let out: Option<()> = cell.update(|_| None);
        assert!(out.is_none());
        assert!(Arc::ptr_eq(&before, &cell.load()));
    }

    #[test]
    fn readers_keep_their_snapshot_after_update() {
        let cell = SnapshotCell::new(vec![1]);
        let old = cell.load();
        cell.update(|v| {
            let mut next = v.clone();
            next.push(2);
            Some((next, ()))
        });
        assert_eq!(*old, vec![1]);
        assert_eq!(*cell.load(), vec![1, 2]);
    }

    #[test]
    fn concurrent_writers_lose_no_updates() {
        let cell = Arc::new(SnapshotCell::new(Vec::<usize>::new()));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        cell.update(|v| {
                            let mut next = v.clone();
                            next.push(t * 1000 + i);
                            Some((next, ()))
                        });
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(cell.load().len(), 8 * 200);
    }
}
