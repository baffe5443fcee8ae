use eyre::Result;
use std::future::Future;

use crate::config::WINDOW_SIZE;

/// Fixed ring of per-block values, slot `block % WINDOW_SIZE`.
///
/// Replacing or evicting a slot drops its previous value right away, so a sandbox held
/// here is torn down exactly once and never outlives its slot.
#[derive(Debug)]
pub struct SandboxWindow<S> {
    slots: [Option<(u64, S)>; WINDOW_SIZE],
}

impl<S> Default for SandboxWindow<S> {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }
}

impl<S> SandboxWindow<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(block: u64) -> usize {
        (block % WINDOW_SIZE as u64) as usize
    }

    pub fn get(&self, block: u64) -> Option<&S> {
        match &self.slots[Self::slot(block)] {
            Some((b, s)) if *b == block => Some(s),
            _ => None,
        }
    }

    pub fn contains(&self, block: u64) -> bool {
        self.get(block).is_some()
    }

    /// Store `value` for `block`, dropping whatever held the slot before
    pub fn insert(&mut self, block: u64, value: S) {
        self.slots[Self::slot(block)] = Some((block, value));
    }

    /// Drop every entry older than `block`
    pub fn evict_before(&mut self, block: u64) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|(b, _)| *b < block) {
                *slot = None;
            }
        }
    }

    /// Blocks currently held, ascending
    pub fn blocks(&self) -> Vec<u64> {
        let mut blocks: Vec<u64> = self.slots.iter().flatten().map(|(b, _)| *b).collect();
        blocks.sort_unstable();
        blocks
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Make the window cover `current - 10 ..= current`, opening only the missing blocks
    pub async fn fill<F, Fut>(&mut self, current: u64, mut open: F) -> Result<()>
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        let first = current.saturating_sub(WINDOW_SIZE as u64 - 1);
        self.evict_before(first);
        for block in first..=current {
            if !self.contains(block) {
                let value = open(block).await?;
                self.insert(block, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tracked {
        block: u64,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked(block: u64, drops: &Arc<AtomicUsize>) -> Tracked {
        Tracked {
            block,
            drops: drops.clone(),
        }
    }

    #[test]
    fn test_slot_reuse_drops_previous_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut window = SandboxWindow::new();
        window.insert(5, tracked(5, &drops));
        window.insert(16, tracked(16, &drops));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(window.get(5).is_none());
        assert_eq!(window.get(16).map(|t| t.block), Some(16));

        drop(window);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fill_opens_only_missing_blocks() {
        let drops = Arc::new(AtomicUsize::new(0));
        let opened = Arc::new(AtomicUsize::new(0));
        let mut window = SandboxWindow::new();

        let open = |block: u64| {
            let drops = drops.clone();
            let opened = opened.clone();
            async move {
                opened.fetch_add(1, Ordering::SeqCst);
                Ok(tracked(block, &drops))
            }
        };
        window.fill(100, open).await.unwrap();
        assert_eq!(window.blocks(), (90..=100).collect::<Vec<_>>());
        assert_eq!(opened.load(Ordering::SeqCst), 11);

        let open = |block: u64| {
            let drops = drops.clone();
            let opened = opened.clone();
            async move {
                opened.fetch_add(1, Ordering::SeqCst);
                Ok(tracked(block, &drops))
            }
        };
        window.fill(102, open).await.unwrap();
        assert_eq!(window.blocks(), (92..=102).collect::<Vec<_>>());
        assert_eq!(opened.load(Ordering::SeqCst), 13);
        assert_eq!(drops.load(Ordering::SeqCst), 2);

        window.clear();
        assert_eq!(drops.load(Ordering::SeqCst), 13);
        assert!(window.blocks().is_empty());
    }

    #[tokio::test]
    async fn test_fill_near_genesis() {
        let mut window: SandboxWindow<u64> = SandboxWindow::new();
        window.fill(3, |b| async move { Ok(b) }).await.unwrap();
        assert_eq!(window.blocks(), vec![0, 1, 2, 3]);
    }
}
