//! Cross-machine sharing of decoded execute segments.
//!
//! [`SharedExecuteSegments`] maps a [`SegmentKey`] (base address, content hash, arena size) to
//! a decoded segment. Each key owns its own lock, so the map itself is only locked for the
//! duration of a lookup; a thread decoding a large segment blocks other requesters of that
//! key only. Decoding for a key happens at most once while any machine holds the result, and
//! the result is published under the entry lock, so every later requester observes a fully
//! decoded segment.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvmem::{decoder::SharedExecuteSegments, MachineOptions, Machine};
//!
//! let shared = Arc::new(SharedExecuteSegments::<u64>::new(true));
//! let options = MachineOptions::default().with_shared_segments(shared.clone());
//!
//! let binary = std::fs::read("guest.elf")?;
//! let a = Machine::<u64>::from_elf(&binary, options.clone())?;
//! let b = Machine::<u64>::from_elf(&binary, options)?;
//! assert_eq!(shared.len(), 1);
//! # Ok::<(), rvmem::Error>(())
//! ```

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use dashmap::DashMap;
use tracing::debug;

use crate::{
    address::Address,
    decoder::{
        handlers::HandlerRegistry,
        segment::{DecodedExecuteSegment, SegmentKey},
    },
    Error, Result,
};

/// A shared handle to a decoded segment.
pub type SegmentHandle<A> = Arc<DecodedExecuteSegment<A>>;

/// One key of the registry: the decoded segment, if any, behind its own lock.
pub struct SegmentEntry<A: Address> {
    segment: Mutex<Option<SegmentHandle<A>>>,
}

impl<A: Address> Default for SegmentEntry<A> {
    fn default() -> Self {
        SegmentEntry {
            segment: Mutex::new(None),
        }
    }
}

impl<A: Address> SegmentEntry<A> {
    /// The current handle.
    #[must_use]
    pub fn get(&self) -> Option<SegmentHandle<A>> {
        self.segment.lock().ok().and_then(|slot| slot.clone())
    }
}

/// A registry of decoded segments shared by any number of machines.
pub struct SharedExecuteSegments<A: Address> {
    segments: DashMap<SegmentKey, Arc<SegmentEntry<A>>>,
    registry: Arc<HandlerRegistry<A>>,
    compressed: bool,
}

impl<A: Address> fmt::Debug for SharedExecuteSegments<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedExecuteSegments")
            .field("keys", &self.segments.len())
            .field("compressed", &self.compressed)
            .field("registry", &self.registry)
            .finish()
    }
}

impl<A: Address> SharedExecuteSegments<A> {
    /// Creates an empty registry with a fresh handler registry.
    ///
    /// `compressed` selects the instruction width mode all segments are decoded in. Machines
    /// configured for a different mode are rejected.
    #[must_use]
    pub fn new(compressed: bool) -> Self {
        SharedExecuteSegments::with_registry(compressed, Arc::new(HandlerRegistry::new()))
    }

    /// Creates an empty registry whose segments are decoded against `registry`.
    #[must_use]
    pub fn with_registry(compressed: bool, registry: Arc<HandlerRegistry<A>>) -> Self {
        SharedExecuteSegments {
            segments: DashMap::new(),
            registry,
            compressed,
        }
    }

    /// The handler registry every segment in this registry is decoded against.
    #[must_use]
    pub fn registry(&self) -> &Arc<HandlerRegistry<A>> {
        &self.registry
    }

    /// The instruction width mode of the registry.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// The entry of `key`, created empty if missing.
    ///
    /// The map is only locked for the lookup itself.
    #[must_use]
    pub fn get_segment(&self, key: SegmentKey) -> Arc<SegmentEntry<A>> {
        self.segments.entry(key).or_default().clone()
    }

    /// Returns the segment of `key`, decoding it with `create` if no machine holds it.
    ///
    /// Concurrent requesters of the same key wait for the first one to finish decoding.
    ///
    /// # Errors
    /// Propagates the error of `create`. The entry is left empty in that case.
    /// Returns [`Error::LockError`] if an earlier decode of `key` panicked.
    pub fn get_or_decode(
        &self,
        key: SegmentKey,
        create: impl FnOnce() -> Result<DecodedExecuteSegment<A>>,
    ) -> Result<SegmentHandle<A>> {
        let entry = self.get_segment(key);
        let mut slot = entry.segment.lock().map_err(|_| Error::LockError)?;
        if let Some(segment) = slot.as_ref() {
            debug!("Reusing shared execute segment at {:#x}", key.base);
            return Ok(segment.clone());
        }

        let segment = Arc::new(create()?);
        *slot = Some(segment.clone());
        Ok(segment)
    }

    /// Drops the registry's handle of `key` if nobody else holds it.
    pub fn remove_if_unique(&self, key: SegmentKey) {
        // Clone the entry so the map is not locked while waiting on the entry lock
        let Some(entry) = self.segments.get(&key).map(|e| e.value().clone()) else {
            return;
        };

        let Ok(mut slot) = entry.segment.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|s| Arc::strong_count(s) == 1) {
            debug!("Releasing shared execute segment at {:#x}", key.base);
            *slot = None;
        }
    }

    /// Number of keys that currently hold a decoded segment.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments
            .iter()
            .filter(|entry| entry.value().get().is_some())
            .count()
    }

    /// Returns `true` if no key holds a decoded segment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys ever requested, including released ones.
    #[must_use]
    pub fn keys(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::decoder::generate::generate_decoder_cache;

    fn decoded(shared: &SharedExecuteSegments<u64>, code: &[u8]) -> Result<DecodedExecuteSegment<u64>> {
        let mut exec = DecodedExecuteSegment::create(code, 0x1000, true)?;
        generate_decoder_cache(&mut exec, shared.registry())?;
        Ok(exec)
    }

    fn key_for(code: &[u8]) -> SegmentKey {
        let exec = DecodedExecuteSegment::<u64>::create(code, 0x1000, true).unwrap();
        SegmentKey::from_segment(&exec, 0)
    }

    const CODE: [u8; 8] = [0x13, 0x05, 0x10, 0x00, 0x73, 0x00, 0x00, 0x00];

    #[test]
    fn test_decode_once() {
        let shared = SharedExecuteSegments::<u64>::new(true);
        let decodes = AtomicUsize::new(0);
        let key = key_for(&CODE);

        let a = shared
            .get_or_decode(key, || {
                decodes.fetch_add(1, Ordering::SeqCst);
                decoded(&shared, &CODE)
            })
            .unwrap();
        let b = shared
            .get_or_decode(key, || {
                decodes.fetch_add(1, Ordering::SeqCst);
                decoded(&shared, &CODE)
            })
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(decodes.load(Ordering::SeqCst), 1);
        assert_eq!(shared.len(), 1);
    }

    #[test]
    fn test_remove_if_unique() {
        let shared = SharedExecuteSegments::<u64>::new(true);
        let key = key_for(&CODE);
        let a = shared.get_or_decode(key, || decoded(&shared, &CODE)).unwrap();

        // Still held by `a`
        shared.remove_if_unique(key);
        assert_eq!(shared.len(), 1);

        drop(a);
        shared.remove_if_unique(key);
        assert!(shared.is_empty());
        assert_eq!(shared.keys(), 1);

        // Unknown keys are ignored
        shared.remove_if_unique(key_for(&[0; 4]));
    }

    #[test]
    fn test_failed_decode_leaves_entry_empty() {
        let shared = SharedExecuteSegments::<u64>::new(true);
        let key = key_for(&CODE);
        assert!(shared
            .get_or_decode(key, || Err(invalid_program!("nope")))
            .is_err());
        assert!(shared.is_empty());
        assert!(shared.get_or_decode(key, || decoded(&shared, &CODE)).is_ok());
    }

    #[test]
    fn test_panicked_decode_poisons_entry() {
        let shared = SharedExecuteSegments::<u64>::new(true);
        let key = key_for(&CODE);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            shared.get_or_decode(key, || panic!("decoder bug"))
        }));
        assert!(result.is_err());

        assert!(matches!(
            shared.get_or_decode(key, || decoded(&shared, &CODE)),
            Err(Error::LockError)
        ));
        assert!(shared.is_empty());
        shared.remove_if_unique(key);
    }

    #[test]
    fn test_concurrent_requesters_share_one_decode() {
        let shared = Arc::new(SharedExecuteSegments::<u64>::new(true));
        let decodes = Arc::new(AtomicUsize::new(0));
        let key = key_for(&CODE);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let shared = shared.clone();
                let decodes = decodes.clone();
                std::thread::spawn(move || {
                    shared
                        .get_or_decode(key, || {
                            decodes.fetch_add(1, Ordering::SeqCst);
                            decoded(&shared, &CODE)
                        })
                        .unwrap()
                })
            })
            .collect();

        let handles: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(decodes.load(Ordering::SeqCst), 1);
    }
}
