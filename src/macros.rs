#![allow(unused_macros)]

/// Helper macro for locking items
///
/// ```rust, ignore
///  let mut index = lock!(registry.index);
///  index.insert(key, 0);
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().expect("Failed to acquire lock")
    };
}

/// Helper macro for reading locked items
///
/// ```rust, ignore
///  let map = read_lock!(arena.map);
///  let byte = map[offset];
/// ```
macro_rules! read_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.read().expect("Failed to acquire read lock")
    };
}

/// Helper macro for writing to locked items
///
/// ```rust, ignore
///  let mut map = write_lock!(arena.map);
///  map[offset] = 0xff;
/// ```
macro_rules! write_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.write().expect("Failed to acquire write lock")
    };
}
