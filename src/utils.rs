use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a worker panicked while holding it.
///
/// Every shared list in the pipeline holds plain data whose invariants are
/// re-established on the next operation, so a poisoned lock is still usable.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Round `size` up to a whole number of pages
pub fn page_align(size: usize) -> usize {
    let page = page_size::get().max(1);
    size.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_align_rounds_up() {
        let page = page_size::get();
        assert_eq!(page_align(1), page);
        assert_eq!(page_align(page), page);
        assert_eq!(page_align(page + 1), 2 * page);
        assert_eq!(page_align(0), 0);
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let shared = std::sync::Arc::new(Mutex::new(5));
        let clone = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert_eq!(*lock(&shared), 5);
    }
}
