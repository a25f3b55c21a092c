//! Wrap a pure function with the cache.
//!
//! The adapter sits outside the cache's core contract: it only calls
//! `get` and `put`. Requests are keyed by the function's name together with
//! its argument, so two memoized functions never share entries.

use std::time::Duration;

use memento_core::{CacheResult, KeyGenerator, Sha256KeyGenerator};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::manager::CacheManager;

/// A function whose results are looked up before being computed.
///
/// # Example
///
/// ```ignore
/// let square = Memoized::new(&cache, "square", |n: &u64| n * n);
/// assert_eq!(square.call(&12)?, 144); // computed and stored
/// assert_eq!(square.call(&12)?, 144); // served from the cache
/// ```
pub struct Memoized<'a, F, K: KeyGenerator = Sha256KeyGenerator> {
    cache: &'a CacheManager<K>,
    name: &'a str,
    ttl: Option<Duration>,
    func: F,
}

/// The request actually stored for a memoized call.
#[derive(Serialize)]
struct Call<'a, A: ?Sized> {
    function: &'a str,
    args: &'a A,
}

impl<'a, F, K: KeyGenerator> Memoized<'a, F, K> {
    pub fn new(cache: &'a CacheManager<K>, name: &'a str, func: F) -> Self {
        Self {
            cache,
            name,
            ttl: None,
            func,
        }
    }

    /// Override the cache's default TTL for results of this function.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Return the cached result for `args`, or compute, store and return it.
    ///
    /// A failed lookup is a miss. A failed store is returned as an error
    /// even though the value was computed.
    pub fn call<A, R>(&self, args: &A) -> CacheResult<R>
    where
        A: Serialize + ?Sized,
        R: Serialize + DeserializeOwned,
        F: Fn(&A) -> R,
    {
        let request = Call {
            function: self.name,
            args,
        };
        if let Some(cached) = self.cache.get(&request) {
            return Ok(cached);
        }

        let result = (self.func)(args);
        match self.ttl {
            Some(ttl) => self.cache.put_with_ttl(&request, &result, ttl)?,
            None => self.cache.put(&request, &result)?,
        }
        Ok(result)
    }

    /// Drop the cached result for `args`. Returns whether one existed.
    pub fn forget<A: Serialize + ?Sized>(&self, args: &A) -> CacheResult<bool> {
        self.cache.invalidate(&Call {
            function: self.name,
            args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memento_core::CacheConfig;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn create_test_cache() -> (CacheManager, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let config = CacheConfig::default_at(temp_dir.path().join("cache"))
            .with_metadata_map_size(10 * 1024 * 1024);
        let cache = CacheManager::open(config).expect("cache should open");
        (cache, temp_dir)
    }

    #[test]
    fn test_second_call_is_served_from_cache() {
        let (cache, _temp_dir) = create_test_cache();
        let calls = Cell::new(0u32);
        let square = Memoized::new(&cache, "square", |n: &u64| {
            calls.set(calls.get() + 1);
            n * n
        });

        assert_eq!(square.call::<_, u64>(&12u64).expect("first call"), 144);
        assert_eq!(square.call::<_, u64>(&12u64).expect("second call"), 144);
        assert_eq!(square.call::<_, u64>(&3u64).expect("other args"), 9);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_functions_do_not_share_entries() {
        let (cache, _temp_dir) = create_test_cache();
        let double = Memoized::new(&cache, "double", |n: &u64| n * 2);
        let triple = Memoized::new(&cache, "triple", |n: &u64| n * 3);

        assert_eq!(double.call::<_, u64>(&5u64).expect("double"), 10);
        assert_eq!(triple.call::<_, u64>(&5u64).expect("triple"), 15);
        assert_eq!(cache.stats().expect("stats").entry_count, 2);
    }

    #[test]
    fn test_forget_recomputes() {
        let (cache, _temp_dir) = create_test_cache();
        let calls = Cell::new(0u32);
        let shout = Memoized::new(&cache, "shout", |s: &str| {
            calls.set(calls.get() + 1);
            s.to_uppercase()
        })
        .with_ttl(Duration::from_secs(60));

        assert_eq!(shout.call::<_, String>("hi").expect("call"), "HI");
        assert!(shout.forget("hi").expect("forget"));
        assert_eq!(shout.call::<_, String>("hi").expect("call"), "HI");
        assert_eq!(calls.get(), 2);
    }
}
