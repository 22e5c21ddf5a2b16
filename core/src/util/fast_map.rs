//! Fx-hashed map aliases used for registries, class method tables and
//! per-frame reference tables. Keys are short strings or small integers.

pub type FastHashMap<K, V> = rustc_hash::FxHashMap<K, V>;

#[inline]
pub fn fast_hash_map_new<K, V>() -> FastHashMap<K, V> {
    rustc_hash::FxHashMap::default()
}
