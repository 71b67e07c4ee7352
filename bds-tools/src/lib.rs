pub mod bloom_set;
pub mod lru_cache;
pub mod parachute;
pub mod timed_average;
