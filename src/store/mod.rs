pub mod cache;
pub mod certified;
pub mod clients;

pub use cache::{FileCache, MemoryCache, PersistentCache};
pub use certified::{ApplyOutcome, CertifiedStore, KeyState, StoreUpdate};
pub use clients::ClientCache;
