pub mod in_memory;
#[cfg(feature = "storage-postgres")]
pub mod postgres;
pub mod queue;
pub mod support;
