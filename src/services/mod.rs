pub mod allocator;
pub mod correlator;
pub mod encryption;
pub mod executor;
pub mod scheduler;
pub mod session;
