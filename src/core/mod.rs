pub mod aggregate;
pub mod analysis;
pub mod classifier;
pub mod duplicate;
pub mod fetcher;
pub mod hash;
pub mod models;
pub mod pipeline;
pub mod worker_pool;
