pub mod config;
pub mod dispatch;
pub mod error;
pub mod fleet;
pub mod fsutil;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod sync;
pub mod worker;
