mod atomic_executor;
mod order_monitor;

pub use atomic_executor::{AtomicExecutor, LegFill};
pub use order_monitor::OrderMonitor;
