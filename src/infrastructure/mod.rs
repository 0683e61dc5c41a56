pub mod cache;
pub mod container;
pub mod event_bus;
pub mod mock;
pub mod persistence;
