//! Warehouse connection management

pub mod pool;
pub mod table;

pub use pool::{Pool, PoolConnection, WarehouseConfig};
pub use table::TableRef;
