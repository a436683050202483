mod alert;
mod base;
mod connection;
mod monitor;
mod pipeline;
mod pool;
mod runner;
mod store;
mod warehouse;

pub use alert::*;
pub use base::*;
pub use connection::*;
pub use monitor::*;
pub use pipeline::*;
pub use pool::*;
pub use runner::*;
pub use store::*;
pub use warehouse::*;
