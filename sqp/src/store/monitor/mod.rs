mod base;

pub use base::MonitorStore;
