mod base;

pub use base::StateStore;
