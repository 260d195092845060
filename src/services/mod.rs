pub mod database;
pub mod ssh;
pub mod timeout;

#[cfg(test)]
pub(crate) mod testing;

pub use database::*;
