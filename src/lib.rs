pub mod backend;
pub mod config;
pub mod document;
pub mod error;
pub mod logging;
pub mod perf;
pub mod pixel;
pub mod render;

#[cfg(test)]
pub(crate) mod testing;
