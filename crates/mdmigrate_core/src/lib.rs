pub mod apply;
pub mod config;
pub mod filesystem;
pub mod git;
pub mod lock;
pub mod model;
pub mod notation;
pub mod remote;
pub mod report;
pub mod runtime;
pub mod store;
pub mod workspace;

#[cfg(test)]
mod testing;
