//! Side-effecting adapters: git, filesystem, locks and persisted state.

pub mod atomic;
pub mod completion_log;
pub mod config;
pub mod git;
pub mod init;
pub mod lock;
pub mod notes;
pub mod process;
pub mod state_cache;
pub mod stores;
