//! Git-native workspace coordination for parallel agents.
//!
//! Every active task gets its own branch and git worktree. Ground truth lives
//! in git (branches, the worktree registry, notes); `.weave/` only holds a
//! cache, locks and logs. The crate is split into:
//!
//! - **[`core`]**: Pure logic (naming, checklists, reconciliation). No I/O.
//! - **[`io`]**: git, filesystem, locks and persisted state behind narrow
//!   store traits so tests can swap in a fake.
//!
//! [`lifecycle`], [`recover`], [`validation`] and [`hook`] coordinate the two
//! to implement the CLI commands in [`cli`].

pub mod cli;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod hook;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod recover;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validation;
