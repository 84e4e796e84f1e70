//! parsh-types: the parser-facing interface of parsh.
//!
//! This crate holds the types shared between the parser (which produces
//! `CommandTree`s), the scheduler kernel (which orders them), and the
//! evaluator (which runs them and reports an `ExitStatus`). It is a leaf
//! crate with no async deps.

pub mod ast;
pub mod status;

pub use ast::{
    Assign, CommandTree, Redirect, RedirectKind, RedirectTarget, Word,
};
pub use status::ExitStatus;
