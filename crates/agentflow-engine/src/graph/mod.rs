//! Graph model and structural validation.
//!
//! A `WorkflowDefinition` is checked by `validate`, which reports every
//! violation at once. A definition that passes is compiled into a
//! `WorkflowGraph`: an index over nodes in declaration order with upstream
//! and downstream adjacency and the edge feeding each input port. The
//! scheduler only ever works from a `WorkflowGraph`, so an invalid workflow
//! can never be executed.

pub mod model;
pub mod validator;

pub use model::WorkflowGraph;
pub use validator::validate;
