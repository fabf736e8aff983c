//! The executor layer of the converge engine: the statement runtime, the
//! three-queue fixpoint scheduler, the two-phase loader and the exporter
//! sink.
//!
//! A [`Project`](crate::Project) bundles modules and plugins; `compile`
//! first defines and normalizes every type (Phase A), then emits the
//! executable statements and drives the scheduler until the model freezes
//! (Phase B).

pub mod ast;
pub mod export;
pub mod loader;
pub mod ops;
pub mod scheduler;
pub mod scope;
pub mod statement;

pub use crate::ast::{
    AttributeDecl, Block, Definition, Expr, ImplementClause, Module, NodeId, RelationEnd, Stmt,
    TypeSpec,
};
pub use crate::export::{export_model, ModelExport, ResourceRecord};
pub use crate::loader::{CompileOutcome, Project};
pub use crate::ops::{binary, const_eval, unary_not, BinaryFn, BINARY_OPERATORS};
pub use crate::scheduler::{CompileOptions, Engine, MAX_ITERATIONS};
pub use crate::scope::Scope;
pub use crate::statement::{
    BlockedOn, Effects, Eval, Poll, PromiseTarget, StatementInstance, StatementKind,
};
