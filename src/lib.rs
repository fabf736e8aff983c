//! Converge compiles a declarative configuration model into a concrete set
//! of typed resource records.
//!
//! Evaluation is neither eager nor lazy: it is a monotonic constraint
//! propagation fixpoint over typed result variables. Statements may
//! reference values that have not been produced yet; they suspend on the
//! open variable and are re-run when it binds, and the scheduler closes
//! stalled variables in deterministic freeze waves until the whole model is
//! frozen.
//!
//! The `converge-core` crate holds the data model (values, types, result
//! variables, instances, indices); `converge-exec` holds the statement
//! runtime, the queue scheduler, the two-phase loader and the exporter.
//!
//! ```
//! use converge::prelude::*;
//!
//! let mut project = Project::new();
//! project.add_module(Module::new(
//!     "config",
//!     vec![
//!         Definition::entity(
//!             "Host",
//!             vec![],
//!             vec![AttributeDecl::new(
//!                 "name",
//!                 TypeSpec::plain("string"),
//!                 None,
//!                 Location::new("main", 1),
//!             )],
//!             Location::new("main", 1),
//!         ),
//!         Definition::index("Host", vec!["name"], Location::new("main", 2)),
//!     ],
//!     Block::new(vec![Stmt::assign(
//!         "h",
//!         Expr::construct(
//!             "Host",
//!             vec![("name", Expr::literal("a", Location::new("main", 3)))],
//!             Location::new("main", 3),
//!         ),
//!         Location::new("main", 3),
//!     )]),
//! ));
//! let outcome = project.compile();
//! assert!(outcome.success);
//! assert_eq!(outcome.export.instances_of("config::Host").len(), 1);
//! ```

pub use converge_core::*;
pub use converge_exec::*;

pub mod prelude {
    pub use converge_core::{
        CompileError, Diagnostics, EntityDefinition, Instance, Location, Multiplicity,
        PluginFunction, Type, Value,
    };
    pub use converge_exec::{
        AttributeDecl, Block, CompileOptions, CompileOutcome, Definition, Expr, ModelExport,
        Module, Project, RelationEnd, ResourceRecord, Stmt, TypeSpec,
    };
}
