use crate::ast::{Block, Expr, ImplementClause, NodeId, Stmt};
use crate::ops;
use crate::scheduler::Engine;
use crate::scope::Scope;
use converge_core::{
    construct, CompileError, EntityDefinition, IndexKey, Instance, ListVariable, Location, Probe,
    ResultVariable, Slot, Value,
};
use fxhash::{FxHashMap, FxHashSet};
use itertools::Itertools;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// What a statement is currently suspended on.
#[derive(Clone)]
pub enum BlockedOn {
    /// A single-valued variable. `freezable` marks variables owned by an
    /// instance or an index store, which the scheduler may close in a freeze
    /// wave; lexical scope variables are not freezable.
    Variable {
        variable: Rc<ResultVariable>,
        freezable: bool,
    },
    List(Rc<ListVariable>),
}

impl BlockedOn {
    pub fn label(&self) -> String {
        match self {
            BlockedOn::Variable { variable, .. } => variable.label().to_string(),
            BlockedOn::List(list) => list.label().to_string(),
        }
    }
}

/// Result of evaluating an expression: a value, or the variable the
/// evaluation stalled on.
pub enum Eval {
    Value(Value),
    Blocked(BlockedOn),
}

/// Result of executing a statement. Suspension is a return value, not an
/// unwind: the scheduler registers a `Blocked` statement as a waiter and
/// re-runs it when the variable resolves.
pub enum Poll {
    Done,
    Blocked(BlockedOn),
}

/// A producer registration to release when the owning statement completes.
pub enum PromiseTarget {
    Single(Rc<ResultVariable>),
    List(Rc<ListVariable>),
}

/// Keyed side effects of one statement instance. Re-executing a statement
/// after a wake consults these so a retry recognises its own prior work
/// instead of duplicating it.
#[derive(Default)]
pub struct Effects {
    pub constructed: FxHashMap<NodeId, Rc<Instance>>,
    pub promised: FxHashSet<NodeId>,
    pub promises: Vec<PromiseTarget>,
}

/// What a scheduled statement executes.
pub enum StatementKind {
    /// A statement from a model block.
    Stmt(Rc<Stmt>),
    /// Deferred index registration: waits for the key attributes of an
    /// instance to bind, then registers it and re-checks for collisions.
    RegisterIndex {
        instance: Rc<Instance>,
        declarer: Rc<EntityDefinition>,
        position: usize,
    },
    /// An implementation candidate for one instance: evaluates the guard
    /// with `self` bound and emits the block when it holds.
    Implement {
        instance: Rc<Instance>,
        clause: Rc<ImplementClause>,
    },
}

/// One scheduled unit of work: a statement kind bound to the scope it runs
/// in. The `next_waiter` link threads the intrusive waiter chains through
/// the scheduler's arena.
pub struct StatementInstance {
    pub kind: StatementKind,
    pub scope: Rc<Scope>,
    pub namespace: String,
    pub next_waiter: Cell<Option<usize>>,
    pub effects: RefCell<Effects>,
    pub blocked_on: RefCell<Option<BlockedOn>>,
}

impl StatementInstance {
    pub fn new(kind: StatementKind, scope: Rc<Scope>, namespace: String) -> Self {
        StatementInstance {
            kind,
            scope,
            namespace,
            next_waiter: Cell::new(None),
            effects: RefCell::new(Effects::default()),
            blocked_on: RefCell::new(None),
        }
    }

    pub fn location(&self) -> Location {
        match &self.kind {
            StatementKind::Stmt(stmt) => stmt.location().clone(),
            StatementKind::RegisterIndex { instance, .. } => instance.location().clone(),
            StatementKind::Implement { clause, .. } => clause.location.clone(),
        }
    }

    /// Run until done or the first unbound variable. Must be re-entrant:
    /// every side effect behind this call is keyed in `self.effects`.
    pub fn execute(self: &Rc<Self>, engine: &mut Engine) -> Result<Poll, CompileError> {
        match &self.kind {
            StatementKind::Stmt(stmt) => self.execute_stmt(&stmt.clone(), engine),
            StatementKind::RegisterIndex {
                instance,
                declarer,
                position,
            } => self.execute_register_index(instance, declarer, *position, engine),
            StatementKind::Implement { instance, clause } => {
                self.execute_implement(instance, &clause.clone(), engine)
            }
        }
    }

    fn execute_stmt(self: &Rc<Self>, stmt: &Stmt, engine: &mut Engine) -> Result<Poll, CompileError> {
        match stmt {
            Stmt::Assign {
                name,
                value,
                location,
                node,
            } => {
                let target = self.scope.lookup(name).ok_or_else(|| {
                    CompileError::NameNotFound {
                        name: name.clone(),
                        location: location.clone(),
                    }
                })?;
                if self.effects.borrow_mut().promised.insert(node.get()) {
                    target.promise();
                    self.effects
                        .borrow_mut()
                        .promises
                        .push(PromiseTarget::Single(target.clone()));
                }
                let value = match self.eval(value, engine)? {
                    Eval::Value(v) => v,
                    Eval::Blocked(b) => return Ok(Poll::Blocked(b)),
                };
                target.set(value, location, engine)?;
                Ok(Poll::Done)
            }
            Stmt::SetAttr {
                base,
                attribute,
                value,
                location,
                node,
            } => self.write_attr(base, attribute, value, location, node, false, engine),
            Stmt::AddAttr {
                base,
                attribute,
                value,
                location,
                node,
            } => self.write_attr(base, attribute, value, location, node, true, engine),
            Stmt::For {
                variable,
                iterable,
                body,
                location,
            } => {
                let items = match self.eval(iterable, engine)? {
                    Eval::Value(Value::List(items)) => items,
                    Eval::Value(Value::Unknown) => {
                        return Err(CompileError::typing(
                            "cannot iterate over an unknown value",
                            location.clone(),
                        ));
                    }
                    Eval::Value(other) => {
                        return Err(CompileError::typing(
                            format!("cannot iterate over {} ({})", other.kind(), other),
                            location.clone(),
                        ));
                    }
                    Eval::Blocked(b) => return Ok(Poll::Blocked(b)),
                };
                for item in items {
                    let child = self.scope.child();
                    child.declare(variable).set(item, location, engine)?;
                    engine.emit_block(body, &child, &self.namespace);
                }
                Ok(Poll::Done)
            }
            Stmt::Expression { expr, .. } => match self.eval(expr, engine)? {
                Eval::Value(_) => Ok(Poll::Done),
                Eval::Blocked(b) => Ok(Poll::Blocked(b)),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_attr(
        self: &Rc<Self>,
        base: &Expr,
        attribute: &str,
        value: &Expr,
        location: &Location,
        node: &Cell<NodeId>,
        gradual: bool,
        engine: &mut Engine,
    ) -> Result<Poll, CompileError> {
        let instance = match self.eval(base, engine)? {
            Eval::Value(Value::Instance(instance)) => instance,
            Eval::Value(Value::Unknown) => {
                tracing::debug!(location = %location, "assignment to unknown target skipped");
                return Ok(Poll::Done);
            }
            Eval::Value(Value::List(_)) => {
                return Err(CompileError::typing(
                    format!("the object at {} is not an Entity but a list", location),
                    location.clone(),
                ));
            }
            Eval::Value(other) => {
                return Err(CompileError::typing(
                    format!("cannot assign an attribute on {}", other.kind()),
                    location.clone(),
                ));
            }
            Eval::Blocked(b) => return Ok(Poll::Blocked(b)),
        };

        match instance.slot(attribute) {
            Some(Slot::Single(target)) => {
                if gradual {
                    return Err(CompileError::typing(
                        format!(
                            "{} is not a multi-valued attribute, use plain assignment",
                            target.label()
                        ),
                        location.clone(),
                    ));
                }
                let target = target.clone();
                if self.effects.borrow_mut().promised.insert(node.get()) {
                    target.promise();
                    self.effects
                        .borrow_mut()
                        .promises
                        .push(PromiseTarget::Single(target.clone()));
                }
                let value = match self.eval(value, engine)? {
                    Eval::Value(v) => v,
                    Eval::Blocked(b) => return Ok(Poll::Blocked(b)),
                };
                target.set(value, location, engine)?;
            }
            Some(Slot::Multi(target)) => {
                let target = target.clone();
                if self.effects.borrow_mut().promised.insert(node.get()) {
                    target.register_producer();
                    self.effects
                        .borrow_mut()
                        .promises
                        .push(PromiseTarget::List(target.clone()));
                }
                let value = match self.eval(value, engine)? {
                    Eval::Value(v) => v,
                    Eval::Blocked(b) => return Ok(Poll::Blocked(b)),
                };
                match value {
                    Value::List(items) => {
                        for item in items {
                            target.insert(item, location, engine)?;
                        }
                    }
                    single => {
                        target.insert(single, location, engine)?;
                    }
                }
            }
            None => {
                return Err(CompileError::typing(
                    format!(
                        "no attribute {} on entity {}",
                        attribute,
                        instance.definition().name()
                    ),
                    location.clone(),
                ));
            }
        }
        Ok(Poll::Done)
    }

    fn execute_register_index(
        &self,
        instance: &Rc<Instance>,
        declarer: &Rc<EntityDefinition>,
        position: usize,
        engine: &mut Engine,
    ) -> Result<Poll, CompileError> {
        let index = declarer.index_def(position);
        let mut key: SmallVec<[Value; 2]> = SmallVec::new();
        for attr in &index.attributes {
            let variable = match instance.single(attr) {
                Some(v) => v,
                // indexed attributes are scalar by construction
                None => return Ok(Poll::Done),
            };
            if variable.is_bound() {
                key.push(variable.value().expect("bound variable has a value"));
            } else if variable.is_frozen() {
                // the key will never complete; the underfill is reported at
                // finalization and pending lookups resolve to NotFound
                return Ok(Poll::Done);
            } else {
                return Ok(Poll::Blocked(BlockedOn::Variable {
                    variable,
                    freezable: true,
                }));
            }
        }
        declarer.register_key(
            position,
            IndexKey(key),
            instance,
            instance.location(),
            engine,
        )?;
        Ok(Poll::Done)
    }

    fn execute_implement(
        self: &Rc<Self>,
        instance: &Rc<Instance>,
        clause: &Rc<ImplementClause>,
        engine: &mut Engine,
    ) -> Result<Poll, CompileError> {
        if let Some(condition) = &clause.condition {
            let satisfied = match self.eval(condition, engine)? {
                Eval::Value(Value::Bool(b)) => b,
                Eval::Value(Value::Unknown) => {
                    return Err(CompileError::typing(
                        format!(
                            "the implementation condition for {} on {} is unknown",
                            clause.entity, instance
                        ),
                        clause.location.clone(),
                    ));
                }
                Eval::Value(other) => {
                    return Err(CompileError::typing(
                        format!(
                            "implementation conditions must be boolean, got {}",
                            other.kind()
                        ),
                        clause.location.clone(),
                    ));
                }
                Eval::Blocked(b) => return Ok(Poll::Blocked(b)),
            };
            if !satisfied {
                return Ok(Poll::Done);
            }
        }
        engine.emit_block(&clause.block, &self.scope, &clause.namespace);
        Ok(Poll::Done)
    }

    /// Evaluate an expression against this statement's scope and effects.
    fn eval(self: &Rc<Self>, expr: &Expr, engine: &mut Engine) -> Result<Eval, CompileError> {
        macro_rules! ready {
            ($e:expr) => {
                match $e? {
                    Eval::Value(value) => value,
                    Eval::Blocked(blocked) => return Ok(Eval::Blocked(blocked)),
                }
            };
        }

        match expr {
            Expr::Literal { value, .. } => Ok(Eval::Value(value.clone())),
            Expr::List { items, .. } => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(ready!(self.eval(item, engine)));
                }
                Ok(Eval::Value(Value::List(values)))
            }
            Expr::Reference { name, location } => {
                let variable = if let Some(split) = name.rfind("::") {
                    let (ns, simple) = (&name[..split], &name[split + 2..]);
                    engine
                        .scope_for(ns)
                        .and_then(|scope| scope.lookup(simple))
                } else {
                    self.scope.lookup(name)
                };
                let variable = variable.ok_or_else(|| CompileError::NameNotFound {
                    name: name.clone(),
                    location: location.clone(),
                })?;
                match variable.value() {
                    Some(value) => Ok(Eval::Value(value)),
                    None if variable.is_frozen() => Ok(Eval::Value(Value::Null)),
                    None => Ok(Eval::Blocked(BlockedOn::Variable {
                        variable,
                        freezable: false,
                    })),
                }
            }
            Expr::Attribute {
                base,
                name,
                location,
            } => {
                let base = ready!(self.eval(base, engine));
                self.read_attribute(base, name, location)
            }
            Expr::BinOp {
                op, lhs, rhs, location,
            } => {
                let left = ready!(self.eval(lhs, engine));
                let right = ready!(self.eval(rhs, engine));
                if left.is_unknown() || right.is_unknown() {
                    return Ok(Eval::Value(Value::Unknown));
                }
                let f = ops::binary(op).ok_or_else(|| {
                    CompileError::typing(format!("unknown operator {}", op), location.clone())
                })?;
                f(&left, &right)
                    .map(Eval::Value)
                    .map_err(|message| CompileError::typing(message, location.clone()))
            }
            Expr::Not { expr, location } => {
                let value = ready!(self.eval(expr, engine));
                if value.is_unknown() {
                    return Ok(Eval::Value(Value::Unknown));
                }
                ops::unary_not(&value)
                    .map(Eval::Value)
                    .map_err(|message| CompileError::typing(message, location.clone()))
            }
            Expr::Construct {
                kwargs,
                location,
                entity,
                node,
                ..
            } => {
                if let Some(instance) = self.effects.borrow().constructed.get(&node.get()) {
                    return Ok(Eval::Value(Value::Instance(instance.clone())));
                }
                let mut evaluated: Vec<(String, Value, Location)> =
                    Vec::with_capacity(kwargs.len());
                for (name, value_expr) in kwargs {
                    let value = ready!(self.eval(value_expr, engine));
                    evaluated.push((name.clone(), value, value_expr.location().clone()));
                }
                let def = entity
                    .borrow()
                    .clone()
                    .expect("constructor type resolved during normalization");
                let ids = engine.instance_ids();
                let built = construct(&def, &evaluated, location, ids.as_ref(), engine)?;
                self.effects
                    .borrow_mut()
                    .constructed
                    .insert(node.get(), built.instance.clone());
                if built.created {
                    for (declarer, position) in built.deferred {
                        engine.emit_register_index(&built.instance, declarer, position);
                    }
                    engine.emit_implementations(&built.instance);
                }
                Ok(Eval::Value(Value::Instance(built.instance)))
            }
            Expr::Lookup {
                keys,
                location,
                entity,
                ..
            } => {
                let def = entity
                    .borrow()
                    .clone()
                    .expect("lookup type resolved during normalization");
                let mut evaluated: Vec<(String, Value)> = Vec::with_capacity(keys.len());
                for (name, key_expr) in keys {
                    evaluated.push((name.clone(), ready!(self.eval(key_expr, engine))));
                }
                let names: Vec<String> = evaluated.iter().map(|(n, _)| n.clone()).collect();
                let (declarer, position) = def.find_index(&names).ok_or_else(|| {
                    CompileError::typing(
                        format!(
                            "no index defined on {} for this lookup: ({})",
                            def.name(),
                            names.iter().join(", ")
                        ),
                        location.clone(),
                    )
                })?;
                let index = declarer.index_def(position);
                let mut key: SmallVec<[Value; 2]> = SmallVec::new();
                for attr in &index.attributes {
                    let value = evaluated
                        .iter()
                        .find(|(n, _)| n == attr)
                        .map(|(_, v)| v.clone())
                        .expect("lookup keys match the index attributes");
                    key.push(value);
                }
                match declarer.probe(position, IndexKey(key)) {
                    Probe::Hit(instance) => {
                        if instance.definition().is_subtype_of(&def) {
                            Ok(Eval::Value(Value::Instance(instance)))
                        } else {
                            Err(CompileError::NameNotFound {
                                name: format!("{} in index on {}", instance, def.name()),
                                location: location.clone(),
                            })
                        }
                    }
                    Probe::Pending(slot) => match slot.value() {
                        Some(value) => Ok(Eval::Value(value)),
                        None if slot.is_frozen() => Err(CompileError::NameNotFound {
                            name: slot.label().to_string(),
                            location: location.clone(),
                        }),
                        None => Ok(Eval::Blocked(BlockedOn::Variable {
                            variable: slot,
                            freezable: true,
                        })),
                    },
                }
            }
            Expr::Call {
                args,
                kwargs,
                location,
                plugin,
                ..
            } => {
                let plugin = plugin
                    .borrow()
                    .clone()
                    .expect("plugin resolved during normalization");
                let mut positional = Vec::with_capacity(args.len());
                for arg in args {
                    positional.push(ready!(self.eval(arg, engine)));
                }
                let mut named = Vec::with_capacity(kwargs.len());
                for (name, arg) in kwargs {
                    named.push((name.clone(), ready!(self.eval(arg, engine))));
                }
                plugin.invoke(&positional, &named, location).map(Eval::Value)
            }
        }
    }

    fn read_attribute(
        &self,
        base: Value,
        name: &str,
        location: &Location,
    ) -> Result<Eval, CompileError> {
        let instance = match base {
            Value::Instance(instance) => instance,
            Value::Unknown => return Ok(Eval::Value(Value::Unknown)),
            Value::List(items) => {
                return Err(CompileError::typing(
                    format!(
                        "the object at {} is not an Entity but a list with value {}",
                        location,
                        Value::List(items)
                    ),
                    location.clone(),
                ));
            }
            other => {
                return Err(CompileError::typing(
                    format!("{} has no attributes", other.kind()),
                    location.clone(),
                ));
            }
        };
        match instance.slot(name) {
            Some(Slot::Single(variable)) => match variable.value() {
                Some(value) => Ok(Eval::Value(value)),
                None if variable.is_frozen() => {
                    let nullable = variable.ty().map(|t| t.is_nullable()).unwrap_or(false);
                    if nullable {
                        Ok(Eval::Value(Value::Null))
                    } else {
                        Err(CompileError::MultiplicityUnderfill {
                            target: variable.label().to_string(),
                            required: 1,
                            actual: 0,
                            location: location.clone(),
                        })
                    }
                }
                None => Ok(Eval::Blocked(BlockedOn::Variable {
                    variable: variable.clone(),
                    freezable: true,
                })),
            },
            Some(Slot::Multi(list)) => {
                if !list.is_readable() {
                    return Ok(Eval::Blocked(BlockedOn::List(list.clone())));
                }
                let values = list.values();
                if list.multiplicity().is_scalar() {
                    match values.into_iter().next() {
                        Some(value) => Ok(Eval::Value(value)),
                        None if list.multiplicity().lo == 0 => Ok(Eval::Value(Value::Null)),
                        None => Err(CompileError::MultiplicityUnderfill {
                            target: list.label().to_string(),
                            required: list.multiplicity().lo,
                            actual: 0,
                            location: location.clone(),
                        }),
                    }
                } else {
                    Ok(Eval::Value(Value::List(values)))
                }
            }
            None => Err(CompileError::typing(
                format!(
                    "no attribute {} on entity {}",
                    name,
                    instance.definition().name()
                ),
                location.clone(),
            )),
        }
    }

    /// Release every producer registration this statement made. Called once
    /// when the statement completes or fails, so stalled producers never pin
    /// a variable open forever.
    pub fn release_promises(&self) {
        let mut effects = self.effects.borrow_mut();
        for promise in effects.promises.drain(..) {
            match promise {
                PromiseTarget::Single(variable) => variable.fulfil(),
                PromiseTarget::List(list) => list.complete_producer(),
            }
        }
    }
}
