use crate::ast::{
    AttributeDecl, Block, Definition, Expr, ImplementClause, Module, Stmt, TypeSpec,
};
use crate::export::{export_model, ModelExport};
use crate::ops;
use crate::scheduler::{CompileOptions, Engine};
use crate::scope::Scope;
use converge_core::{
    Attribute, CompileError, Diagnostics, EntityDefinition, Location, Member, Namespace,
    PluginFunction, Relation, Resolver, Symbol, Type, TypeDef, Value,
};
use fxhash::FxHashMap;
use std::rc::Rc;

/// The complete result of one compile: the exported model, every diagnostic
/// collected along the way, and whether the fixpoint was reached cleanly.
#[derive(Debug)]
pub struct CompileOutcome {
    pub success: bool,
    pub export: ModelExport,
    pub diagnostics: Vec<CompileError>,
}

/// A set of modules plus the plugin callables they may reach, ready to be
/// compiled.
#[derive(Default)]
pub struct Project {
    modules: Vec<Module>,
    plugins: Vec<PluginFunction>,
    options: CompileOptions,
}

impl Project {
    pub fn new() -> Project {
        Project::default()
    }

    pub fn with_options(options: CompileOptions) -> Project {
        Project {
            options,
            ..Project::default()
        }
    }

    pub fn add_module(&mut self, module: Module) -> &mut Self {
        self.modules.push(module);
        self
    }

    /// Register a plugin under its fully qualified name, e.g. `std::upper`.
    pub fn register_plugin(&mut self, plugin: PluginFunction) -> &mut Self {
        self.plugins.push(plugin);
        self
    }

    /// Run both compiler phases. Phase A builds and normalizes every type;
    /// Phase B emits the executable statements and drives the scheduler to
    /// its fixpoint. Phase A must complete without errors before any
    /// statement runs: statements resolve types by reference, so types added
    /// late would be invisible.
    pub fn compile(self) -> CompileOutcome {
        let mut diagnostics = Diagnostics::new();
        let phase_a = define_types(&self.modules, self.plugins, &mut diagnostics);
        if !diagnostics.is_empty() {
            return CompileOutcome {
                success: false,
                export: ModelExport::default(),
                diagnostics: diagnostics.into_errors(),
            };
        }

        let mut engine = Engine::new(phase_a.entities, phase_a.implements, self.options);

        let mut module_scopes = Vec::new();
        for module in &self.modules {
            let scope = Scope::root();
            engine.add_module_scope(&module.name, scope.clone());
            module_scopes.push(scope);
        }
        for (module, scope) in self.modules.iter().zip(&module_scopes) {
            engine.emit_block(&module.block, scope, &module.name);
        }

        engine.run();
        engine.report_stuck();
        let converged = engine.converged();
        engine.finalize_all();
        let export = export_model(engine.entities());
        let diagnostics = engine.into_diagnostics().into_errors();
        CompileOutcome {
            success: converged && diagnostics.is_empty(),
            export,
            diagnostics,
        }
    }
}

struct PhaseA {
    entities: Vec<Rc<EntityDefinition>>,
    implements: FxHashMap<String, Vec<Rc<ImplementClause>>>,
}

/// The first compiler phase: create all type skeletons, wire relations,
/// indices and implementations, then normalize everything against the
/// completed namespace.
fn define_types(
    modules: &[Module],
    plugins: Vec<PluginFunction>,
    diagnostics: &mut Diagnostics,
) -> PhaseA {
    let root = Namespace::root();
    for module in modules {
        root.child(&module.name);
    }
    for plugin in plugins {
        let full = plugin.name().to_string();
        let (path, simple) = match full.rfind("::") {
            Some(split) => (&full[..split], &full[split + 2..]),
            None => ("", full.as_str()),
        };
        let mut ns = root.clone();
        if !path.is_empty() {
            for part in path.split("::") {
                ns = ns.child(part);
            }
        }
        if let Err(error) = ns.define(simple, Symbol::Plugin(Rc::new(plugin)), &Location::internal())
        {
            diagnostics.report(error);
        }
    }
    let resolver = Resolver::new(root.clone());

    // entity skeletons first, so inheritance and relations can resolve
    let mut created: Vec<(Rc<EntityDefinition>, usize, usize)> = Vec::new();
    for (mi, module) in modules.iter().enumerate() {
        let ns = root.child(&module.name);
        for (di, definition) in module.definitions.iter().enumerate() {
            if let Definition::Entity { name, location, .. } = definition {
                let def =
                    EntityDefinition::new(format!("{}::{}", module.name, name), location.clone());
                match ns.define(name, Symbol::Type(Type::Entity(def.clone())), location) {
                    Ok(()) => created.push((def, mi, di)),
                    Err(error) => diagnostics.report(error),
                }
            }
        }
    }

    // typedefs, with their constraint compiled into a predicate
    let mut typedefs: Vec<(Rc<TypeDef>, String)> = Vec::new();
    for module in modules {
        let ns = root.child(&module.name);
        for definition in &module.definitions {
            if let Definition::Typedef {
                name,
                base,
                constraint,
                location,
            } = definition
            {
                let expr = constraint.clone();
                let predicate: converge_core::Predicate = Rc::new(move |value: &Value| {
                    match ops::const_eval(&expr, Some(value))? {
                        Value::Bool(b) => Ok(b),
                        Value::Unknown => Ok(true),
                        other => Err(format!(
                            "typedef constraint must evaluate to bool, got {}",
                            other.kind()
                        )),
                    }
                });
                let td = Rc::new(TypeDef::new(
                    format!("{}::{}", module.name, name),
                    location.clone(),
                    Type::Unresolved(base.clone()),
                    predicate,
                ));
                match ns.define(name, Symbol::Type(Type::Constrained(td.clone())), location) {
                    Ok(()) => typedefs.push((td, module.name.clone())),
                    Err(error) => diagnostics.report(error),
                }
            }
        }
    }

    // fill in parents and attributes now that every entity exists
    for (def, mi, di) in &created {
        let module = &modules[*mi];
        if let Definition::Entity {
            parents,
            attributes,
            location,
            ..
        } = &module.definitions[*di]
        {
            for parent in parents {
                match resolver.lookup_entity(parent, &module.name, location) {
                    Ok(parent_def) => def.add_parent(parent_def),
                    Err(error) => diagnostics.report(error),
                }
            }
            for decl in attributes {
                declare_attribute(def, decl, diagnostics);
            }
        }
    }

    // relations: declare each named end on its own entity
    for module in modules {
        for definition in &module.definitions {
            if let Definition::Relation {
                left,
                right,
                location,
            } = definition
            {
                let left_def = relation_entity(&resolver, &left.entity, &module.name, location);
                let right_def = relation_entity(&resolver, &right.entity, &module.name, location);
                let (left_def, right_def) = match (left_def, right_def) {
                    (Ok(l), Ok(r)) => (l, r),
                    (l, r) => {
                        for side in [l.err(), r.err()].iter().flatten() {
                            diagnostics.report(side.clone());
                        }
                        continue;
                    }
                };
                let ends = [
                    (left, &left_def, &right_def, right),
                    (right, &right_def, &left_def, left),
                ];
                for (end, own, other, other_end) in ends.iter() {
                    if let Some(attribute) = &end.attribute {
                        let member = Member::Relation(Rc::new(Relation {
                            name: attribute.clone(),
                            target: (*other).clone(),
                            multiplicity: end.multiplicity,
                            inverse: other_end.attribute.clone(),
                            location: location.clone(),
                        }));
                        if let Err(error) = own.add_member(member) {
                            diagnostics.report(error);
                        }
                    }
                }
            }
        }
    }

    // indices
    for module in modules {
        for definition in &module.definitions {
            if let Definition::Index {
                entity,
                attributes,
                location,
            } = definition
            {
                match resolver.lookup_entity(entity, &module.name, location) {
                    Ok(def) => def.add_index(converge_core::IndexDef {
                        attributes: attributes.clone(),
                        location: location.clone(),
                    }),
                    Err(error) => diagnostics.report(error),
                }
            }
        }
    }

    // implementations, then the implement clauses that reference them
    let mut implementations: FxHashMap<String, (Rc<Block>, String)> = FxHashMap::default();
    for module in modules {
        for definition in &module.definitions {
            if let Definition::Implementation {
                name,
                entity,
                block,
                location,
            } = definition
            {
                if let Err(error) = resolver.lookup_entity(entity, &module.name, location) {
                    diagnostics.report(error);
                }
                implementations.insert(
                    format!("{}::{}", module.name, name),
                    (block.clone(), module.name.clone()),
                );
            }
        }
    }

    let mut implements: FxHashMap<String, Vec<Rc<ImplementClause>>> = FxHashMap::default();
    for module in modules {
        for definition in &module.definitions {
            if let Definition::Implement {
                entity,
                implementation,
                condition,
                location,
            } = definition
            {
                let target = match resolver.lookup_entity(entity, &module.name, location) {
                    Ok(def) => def,
                    Err(error) => {
                        diagnostics.report(error);
                        continue;
                    }
                };
                let key = if implementation.contains("::") {
                    implementation.clone()
                } else {
                    format!("{}::{}", module.name, implementation)
                };
                match implementations.get(&key) {
                    Some((block, _)) => {
                        implements
                            .entry(target.name().to_string())
                            .or_insert_with(Vec::new)
                            .push(Rc::new(ImplementClause {
                                entity: target.name().to_string(),
                                block: block.clone(),
                                condition: condition.clone(),
                                location: location.clone(),
                                namespace: module.name.clone(),
                            }));
                    }
                    None => diagnostics.report(CompileError::NameNotFound {
                        name: implementation.clone(),
                        location: location.clone(),
                    }),
                }
            }
        }
    }

    // every skeleton exists: normalize types, flattening inheritance and
    // validating index definitions
    for (td, module_name) in &typedefs {
        if let Err(error) = td.normalize(&resolver, module_name) {
            diagnostics.report(error);
        }
    }
    for (def, mi, _) in &created {
        if let Err(error) = def.normalize(&resolver, &modules[*mi].name) {
            diagnostics.report(error);
        }
    }

    // bind name references in every executable block
    let mut node_counter: u32 = 1;
    for module in modules {
        normalize_block(&module.block, &resolver, &module.name, &mut node_counter, diagnostics);
    }
    for (block, namespace) in implementations.values() {
        normalize_block(block, &resolver, namespace, &mut node_counter, diagnostics);
    }
    for clauses in implements.values() {
        for clause in clauses {
            if let Some(condition) = &clause.condition {
                if let Err(error) = normalize_expr(
                    condition,
                    &resolver,
                    &clause.namespace,
                    &mut node_counter,
                ) {
                    diagnostics.report(error);
                }
            }
        }
    }

    PhaseA {
        entities: created.into_iter().map(|(def, _, _)| def).collect(),
        implements,
    }
}

fn relation_entity(
    resolver: &Resolver,
    name: &str,
    from: &str,
    location: &Location,
) -> Result<Rc<EntityDefinition>, CompileError> {
    match resolver.lookup_type(name, from, location)? {
        Type::Entity(def) => Ok(def),
        other => Err(CompileError::typing(
            format!(
                "relations can only be defined between entities, {} is {}",
                name, other
            ),
            location.clone(),
        )),
    }
}

fn declare_attribute(
    def: &Rc<EntityDefinition>,
    decl: &AttributeDecl,
    diagnostics: &mut Diagnostics,
) {
    let default = match &decl.default {
        Some(expr) => match ops::const_eval(expr, None) {
            Ok(value) => Some(value),
            Err(message) => {
                diagnostics.report(CompileError::typing(message, decl.location.clone()));
                None
            }
        },
        None => None,
    };
    let member = Member::Attribute(Rc::new(Attribute {
        name: decl.name.clone(),
        ty: std::cell::RefCell::new(spec_to_type(&decl.ty)),
        default: std::cell::RefCell::new(default),
        location: decl.location.clone(),
    }));
    if let Err(error) = def.add_member(member) {
        diagnostics.report(error);
    }
}

fn spec_to_type(spec: &TypeSpec) -> Type {
    let mut ty = Type::Unresolved(spec.base.clone());
    if spec.list {
        ty = Type::list_of(ty);
    }
    if spec.nullable {
        ty = Type::nullable(ty);
    }
    ty
}

/// Bind the type and plugin references of a block and assign node ids to its
/// side-effecting statements. Re-entrant: a block shared by several
/// implement clauses just gets re-normalized to the same result.
fn normalize_block(
    block: &Rc<Block>,
    resolver: &Resolver,
    from: &str,
    counter: &mut u32,
    diagnostics: &mut Diagnostics,
) {
    let mut declared = Vec::new();
    for stmt in &block.statements {
        if let Stmt::Assign { name, .. } = &**stmt {
            if !declared.contains(name) {
                declared.push(name.clone());
            }
        }
        if let Err(error) = normalize_stmt(stmt, resolver, from, counter, diagnostics) {
            diagnostics.report(error);
        }
    }
    *block.declared.borrow_mut() = declared;
}

fn normalize_stmt(
    stmt: &Stmt,
    resolver: &Resolver,
    from: &str,
    counter: &mut u32,
    diagnostics: &mut Diagnostics,
) -> Result<(), CompileError> {
    match stmt {
        Stmt::Assign { value, node, .. } => {
            node.set(next_node(counter));
            normalize_expr(value, resolver, from, counter)
        }
        Stmt::SetAttr {
            base, value, node, ..
        }
        | Stmt::AddAttr {
            base, value, node, ..
        } => {
            node.set(next_node(counter));
            normalize_expr(base, resolver, from, counter)?;
            normalize_expr(value, resolver, from, counter)
        }
        Stmt::For {
            iterable, body, ..
        } => {
            normalize_expr(iterable, resolver, from, counter)?;
            normalize_block(body, resolver, from, counter, diagnostics);
            Ok(())
        }
        Stmt::Expression { expr, .. } => normalize_expr(expr, resolver, from, counter),
    }
}

fn normalize_expr(
    expr: &Expr,
    resolver: &Resolver,
    from: &str,
    counter: &mut u32,
) -> Result<(), CompileError> {
    match expr {
        Expr::Literal { .. } | Expr::Reference { .. } => Ok(()),
        Expr::List { items, .. } => {
            for item in items {
                normalize_expr(item, resolver, from, counter)?;
            }
            Ok(())
        }
        Expr::Attribute { base, .. } => normalize_expr(base, resolver, from, counter),
        Expr::Not { expr, .. } => normalize_expr(expr, resolver, from, counter),
        Expr::BinOp {
            op, lhs, rhs, location,
        } => {
            if ops::binary(op).is_none() {
                return Err(CompileError::typing(
                    format!("unknown operator {}", op),
                    location.clone(),
                ));
            }
            normalize_expr(lhs, resolver, from, counter)?;
            normalize_expr(rhs, resolver, from, counter)
        }
        Expr::Construct {
            type_name,
            kwargs,
            location,
            entity,
            node,
        } => {
            node.set(next_node(counter));
            *entity.borrow_mut() = Some(resolver.lookup_entity(type_name, from, location)?);
            for (_, value) in kwargs {
                normalize_expr(value, resolver, from, counter)?;
            }
            Ok(())
        }
        Expr::Lookup {
            type_name,
            keys,
            location,
            entity,
        } => {
            *entity.borrow_mut() = Some(resolver.lookup_entity(type_name, from, location)?);
            for (_, value) in keys {
                normalize_expr(value, resolver, from, counter)?;
            }
            Ok(())
        }
        Expr::Call {
            name,
            args,
            kwargs,
            location,
            plugin,
        } => {
            *plugin.borrow_mut() = Some(resolver.lookup_plugin(name, from, location)?);
            for arg in args {
                normalize_expr(arg, resolver, from, counter)?;
            }
            for (_, arg) in kwargs {
                normalize_expr(arg, resolver, from, counter)?;
            }
            Ok(())
        }
    }
}

fn next_node(counter: &mut u32) -> u32 {
    let id = *counter;
    *counter += 1;
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::RelationEnd;
    use converge_core::Multiplicity;

    fn loc(line: u32) -> Location {
        Location::new("main.cf", line)
    }

    fn compile(definitions: Vec<Definition>) -> CompileOutcome {
        let mut project = Project::new();
        project.add_module(Module::new("config", definitions, Block::new(vec![])));
        project.compile()
    }

    #[test]
    fn index_on_missing_entity_is_type_not_found() {
        let outcome = compile(vec![Definition::index("A", vec!["name"], loc(1))]);
        assert!(!outcome.success);
        assert!(outcome
            .diagnostics
            .iter()
            .any(|e| matches!(e, CompileError::TypeNotFound { .. })));
    }

    #[test]
    fn index_on_nullable_attribute_is_rejected() {
        let outcome = compile(vec![
            Definition::entity(
                "A",
                vec![],
                vec![
                    AttributeDecl::new("name", TypeSpec::plain("string"), None, loc(1)),
                    AttributeDecl::new("opt", TypeSpec::nullable("string"), None, loc(1)),
                ],
                loc(1),
            ),
            Definition::index("A", vec!["name", "opt"], loc(2)),
        ]);
        assert!(!outcome.success);
        assert!(outcome
            .diagnostics
            .iter()
            .any(|e| matches!(e, CompileError::Typing { .. })));
    }

    #[test]
    fn index_on_relation_is_rejected() {
        let outcome = compile(vec![
            Definition::entity(
                "A",
                vec![],
                vec![AttributeDecl::new(
                    "name",
                    TypeSpec::plain("string"),
                    None,
                    loc(1),
                )],
                loc(1),
            ),
            Definition::relation(
                RelationEnd::new("A", "opt", Multiplicity::optional()),
                RelationEnd::bare("A"),
                loc(2),
            ),
            Definition::index("A", vec!["name", "opt"], loc(3)),
        ]);
        assert!(!outcome.success);
        assert!(outcome
            .diagnostics
            .iter()
            .any(|e| matches!(e, CompileError::Typing { .. })));
    }

    #[test]
    fn relation_on_typedef_is_rejected() {
        let outcome = compile(vec![
            Definition::entity("File", vec![], vec![], loc(1)),
            Definition::typedef(
                "cfg",
                "string",
                Expr::binop(
                    "!=",
                    Expr::reference("self", loc(2)),
                    Expr::literal("", loc(2)),
                    loc(2),
                ),
                loc(2),
            ),
            Definition::relation(
                RelationEnd::new("cfg", "stuff", Multiplicity::exactly(1)),
                RelationEnd::bare("File"),
                loc(3),
            ),
        ]);
        assert!(!outcome.success);
        assert!(outcome
            .diagnostics
            .iter()
            .any(|e| matches!(e, CompileError::Typing { .. })));
    }

    #[test]
    fn implement_with_missing_implementation_is_name_not_found() {
        let outcome = compile(vec![
            Definition::entity("A", vec![], vec![], loc(1)),
            Definition::implement("A", "missing", None, loc(2)),
        ]);
        assert!(!outcome.success);
        assert!(outcome
            .diagnostics
            .iter()
            .any(|e| matches!(e, CompileError::NameNotFound { .. })));
    }

    #[test]
    fn duplicate_entity_names_are_rejected() {
        let outcome = compile(vec![
            Definition::entity("A", vec![], vec![], loc(1)),
            Definition::entity("A", vec![], vec![], loc(2)),
        ]);
        assert!(!outcome.success);
        assert!(outcome
            .diagnostics
            .iter()
            .any(|e| matches!(e, CompileError::Duplicate { .. })));
    }
}
