use converge_core::{EntityDefinition, Location, Multiplicity, PluginFunction, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Identifier of a side-effecting AST node, assigned during normalization.
/// Statement instances key their effects (constructed instances, producer
/// registrations) by node id so that re-executing after a wake never
/// duplicates a side effect.
pub type NodeId = u32;

/// An expression node. Executable nodes either produce a value or block on
/// the first unbound variable they need; blocking is re-entrant.
#[derive(Debug)]
pub enum Expr {
    Literal {
        value: Value,
        location: Location,
    },
    List {
        items: Vec<Expr>,
        location: Location,
    },
    Reference {
        name: String,
        location: Location,
    },
    Attribute {
        base: Box<Expr>,
        name: String,
        location: Location,
    },
    BinOp {
        op: &'static str,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        location: Location,
    },
    Not {
        expr: Box<Expr>,
        location: Location,
    },
    Construct {
        type_name: String,
        kwargs: Vec<(String, Expr)>,
        location: Location,
        entity: RefCell<Option<Rc<EntityDefinition>>>,
        node: Cell<NodeId>,
    },
    Lookup {
        type_name: String,
        keys: Vec<(String, Expr)>,
        location: Location,
        entity: RefCell<Option<Rc<EntityDefinition>>>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
        location: Location,
        plugin: RefCell<Option<Rc<PluginFunction>>>,
    },
}

impl Expr {
    pub fn literal(value: impl Into<Value>, location: Location) -> Expr {
        Expr::Literal {
            value: value.into(),
            location,
        }
    }

    pub fn list(items: Vec<Expr>, location: Location) -> Expr {
        Expr::List { items, location }
    }

    pub fn reference(name: impl Into<String>, location: Location) -> Expr {
        Expr::Reference {
            name: name.into(),
            location,
        }
    }

    pub fn attribute(base: Expr, name: impl Into<String>, location: Location) -> Expr {
        Expr::Attribute {
            base: Box::new(base),
            name: name.into(),
            location,
        }
    }

    pub fn binop(op: &'static str, lhs: Expr, rhs: Expr, location: Location) -> Expr {
        Expr::BinOp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            location,
        }
    }

    pub fn not(expr: Expr, location: Location) -> Expr {
        Expr::Not {
            expr: Box::new(expr),
            location,
        }
    }

    pub fn construct(
        type_name: impl Into<String>,
        kwargs: Vec<(&str, Expr)>,
        location: Location,
    ) -> Expr {
        Expr::Construct {
            type_name: type_name.into(),
            kwargs: kwargs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            location,
            entity: RefCell::new(None),
            node: Cell::new(0),
        }
    }

    pub fn lookup(
        type_name: impl Into<String>,
        keys: Vec<(&str, Expr)>,
        location: Location,
    ) -> Expr {
        Expr::Lookup {
            type_name: type_name.into(),
            keys: keys.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            location,
            entity: RefCell::new(None),
        }
    }

    pub fn call(
        name: impl Into<String>,
        args: Vec<Expr>,
        kwargs: Vec<(&str, Expr)>,
        location: Location,
    ) -> Expr {
        Expr::Call {
            name: name.into(),
            args,
            kwargs: kwargs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            location,
            plugin: RefCell::new(None),
        }
    }

    pub fn location(&self) -> &Location {
        match self {
            Expr::Literal { location, .. }
            | Expr::List { location, .. }
            | Expr::Reference { location, .. }
            | Expr::Attribute { location, .. }
            | Expr::BinOp { location, .. }
            | Expr::Not { location, .. }
            | Expr::Construct { location, .. }
            | Expr::Lookup { location, .. }
            | Expr::Call { location, .. } => location,
        }
    }
}

/// An executable statement.
#[derive(Debug)]
pub enum Stmt {
    /// `name = value` in the enclosing lexical scope.
    Assign {
        name: String,
        value: Expr,
        location: Location,
        node: Cell<NodeId>,
    },
    /// `base.attribute = value`.
    SetAttr {
        base: Expr,
        attribute: String,
        value: Expr,
        location: Location,
        node: Cell<NodeId>,
    },
    /// `base.attribute += value`: registers as a producer, then inserts.
    AddAttr {
        base: Expr,
        attribute: String,
        value: Expr,
        location: Location,
        node: Cell<NodeId>,
    },
    /// One body copy per element, emitted in iteration order.
    For {
        variable: String,
        iterable: Expr,
        body: Rc<Block>,
        location: Location,
    },
    /// A bare expression evaluated for its side effects.
    Expression { expr: Expr, location: Location },
}

impl Stmt {
    pub fn assign(name: impl Into<String>, value: Expr, location: Location) -> Stmt {
        Stmt::Assign {
            name: name.into(),
            value,
            location,
            node: Cell::new(0),
        }
    }

    pub fn set_attr(
        base: Expr,
        attribute: impl Into<String>,
        value: Expr,
        location: Location,
    ) -> Stmt {
        Stmt::SetAttr {
            base,
            attribute: attribute.into(),
            value,
            location,
            node: Cell::new(0),
        }
    }

    pub fn add_attr(
        base: Expr,
        attribute: impl Into<String>,
        value: Expr,
        location: Location,
    ) -> Stmt {
        Stmt::AddAttr {
            base,
            attribute: attribute.into(),
            value,
            location,
            node: Cell::new(0),
        }
    }

    pub fn for_loop(
        variable: impl Into<String>,
        iterable: Expr,
        body: Block,
        location: Location,
    ) -> Stmt {
        Stmt::For {
            variable: variable.into(),
            iterable,
            body: Rc::new(body),
            location,
        }
    }

    pub fn expression(expr: Expr, location: Location) -> Stmt {
        Stmt::Expression { expr, location }
    }

    pub fn location(&self) -> &Location {
        match self {
            Stmt::Assign { location, .. }
            | Stmt::SetAttr { location, .. }
            | Stmt::AddAttr { location, .. }
            | Stmt::For { location, .. }
            | Stmt::Expression { location, .. } => location,
        }
    }
}

/// A lexical block of statements. The names assigned at this block level are
/// collected during normalization and declared in the block's scope before
/// any statement runs, so forward references within a block suspend instead
/// of failing.
#[derive(Debug, Default)]
pub struct Block {
    pub statements: Vec<Rc<Stmt>>,
    pub declared: RefCell<Vec<String>>,
}

impl Block {
    pub fn new(statements: Vec<Stmt>) -> Block {
        Block {
            statements: statements.into_iter().map(Rc::new).collect(),
            declared: RefCell::new(Vec::new()),
        }
    }
}

/// Shape of an attribute type as written in the model: a base type name with
/// optional nullable / list markers.
#[derive(Clone, Debug)]
pub struct TypeSpec {
    pub base: String,
    pub nullable: bool,
    pub list: bool,
}

impl TypeSpec {
    pub fn plain(base: impl Into<String>) -> TypeSpec {
        TypeSpec {
            base: base.into(),
            nullable: false,
            list: false,
        }
    }

    pub fn nullable(base: impl Into<String>) -> TypeSpec {
        TypeSpec {
            base: base.into(),
            nullable: true,
            list: false,
        }
    }

    pub fn list_of(base: impl Into<String>) -> TypeSpec {
        TypeSpec {
            base: base.into(),
            nullable: false,
            list: true,
        }
    }
}

#[derive(Debug)]
pub struct AttributeDecl {
    pub name: String,
    pub ty: TypeSpec,
    pub default: Option<Expr>,
    pub location: Location,
}

impl AttributeDecl {
    pub fn new(
        name: impl Into<String>,
        ty: TypeSpec,
        default: Option<Expr>,
        location: Location,
    ) -> AttributeDecl {
        AttributeDecl {
            name: name.into(),
            ty,
            default,
            location,
        }
    }
}

/// One end of a relation declaration `A.a [m] -- B.b [n]`. The attribute is
/// declared on this end's entity and targets the other end's entity; a
/// missing attribute name makes the relation unidirectional.
#[derive(Debug)]
pub struct RelationEnd {
    pub entity: String,
    pub attribute: Option<String>,
    pub multiplicity: Multiplicity,
}

impl RelationEnd {
    pub fn new(
        entity: impl Into<String>,
        attribute: impl Into<String>,
        multiplicity: Multiplicity,
    ) -> RelationEnd {
        RelationEnd {
            entity: entity.into(),
            attribute: Some(attribute.into()),
            multiplicity,
        }
    }

    pub fn bare(entity: impl Into<String>) -> RelationEnd {
        RelationEnd {
            entity: entity.into(),
            attribute: None,
            multiplicity: Multiplicity::at_least(0),
        }
    }
}

/// A definition statement, evaluated during the first compiler phase.
#[derive(Debug)]
pub enum Definition {
    Entity {
        name: String,
        parents: Vec<String>,
        attributes: Vec<AttributeDecl>,
        location: Location,
    },
    Typedef {
        name: String,
        base: String,
        /// Constraint expression over `self`, shared with the typedef's
        /// predicate closure.
        constraint: Rc<Expr>,
        location: Location,
    },
    Relation {
        left: RelationEnd,
        right: RelationEnd,
        location: Location,
    },
    Index {
        entity: String,
        attributes: Vec<String>,
        location: Location,
    },
    Implementation {
        name: String,
        entity: String,
        block: Rc<Block>,
        location: Location,
    },
    Implement {
        entity: String,
        implementation: String,
        condition: Option<Rc<Expr>>,
        location: Location,
    },
}

impl Definition {
    pub fn entity(
        name: impl Into<String>,
        parents: Vec<&str>,
        attributes: Vec<AttributeDecl>,
        location: Location,
    ) -> Definition {
        Definition::Entity {
            name: name.into(),
            parents: parents.into_iter().map(|p| p.to_string()).collect(),
            attributes,
            location,
        }
    }

    pub fn typedef(
        name: impl Into<String>,
        base: impl Into<String>,
        constraint: Expr,
        location: Location,
    ) -> Definition {
        Definition::Typedef {
            name: name.into(),
            base: base.into(),
            constraint: Rc::new(constraint),
            location,
        }
    }

    pub fn relation(left: RelationEnd, right: RelationEnd, location: Location) -> Definition {
        Definition::Relation {
            left,
            right,
            location,
        }
    }

    pub fn index(
        entity: impl Into<String>,
        attributes: Vec<&str>,
        location: Location,
    ) -> Definition {
        Definition::Index {
            entity: entity.into(),
            attributes: attributes.into_iter().map(|a| a.to_string()).collect(),
            location,
        }
    }

    pub fn implementation(
        name: impl Into<String>,
        entity: impl Into<String>,
        block: Block,
        location: Location,
    ) -> Definition {
        Definition::Implementation {
            name: name.into(),
            entity: entity.into(),
            block: Rc::new(block),
            location,
        }
    }

    pub fn implement(
        entity: impl Into<String>,
        implementation: impl Into<String>,
        condition: Option<Expr>,
        location: Location,
    ) -> Definition {
        Definition::Implement {
            entity: entity.into(),
            implementation: implementation.into(),
            condition: condition.map(Rc::new),
            location,
        }
    }
}

/// An implementation block bound to an entity by an `implement` clause,
/// optionally guarded by a predicate over `self`.
#[derive(Debug)]
pub struct ImplementClause {
    pub entity: String,
    pub block: Rc<Block>,
    pub condition: Option<Rc<Expr>>,
    pub location: Location,
    /// Namespace the implementation was defined in; its module scope is the
    /// lexical parent of every emitted block.
    pub namespace: String,
}

/// Everything one module contributes: its definition statements and its top
/// level executable block.
#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub definitions: Vec<Definition>,
    pub block: Rc<Block>,
}

impl Module {
    pub fn new(name: impl Into<String>, definitions: Vec<Definition>, block: Block) -> Module {
        Module {
            name: name.into(),
            definitions,
            block: Rc::new(block),
        }
    }
}
