use crate::error::{CompileError, Location};
use crate::instance::Instance;
use crate::namespace::Resolver;
use crate::types::Type;
use crate::value::Value;
use crate::variable::{ResultVariable, WorkQueue};
use fxhash::FxHashMap;
use itertools::Itertools;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Cardinality bounds of a relation end: `[lo:hi]`, `hi = None` meaning
/// unbounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Multiplicity {
    pub lo: usize,
    pub hi: Option<usize>,
}

impl Multiplicity {
    pub fn exactly(n: usize) -> Self {
        Multiplicity { lo: n, hi: Some(n) }
    }

    pub fn at_least(lo: usize) -> Self {
        Multiplicity { lo, hi: None }
    }

    pub fn between(lo: usize, hi: usize) -> Self {
        Multiplicity { lo, hi: Some(hi) }
    }

    pub fn optional() -> Self {
        Multiplicity { lo: 0, hi: Some(1) }
    }

    /// Relations with an upper bound of one collapse to scalar access.
    pub fn is_scalar(&self) -> bool {
        self.hi == Some(1)
    }
}

impl fmt::Display for Multiplicity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.hi {
            Some(hi) if hi == self.lo => write!(f, "[{}]", self.lo),
            Some(hi) => write!(f, "[{}:{}]", self.lo, hi),
            None => write!(f, "[{}:]", self.lo),
        }
    }
}

/// A plain value attribute declared on an entity.
#[derive(Debug)]
pub struct Attribute {
    pub name: String,
    pub ty: RefCell<Type>,
    pub default: RefCell<Option<Value>>,
    pub location: Location,
}

/// One end of a relation pair. The inverse name, when present, makes the
/// relation bidirectional: inserting on one end writes back on the other.
#[derive(Debug)]
pub struct Relation {
    pub name: String,
    pub target: Rc<EntityDefinition>,
    pub multiplicity: Multiplicity,
    pub inverse: Option<String>,
    pub location: Location,
}

/// A member of an entity's attribute table.
#[derive(Clone, Debug)]
pub enum Member {
    Attribute(Rc<Attribute>),
    Relation(Rc<Relation>),
}

impl Member {
    pub fn name(&self) -> &str {
        match self {
            Member::Attribute(a) => &a.name,
            Member::Relation(r) => &r.name,
        }
    }

    pub fn location(&self) -> &Location {
        match self {
            Member::Attribute(a) => &a.location,
            Member::Relation(r) => &r.location,
        }
    }

    fn same_declaration(&self, other: &Member) -> bool {
        match (self, other) {
            (Member::Attribute(a), Member::Attribute(b)) => Rc::ptr_eq(a, b),
            (Member::Relation(a), Member::Relation(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// An ordered tuple of attribute names that identifies an instance.
#[derive(Clone, Debug)]
pub struct IndexDef {
    pub attributes: Vec<String>,
    pub location: Location,
}

/// A fully evaluated index key. Small tuples stay inline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexKey(pub SmallVec<[Value; 2]>);

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({})", self.0.iter().map(|v| v.to_string()).join(", "))
    }
}

/// What a lookup finds for a key: either a registered instance, or a slot
/// variable that will be bound when a matching instance registers. Slots are
/// frozen empty by the scheduler once no further progress is possible, which
/// is the moment a pending lookup becomes a `NotFound` error.
pub enum Probe {
    Hit(Rc<Instance>),
    Pending(Rc<ResultVariable>),
}

/// A user-defined record type: attributes, paired relations, identity
/// indices and the instances created from it.
///
/// Every definition owns its instance list and its own index tables; there
/// is no process-wide registry. Instances of subtypes are registered with
/// each ancestor as well, so `def.instances()` sees the whole subtree.
pub struct EntityDefinition {
    name: String,
    location: Location,
    parents: RefCell<Vec<Rc<EntityDefinition>>>,
    members: RefCell<Vec<Member>>,
    table: RefCell<FxHashMap<String, Member>>,
    order: RefCell<Vec<String>>,
    indices: RefCell<Vec<IndexDef>>,
    all_indices: RefCell<Vec<(Weak<EntityDefinition>, usize)>>,
    instances: RefCell<Vec<Rc<Instance>>>,
    tables: RefCell<Vec<FxHashMap<IndexKey, Weak<Instance>>>>,
    slots: RefCell<FxHashMap<(usize, IndexKey), Rc<ResultVariable>>>,
}

impl EntityDefinition {
    pub fn new(name: impl Into<String>, location: Location) -> Rc<Self> {
        Rc::new(EntityDefinition {
            name: name.into(),
            location,
            parents: RefCell::new(Vec::new()),
            members: RefCell::new(Vec::new()),
            table: RefCell::new(FxHashMap::default()),
            order: RefCell::new(Vec::new()),
            indices: RefCell::new(Vec::new()),
            all_indices: RefCell::new(Vec::new()),
            instances: RefCell::new(Vec::new()),
            tables: RefCell::new(Vec::new()),
            slots: RefCell::new(FxHashMap::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn add_parent(&self, parent: Rc<EntityDefinition>) {
        self.parents.borrow_mut().push(parent);
    }

    pub fn parents(&self) -> Vec<Rc<EntityDefinition>> {
        self.parents.borrow().clone()
    }

    /// Declare a member, rejecting a second declaration under the same name.
    pub fn add_member(&self, member: Member) -> Result<(), CompileError> {
        if let Some(existing) = self
            .members
            .borrow()
            .iter()
            .find(|m| m.name() == member.name())
        {
            return Err(CompileError::Duplicate {
                message: format!(
                    "{} is already defined on entity {}",
                    member.name(),
                    self.name
                ),
                location: member.location().clone(),
                other: existing.location().clone(),
            });
        }
        self.members.borrow_mut().push(member);
        Ok(())
    }

    pub fn add_index(&self, index: IndexDef) {
        self.indices.borrow_mut().push(index);
        self.tables.borrow_mut().push(FxHashMap::default());
    }

    pub fn index_def(&self, position: usize) -> IndexDef {
        self.indices.borrow()[position].clone()
    }

    pub fn is_subtype_of(&self, other: &EntityDefinition) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        self.parents
            .borrow()
            .iter()
            .any(|p| p.is_subtype_of(other))
    }

    /// Depth-first linearization of the inheritance graph: self first, then
    /// parents left to right, each ancestor once.
    pub fn linearized(self: &Rc<Self>) -> Vec<Rc<EntityDefinition>> {
        let mut out: Vec<Rc<EntityDefinition>> = Vec::new();
        fn walk(def: &Rc<EntityDefinition>, out: &mut Vec<Rc<EntityDefinition>>) {
            if out.iter().any(|d| Rc::ptr_eq(d, def)) {
                return;
            }
            out.push(def.clone());
            for parent in def.parents.borrow().iter() {
                walk(parent, out);
            }
        }
        walk(self, &mut out);
        out
    }

    /// Flatten the inheritance graph into the member table and validate the
    /// definition-time invariants. Must run after every type exists and
    /// before any statement executes.
    pub fn normalize(self: &Rc<Self>, resolver: &Resolver, from: &str) -> Result<(), CompileError> {
        // resolve forward references in own attribute types first
        for member in self.members.borrow().iter() {
            if let Member::Attribute(attr) = member {
                attr.ty
                    .borrow_mut()
                    .normalize(resolver, from, &attr.location)?;
            }
        }

        let chain = self.linearized();
        let mut table: FxHashMap<String, Member> = FxHashMap::default();
        let mut order = Vec::new();
        for def in &chain {
            for member in def.members.borrow().iter() {
                match table.get(member.name()) {
                    None => {
                        table.insert(member.name().to_string(), member.clone());
                        order.push(member.name().to_string());
                    }
                    Some(existing) if existing.same_declaration(member) => {}
                    Some(existing) => {
                        if !compatible(existing, member) {
                            return Err(CompileError::Duplicate {
                                message: format!(
                                    "{} is defined twice in the inheritance chain of {}",
                                    member.name(),
                                    self.name
                                ),
                                location: member.location().clone(),
                                other: existing.location().clone(),
                            });
                        }
                    }
                }
            }
        }
        *self.table.borrow_mut() = table;
        *self.order.borrow_mut() = order;

        // indexed attributes must exist and be scalar
        for index in self.indices.borrow().iter() {
            for attr in &index.attributes {
                match self.table.borrow().get(attr) {
                    None => {
                        return Err(CompileError::typing(
                            format!(
                                "attribute '{}' referenced in index is not defined in entity {}",
                                attr, self.name
                            ),
                            index.location.clone(),
                        ));
                    }
                    Some(Member::Relation(_)) => {
                        return Err(CompileError::typing(
                            format!(
                                "attribute '{}' in index on {} is a relation; indexed attributes must be scalar",
                                attr, self.name
                            ),
                            index.location.clone(),
                        ));
                    }
                    Some(Member::Attribute(a)) => {
                        let ty = a.ty.borrow();
                        if ty.is_nullable() || ty.is_list() {
                            return Err(CompileError::typing(
                                format!(
                                    "attribute '{}' in index on {} must not be nullable or multi-valued",
                                    attr, self.name
                                ),
                                index.location.clone(),
                            ));
                        }
                    }
                }
            }
        }

        // collect indices declared along the whole chain
        let mut all = Vec::new();
        for def in &chain {
            for position in 0..def.indices.borrow().len() {
                all.push((Rc::downgrade(def), position));
            }
        }
        *self.all_indices.borrow_mut() = all;
        Ok(())
    }

    pub fn member(&self, name: &str) -> Option<Member> {
        self.table.borrow().get(name).cloned()
    }

    pub fn member_order(&self) -> Vec<String> {
        self.order.borrow().clone()
    }

    /// Indices visible on this definition: own plus inherited, paired with
    /// the definition that declared them (which owns the table).
    pub fn all_indices(&self) -> Vec<(Rc<EntityDefinition>, usize)> {
        self.all_indices
            .borrow()
            .iter()
            .filter_map(|(def, position)| def.upgrade().map(|d| (d, *position)))
            .collect()
    }

    /// The index whose attribute set matches `attrs` exactly, if any.
    pub fn find_index(&self, attrs: &[String]) -> Option<(Rc<EntityDefinition>, usize)> {
        let mut wanted: Vec<&String> = attrs.iter().collect();
        wanted.sort();
        for (def, position) in self.all_indices() {
            let index = def.index_def(position);
            let mut declared: Vec<&String> = index.attributes.iter().collect();
            declared.sort();
            if declared == wanted {
                return Some((def, position));
            }
        }
        None
    }

    pub fn add_instance(self: &Rc<Self>, instance: Rc<Instance>) {
        for def in self.linearized() {
            def.instances.borrow_mut().push(instance.clone());
        }
    }

    /// All living instances, subtypes included, in creation order.
    pub fn instances(&self) -> Vec<Rc<Instance>> {
        self.instances.borrow().clone()
    }

    /// Register an instance under a fully known key in one of this
    /// definition's own index tables. Two distinct instances under one key
    /// are an `IndexCollision`.
    pub fn register_key(
        self: &Rc<Self>,
        position: usize,
        key: IndexKey,
        instance: &Rc<Instance>,
        location: &Location,
        queue: &mut dyn WorkQueue,
    ) -> Result<(), CompileError> {
        if let Some(existing) = self.tables.borrow()[position]
            .get(&key)
            .and_then(Weak::upgrade)
        {
            return if Rc::ptr_eq(&existing, instance) {
                Ok(())
            } else {
                Err(CompileError::IndexCollision {
                    index: format!(
                        "{}({})",
                        self.name,
                        self.index_def(position).attributes.join(", ")
                    ),
                    message: format!(
                        "{} and {} share the key {}",
                        existing, instance, key
                    ),
                    location: location.clone(),
                    other: existing.location().clone(),
                })
            };
        }
        self.tables.borrow_mut()[position].insert(key.clone(), Rc::downgrade(instance));
        tracing::trace!(
            entity = %self.name,
            index = position,
            key = %key,
            instance = %instance,
            "registered instance in index"
        );
        if let Some(slot) = self.slots.borrow().get(&(position, key)) {
            slot.set(Value::Instance(instance.clone()), location, queue)?;
        }
        Ok(())
    }

    /// Probe one of this definition's own index tables. A miss returns the
    /// slot variable a lookup can wait on.
    pub fn probe(self: &Rc<Self>, position: usize, key: IndexKey) -> Probe {
        if let Some(instance) = self.tables.borrow()[position]
            .get(&key)
            .and_then(Weak::upgrade)
        {
            return Probe::Hit(instance);
        }
        let mut slots = self.slots.borrow_mut();
        let slot = slots
            .entry((position, key.clone()))
            .or_insert_with(|| {
                Rc::new(ResultVariable::new(
                    format!(
                        "{}[{}]",
                        self.name,
                        self.index_def(position)
                            .attributes
                            .iter()
                            .zip(key.0.iter())
                            .map(|(a, v)| format!("{}={}", a, v))
                            .join(", ")
                    ),
                    None,
                ))
            })
            .clone();
        Probe::Pending(slot)
    }
}

/// Two inherited declarations under one name are tolerated only when they
/// agree: same shape, same type, same default. Anything else is a duplicate.
fn compatible(a: &Member, b: &Member) -> bool {
    match (a, b) {
        (Member::Attribute(a), Member::Attribute(b)) => {
            a.ty.borrow().to_string() == b.ty.borrow().to_string()
                && *a.default.borrow() == *b.default.borrow()
        }
        _ => false,
    }
}

impl fmt::Display for EntityDefinition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Debug for EntityDefinition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EntityDefinition({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;

    fn loc(line: u32) -> Location {
        Location::new("test", line)
    }

    fn attribute(name: &str, ty: Type) -> Member {
        Member::Attribute(Rc::new(Attribute {
            name: name.to_string(),
            ty: RefCell::new(ty),
            default: RefCell::new(None),
            location: loc(1),
        }))
    }

    #[test]
    fn duplicate_member_rejected() {
        let def = EntityDefinition::new("config::Host", loc(1));
        def.add_member(attribute("name", Type::string())).unwrap();
        let err = def.add_member(attribute("name", Type::string()));
        assert!(matches!(err, Err(CompileError::Duplicate { .. })));
    }

    #[test]
    fn index_must_reference_existing_scalar_attributes() {
        let resolver = Resolver::new(Namespace::root());
        let def = EntityDefinition::new("config::A", loc(1));
        def.add_member(attribute("name", Type::string())).unwrap();
        def.add_member(attribute("opt", Type::nullable(Type::string())))
            .unwrap();

        def.add_index(IndexDef {
            attributes: vec!["name".to_string(), "missing".to_string()],
            location: loc(5),
        });
        assert!(def.normalize(&resolver, "config").is_err());

        let def = EntityDefinition::new("config::B", loc(1));
        def.add_member(attribute("opt", Type::nullable(Type::string())))
            .unwrap();
        def.add_index(IndexDef {
            attributes: vec!["opt".to_string()],
            location: loc(5),
        });
        assert!(def.normalize(&resolver, "config").is_err());
    }

    #[test]
    fn diamond_with_identical_attributes_flattens() {
        let resolver = Resolver::new(Namespace::root());
        let a = EntityDefinition::new("config::A", loc(1));
        a.add_member(attribute("at", Type::string())).unwrap();
        let b = EntityDefinition::new("config::B", loc(2));
        b.add_member(attribute("at", Type::string())).unwrap();
        let c = EntityDefinition::new("config::C", loc(3));
        c.add_parent(a.clone());
        c.add_parent(b.clone());

        a.normalize(&resolver, "config").unwrap();
        b.normalize(&resolver, "config").unwrap();
        c.normalize(&resolver, "config").unwrap();
        assert!(c.member("at").is_some());
        assert_eq!(c.member_order(), vec!["at".to_string()]);
    }

    #[test]
    fn diamond_with_conflicting_defaults_is_duplicate() {
        let resolver = Resolver::new(Namespace::root());
        let a = EntityDefinition::new("config::A", loc(1));
        let attr_a = Rc::new(Attribute {
            name: "at".to_string(),
            ty: RefCell::new(Type::string()),
            default: RefCell::new(Some(Value::string("a"))),
            location: loc(1),
        });
        a.add_member(Member::Attribute(attr_a)).unwrap();
        let b = EntityDefinition::new("config::B", loc(2));
        let attr_b = Rc::new(Attribute {
            name: "at".to_string(),
            ty: RefCell::new(Type::string()),
            default: RefCell::new(Some(Value::string("b"))),
            location: loc(2),
        });
        b.add_member(Member::Attribute(attr_b)).unwrap();
        let c = EntityDefinition::new("config::C", loc(3));
        c.add_parent(a);
        c.add_parent(b);
        assert!(matches!(
            c.normalize(&resolver, "config"),
            Err(CompileError::Duplicate { .. })
        ));
    }

    #[test]
    fn subtype_relationship() {
        let a = EntityDefinition::new("config::A", loc(1));
        let b = EntityDefinition::new("config::B", loc(2));
        b.add_parent(a.clone());
        assert!(b.is_subtype_of(&a));
        assert!(!a.is_subtype_of(&b));
    }
}
