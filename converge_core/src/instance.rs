use crate::entity::{EntityDefinition, IndexKey, Member};
use crate::error::{CompileError, Location};
use crate::value::Value;
use crate::variable::{ListVariable, ResultVariable, WorkQueue};
use fxhash::FxHashMap;
use smallvec::SmallVec;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// Storage backing one member of an instance: a write-once cell for plain
/// attributes, an accumulating list for relations.
#[derive(Clone)]
pub enum Slot {
    Single(Rc<ResultVariable>),
    Multi(Rc<ListVariable>),
}

/// Allocates instance identifiers, unique across one compile.
#[derive(Debug, Default)]
pub struct InstanceIds(Cell<u32>);

impl InstanceIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u32 {
        let id = self.0.get();
        self.0.set(id + 1);
        id
    }
}

/// A living entity instance.
///
/// Mutated monotonically through its attribute variables until the scheduler
/// finalizes it, at which point every variable is frozen and the
/// multiplicity bounds are checked.
pub struct Instance {
    id: u32,
    def: Rc<EntityDefinition>,
    location: Location,
    slots: FxHashMap<String, Slot>,
    finalized: Cell<bool>,
}

impl Instance {
    /// Allocate an instance with one variable per member of the flattened
    /// attribute table. Does not register indices; the caller does that once
    /// the key attributes are known.
    pub fn new(def: Rc<EntityDefinition>, id: u32, location: Location) -> Rc<Instance> {
        Rc::new_cyclic(|weak| {
            let mut slots = FxHashMap::default();
            for name in def.member_order() {
                let member = def.member(&name).expect("member listed but not in table");
                let label = format!("{}#{}.{}", def.name(), id, name);
                let slot = match member {
                    Member::Attribute(attr) => Slot::Single(Rc::new(ResultVariable::new(
                        label,
                        Some(attr.ty.borrow().clone()),
                    ))),
                    Member::Relation(rel) => Slot::Multi(Rc::new(ListVariable::new(
                        label,
                        crate::types::Type::Entity(rel.target.clone()),
                        rel.multiplicity,
                        rel.location.clone(),
                        weak.clone(),
                        rel.inverse.clone(),
                    ))),
                };
                slots.insert(name, slot);
            }
            Instance {
                id,
                def,
                location,
                slots,
                finalized: Cell::new(false),
            }
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn definition(&self) -> &Rc<EntityDefinition> {
        &self.def
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.get()
    }

    pub fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.get(name)
    }

    pub fn single(&self, name: &str) -> Option<Rc<ResultVariable>> {
        match self.slots.get(name) {
            Some(Slot::Single(rv)) => Some(rv.clone()),
            _ => None,
        }
    }

    pub fn relation(&self, name: &str) -> Option<Rc<ListVariable>> {
        match self.slots.get(name) {
            Some(Slot::Multi(lv)) => Some(lv.clone()),
            _ => None,
        }
    }

    /// Write a value into a member. Lists assigned to relations insert
    /// element-wise, preserving order.
    pub fn set_attribute(
        &self,
        name: &str,
        value: Value,
        location: &Location,
        queue: &mut dyn WorkQueue,
    ) -> Result<(), CompileError> {
        match self.slots.get(name) {
            Some(Slot::Single(rv)) => rv.set(value, location, queue),
            Some(Slot::Multi(lv)) => {
                match value {
                    Value::List(items) => {
                        for item in items {
                            lv.insert(item, location, queue)?;
                        }
                    }
                    single => {
                        lv.insert(single, location, queue)?;
                    }
                }
                Ok(())
            }
            None => Err(CompileError::typing(
                format!("no attribute {} on entity {}", name, self.def.name()),
                location.clone(),
            )),
        }
    }

    /// The key this instance projects onto the given index, when every key
    /// attribute is bound.
    pub fn index_key(&self, attributes: &[String]) -> Option<IndexKey> {
        let mut key: SmallVec<[Value; 2]> = SmallVec::new();
        for attr in attributes {
            match self.slot(attr) {
                Some(Slot::Single(rv)) => key.push(rv.value()?),
                _ => return None,
            }
        }
        Some(IndexKey(key))
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.def.name(), self.id)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Instance({}#{} at {})", self.def.name(), self.id, self.location)
    }
}

/// Outcome of a constructor evaluation.
pub struct Construction {
    pub instance: Rc<Instance>,
    /// False when the constructor resolved to an already existing instance
    /// through an index hit.
    pub created: bool,
    /// Indices whose key attributes were not all bound yet. The caller
    /// schedules a deferred registration for each; identity is re-checked at
    /// the moment the last key attribute binds.
    pub deferred: Vec<(Rc<EntityDefinition>, usize)>,
}

/// Construct an instance of `def` from fully evaluated keyword arguments.
///
/// Identity is decided by the first declared index whose key attributes are
/// all present among the arguments and defaults: a hit merges the remaining
/// arguments into the existing instance, a miss allocates. Two constructions
/// whose keys coincide therefore resolve to the same instance.
pub fn construct(
    def: &Rc<EntityDefinition>,
    kwargs: &[(String, Value, Location)],
    location: &Location,
    ids: &InstanceIds,
    queue: &mut dyn WorkQueue,
) -> Result<Construction, CompileError> {
    for (name, _, kwloc) in kwargs {
        if def.member(name).is_none() {
            return Err(CompileError::typing(
                format!("no attribute {} on entity {}", name, def.name()),
                kwloc.clone(),
            ));
        }
    }

    // scalar view of arguments plus defaults, for index probing
    let mut effective: FxHashMap<&str, &Value> = FxHashMap::default();
    for (name, value, _) in kwargs {
        effective.insert(name.as_str(), value);
    }
    let defaults: Vec<(String, Value, Location)> = def
        .member_order()
        .iter()
        .filter_map(|name| match def.member(name) {
            Some(Member::Attribute(attr)) => {
                let default = attr.default.borrow().clone()?;
                Some((name.clone(), default, attr.location.clone()))
            }
            _ => None,
        })
        .collect();

    for (name, value, _) in &defaults {
        if !effective.contains_key(name.as_str()) {
            effective.insert(name.as_str(), value);
        }
    }

    // the first index that is fully known decides identity
    for (declarer, position) in def.all_indices() {
        let index = declarer.index_def(position);
        let key: Option<SmallVec<[Value; 2]>> = index
            .attributes
            .iter()
            .map(|attr| effective.get(attr.as_str()).cloned().cloned())
            .collect();
        let key = match key {
            Some(values) => IndexKey(values),
            None => continue,
        };
        if let crate::entity::Probe::Hit(existing) = declarer.probe(position, key.clone()) {
            if !Rc::ptr_eq(existing.definition(), def) {
                return Err(CompileError::IndexCollision {
                    index: format!("{}({})", declarer.name(), index.attributes.join(", ")),
                    message: format!(
                        "an instance of {} already holds the key {}",
                        existing.definition().name(),
                        key
                    ),
                    location: location.clone(),
                    other: existing.location().clone(),
                });
            }
            for (name, value, kwloc) in kwargs {
                existing.set_attribute(name, value.clone(), kwloc, queue)?;
            }
            return Ok(Construction {
                instance: existing,
                created: false,
                deferred: Vec::new(),
            });
        }
        break;
    }

    let instance = Instance::new(def.clone(), ids.next(), location.clone());
    def.add_instance(instance.clone());
    tracing::debug!(instance = %instance, location = %location, "allocated instance");

    for (name, value, kwloc) in kwargs {
        instance.set_attribute(name, value.clone(), kwloc, queue)?;
    }
    for (name, value, default_location) in &defaults {
        if !kwargs.iter().any(|(k, _, _)| k == name) {
            instance.set_attribute(name, value.clone(), default_location, queue)?;
        }
    }

    let mut deferred = Vec::new();
    for (declarer, position) in def.all_indices() {
        let index = declarer.index_def(position);
        match instance.index_key(&index.attributes) {
            Some(key) => declarer.register_key(position, key, &instance, location, queue)?,
            None => deferred.push((declarer, position)),
        }
    }

    Ok(Construction {
        instance,
        created: true,
        deferred,
    })
}

/// Freeze every variable of an instance and check the multiplicity bounds.
/// Returns the errors found rather than failing fast: finalization must
/// visit every instance so one compile surfaces every incomplete object.
pub fn finalize(
    instance: &Rc<Instance>,
    queue: &mut dyn WorkQueue,
) -> Vec<CompileError> {
    let mut errors = Vec::new();
    if instance.finalized.get() {
        return errors;
    }
    instance.finalized.set(true);

    for name in instance.def.member_order() {
        match instance.slot(&name) {
            Some(Slot::Single(rv)) => {
                rv.freeze(queue);
                if !rv.is_bound() {
                    let required = match rv.ty() {
                        Some(ty) if ty.is_nullable() => 0,
                        _ => 1,
                    };
                    if required > 0 {
                        errors.push(CompileError::MultiplicityUnderfill {
                            target: rv.label().to_string(),
                            required,
                            actual: 0,
                            location: instance.location.clone(),
                        });
                    }
                }
            }
            Some(Slot::Multi(lv)) => {
                if let Err(error) = lv.freeze(queue) {
                    errors.push(error);
                }
            }
            None => {}
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Attribute, IndexDef, Multiplicity, Relation};
    use crate::namespace::{Namespace, Resolver};
    use crate::types::Type;
    use crate::variable::test_queue::RecordingQueue;
    use std::cell::RefCell;

    fn loc(line: u32) -> Location {
        Location::new("test", line)
    }

    fn host_def() -> Rc<EntityDefinition> {
        let def = EntityDefinition::new("config::Host", loc(1));
        def.add_member(Member::Attribute(Rc::new(Attribute {
            name: "name".to_string(),
            ty: RefCell::new(Type::string()),
            default: RefCell::new(None),
            location: loc(1),
        })))
        .unwrap();
        def.add_index(IndexDef {
            attributes: vec!["name".to_string()],
            location: loc(2),
        });
        def.normalize(&Resolver::new(Namespace::root()), "config")
            .unwrap();
        def
    }

    #[test]
    fn construct_merges_on_index_hit() {
        let mut queue = RecordingQueue::with_statements(0);
        let ids = InstanceIds::new();
        let def = host_def();
        let kwargs = vec![("name".to_string(), Value::string("a"), loc(3))];
        let first = construct(&def, &kwargs, &loc(3), &ids, &mut queue).unwrap();
        let second = construct(&def, &kwargs, &loc(4), &ids, &mut queue).unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert!(Rc::ptr_eq(&first.instance, &second.instance));
        assert_eq!(def.instances().len(), 1);
    }

    #[test]
    fn merge_with_conflicting_attribute_is_double_set() {
        let mut queue = RecordingQueue::with_statements(0);
        let ids = InstanceIds::new();
        let def = EntityDefinition::new("config::Test", loc(1));
        for name in &["name", "value"] {
            def.add_member(Member::Attribute(Rc::new(Attribute {
                name: (*name).to_string(),
                ty: RefCell::new(Type::string()),
                default: RefCell::new(None),
                location: loc(1),
            })))
            .unwrap();
        }
        def.add_index(IndexDef {
            attributes: vec!["name".to_string()],
            location: loc(2),
        });
        def.normalize(&Resolver::new(Namespace::root()), "config")
            .unwrap();

        let first = vec![
            ("name".to_string(), Value::string("A"), loc(3)),
            ("value".to_string(), Value::string("a"), loc(3)),
        ];
        let second = vec![
            ("name".to_string(), Value::string("A"), loc(4)),
            ("value".to_string(), Value::string("b"), loc(4)),
        ];
        construct(&def, &first, &loc(3), &ids, &mut queue).unwrap();
        let err = construct(&def, &second, &loc(4), &ids, &mut queue).unwrap_err();
        assert!(matches!(err, CompileError::DoubleSet { .. }));
    }

    #[test]
    fn defaults_participate_in_index_keys() {
        let mut queue = RecordingQueue::with_statements(0);
        let ids = InstanceIds::new();
        let def = EntityDefinition::new("config::Test", loc(1));
        def.add_member(Member::Attribute(Rc::new(Attribute {
            name: "a".to_string(),
            ty: RefCell::new(Type::string()),
            default: RefCell::new(Some(Value::string("a"))),
            location: loc(1),
        })))
        .unwrap();
        def.add_member(Member::Attribute(Rc::new(Attribute {
            name: "b".to_string(),
            ty: RefCell::new(Type::string()),
            default: RefCell::new(None),
            location: loc(1),
        })))
        .unwrap();
        def.add_index(IndexDef {
            attributes: vec!["a".to_string(), "b".to_string()],
            location: loc(2),
        });
        def.normalize(&Resolver::new(Namespace::root()), "config")
            .unwrap();

        let kwargs = vec![("b".to_string(), Value::string("b"), loc(3))];
        let first = construct(&def, &kwargs, &loc(3), &ids, &mut queue).unwrap();
        let second = construct(&def, &kwargs, &loc(4), &ids, &mut queue).unwrap();
        assert!(Rc::ptr_eq(&first.instance, &second.instance));
    }

    #[test]
    fn finalize_reports_unset_required_attribute() {
        let mut queue = RecordingQueue::with_statements(0);
        let ids = InstanceIds::new();
        let def = host_def();
        // no index key known: construct with no kwargs
        let built = construct(&def, &[], &loc(3), &ids, &mut queue).unwrap();
        assert_eq!(built.deferred.len(), 1);
        let errors = finalize(&built.instance, &mut queue);
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            CompileError::MultiplicityUnderfill { required: 1, .. }
        ));
    }

    #[test]
    fn relation_underfill_reported_at_finalize() {
        let mut queue = RecordingQueue::with_statements(0);
        let ids = InstanceIds::new();
        let nic = EntityDefinition::new("config::Nic", loc(1));
        nic.normalize(&Resolver::new(Namespace::root()), "config")
            .unwrap();
        let server = EntityDefinition::new("config::Server", loc(2));
        server
            .add_member(Member::Relation(Rc::new(Relation {
                name: "nics".to_string(),
                target: nic,
                multiplicity: Multiplicity::at_least(1),
                inverse: None,
                location: loc(3),
            })))
            .unwrap();
        server
            .normalize(&Resolver::new(Namespace::root()), "config")
            .unwrap();

        let built = construct(&server, &[], &loc(4), &ids, &mut queue).unwrap();
        let errors = finalize(&built.instance, &mut queue);
        assert!(matches!(
            errors[0],
            CompileError::MultiplicityUnderfill { required: 1, .. }
        ));
    }
}
