use crate::entity::EntityDefinition;
use crate::error::{CompileError, Location};
use crate::plugin::PluginFunction;
use crate::types::{Primitive, Type};
use fxhash::FxHashMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// A symbol registered in a namespace: a type or a plugin callable.
#[derive(Clone, Debug)]
pub enum Symbol {
    Type(Type),
    Plugin(Rc<PluginFunction>),
}

impl Symbol {
    fn location(&self) -> Location {
        match self {
            Symbol::Type(Type::Entity(def)) => def.location().clone(),
            Symbol::Type(Type::Constrained(td)) => td.location().clone(),
            _ => Location::internal(),
        }
    }
}

/// A node in the hierarchical namespace tree. The root holds the built-in
/// primitives; every module gets a child namespace holding its entities,
/// typedefs and plugins.
pub struct Namespace {
    name: String,
    full_name: String,
    parent: RefCell<Weak<Namespace>>,
    children: RefCell<FxHashMap<String, Rc<Namespace>>>,
    symbols: RefCell<FxHashMap<String, Symbol>>,
}

impl Namespace {
    /// The root namespace, pre-populated with the primitive types.
    pub fn root() -> Rc<Namespace> {
        let root = Rc::new(Namespace {
            name: String::new(),
            full_name: String::new(),
            parent: RefCell::new(Weak::new()),
            children: RefCell::new(FxHashMap::default()),
            symbols: RefCell::new(FxHashMap::default()),
        });
        let primitives = [
            ("string", Type::Primitive(Primitive::String)),
            ("number", Type::Primitive(Primitive::Number)),
            ("int", Type::Primitive(Primitive::Int)),
            ("float", Type::Primitive(Primitive::Float)),
            ("bool", Type::Primitive(Primitive::Bool)),
            ("list", Type::list_of(Type::any())),
        ];
        for (name, ty) in primitives.iter() {
            root.symbols
                .borrow_mut()
                .insert((*name).to_string(), Symbol::Type(ty.clone()));
        }
        root
    }

    /// Get or create the child namespace with the given name.
    pub fn child(self: &Rc<Self>, name: &str) -> Rc<Namespace> {
        if let Some(existing) = self.children.borrow().get(name) {
            return existing.clone();
        }
        let full_name = if self.full_name.is_empty() {
            name.to_string()
        } else {
            format!("{}::{}", self.full_name, name)
        };
        let child = Rc::new(Namespace {
            name: name.to_string(),
            full_name,
            parent: RefCell::new(Rc::downgrade(self)),
            children: RefCell::new(FxHashMap::default()),
            symbols: RefCell::new(FxHashMap::default()),
        });
        self.children
            .borrow_mut()
            .insert(name.to_string(), child.clone());
        child
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn parent(&self) -> Option<Rc<Namespace>> {
        self.parent.borrow().upgrade()
    }

    pub fn get_child(&self, name: &str) -> Option<Rc<Namespace>> {
        self.children.borrow().get(name).cloned()
    }

    pub fn get_symbol(&self, name: &str) -> Option<Symbol> {
        self.symbols.borrow().get(name).cloned()
    }

    /// Register a symbol, rejecting redefinitions.
    pub fn define(
        &self,
        name: &str,
        symbol: Symbol,
        location: &Location,
    ) -> Result<(), CompileError> {
        let mut symbols = self.symbols.borrow_mut();
        if let Some(existing) = symbols.get(name) {
            return Err(CompileError::Duplicate {
                message: format!("{} is already defined in namespace {}", name, self),
                location: location.clone(),
                other: existing.location(),
            });
        }
        symbols.insert(name.to_string(), symbol);
        Ok(())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.full_name.is_empty() {
            write!(f, "__root__")
        } else {
            write!(f, "{}", self.full_name)
        }
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Namespace({})", self)
    }
}

/// Resolves names against the namespace tree.
///
/// Qualified names (`module::Name`) walk down from the root; simple names
/// resolve in the referencing namespace first and fall back to the root so
/// the primitives are visible everywhere.
pub struct Resolver {
    root: Rc<Namespace>,
}

impl Resolver {
    pub fn new(root: Rc<Namespace>) -> Self {
        Resolver { root }
    }

    pub fn root(&self) -> &Rc<Namespace> {
        &self.root
    }

    fn namespace(&self, full_name: &str) -> Option<Rc<Namespace>> {
        let mut current = self.root.clone();
        if full_name.is_empty() {
            return Some(current);
        }
        for part in full_name.split("::") {
            let next = current.get_child(part)?;
            current = next;
        }
        Some(current)
    }

    /// Look up a symbol by (possibly qualified) name, as seen from the
    /// namespace `from`.
    pub fn lookup(&self, name: &str, from: &str) -> Option<Symbol> {
        if let Some(split) = name.rfind("::") {
            let (ns_path, simple) = (&name[..split], &name[split + 2..]);
            return self.namespace(ns_path)?.get_symbol(simple);
        }
        if let Some(ns) = self.namespace(from) {
            if let Some(symbol) = ns.get_symbol(name) {
                return Some(symbol);
            }
        }
        self.root.get_symbol(name)
    }

    pub fn lookup_type(
        &self,
        name: &str,
        from: &str,
        location: &Location,
    ) -> Result<Type, CompileError> {
        match self.lookup(name, from) {
            Some(Symbol::Type(ty)) => Ok(ty),
            _ => Err(CompileError::TypeNotFound {
                name: name.to_string(),
                namespace: if from.is_empty() {
                    "__root__".to_string()
                } else {
                    from.to_string()
                },
                location: location.clone(),
            }),
        }
    }

    pub fn lookup_entity(
        &self,
        name: &str,
        from: &str,
        location: &Location,
    ) -> Result<Rc<EntityDefinition>, CompileError> {
        match self.lookup_type(name, from, location)? {
            Type::Entity(def) => Ok(def),
            other => Err(CompileError::typing(
                format!("{} is not an entity type", other),
                location.clone(),
            )),
        }
    }

    pub fn lookup_plugin(
        &self,
        name: &str,
        from: &str,
        location: &Location,
    ) -> Result<Rc<PluginFunction>, CompileError> {
        match self.lookup(name, from) {
            Some(Symbol::Plugin(plugin)) => Ok(plugin),
            _ => Err(CompileError::NameNotFound {
                name: name.to_string(),
                location: location.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_visible_from_everywhere() {
        let root = Namespace::root();
        let config = root.child("config");
        let resolver = Resolver::new(root);
        let ty = resolver
            .lookup_type("string", config.full_name(), &Location::new("t", 1))
            .unwrap();
        assert!(matches!(ty, Type::Primitive(Primitive::String)));
    }

    #[test]
    fn qualified_lookup_walks_from_root() {
        let root = Namespace::root();
        let std_ns = root.child("std");
        std_ns
            .define(
                "port",
                Symbol::Type(Type::number()),
                &Location::new("t", 1),
            )
            .unwrap();
        let resolver = Resolver::new(root);
        assert!(resolver
            .lookup_type("std::port", "config", &Location::new("t", 2))
            .is_ok());
    }

    #[test]
    fn duplicate_definitions_rejected() {
        let root = Namespace::root();
        let ns = root.child("config");
        let loc = Location::new("t", 1);
        ns.define("A", Symbol::Type(Type::bool()), &loc).unwrap();
        assert!(ns.define("A", Symbol::Type(Type::bool()), &loc).is_err());
    }

    #[test]
    fn missing_type_reports_namespace() {
        let root = Namespace::root();
        let resolver = Resolver::new(root);
        let err = resolver
            .lookup_type("Missing", "config", &Location::new("t", 3))
            .unwrap_err();
        match err {
            CompileError::TypeNotFound { name, .. } => assert_eq!(name, "Missing"),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
