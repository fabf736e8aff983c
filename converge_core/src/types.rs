use crate::entity::EntityDefinition;
use crate::error::{CompileError, Location};
use crate::namespace::Resolver;
use crate::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// The built-in scalar types every model starts from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Primitive {
    String,
    Number,
    Int,
    Float,
    Bool,
    /// Accepts any value; the element type of the untyped `list` primitive.
    Any,
}

impl Primitive {
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::String => "string",
            Primitive::Number => "number",
            Primitive::Int => "int",
            Primitive::Float => "float",
            Primitive::Bool => "bool",
            Primitive::Any => "any",
        }
    }
}

/// Constraint predicate of a typedef, closed over the constraint expression.
/// Returns whether the value satisfies the constraint, or a message when the
/// expression itself cannot be evaluated against the value.
pub type Predicate = Rc<dyn Fn(&Value) -> Result<bool, String>>;

/// A named refinement of a base type, e.g. a port number being an int within
/// bounds, or a string matching a pattern.
pub struct TypeDef {
    name: String,
    location: Location,
    base: RefCell<Type>,
    predicate: Predicate,
}

impl TypeDef {
    pub fn new(name: String, location: Location, base: Type, predicate: Predicate) -> Self {
        TypeDef {
            name,
            location,
            base: RefCell::new(base),
            predicate,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn normalize(&self, resolver: &Resolver, from: &str) -> Result<(), CompileError> {
        let location = self.location.clone();
        self.base.borrow_mut().normalize(resolver, from, &location)
    }
}

impl fmt::Debug for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TypeDef")
            .field("name", &self.name)
            .field("base", &self.base)
            .finish()
    }
}

/// A reference to a type in the model.
///
/// Forward references are carried as `Unresolved` until the first compiler
/// phase has created every type; `normalize` then rewrites them in place.
/// After normalization no `Unresolved` reference remains anywhere.
#[derive(Clone, Debug)]
pub enum Type {
    Primitive(Primitive),
    List(Box<Type>),
    Nullable(Box<Type>),
    Constrained(Rc<TypeDef>),
    Entity(Rc<EntityDefinition>),
    Unresolved(String),
}

impl Type {
    pub fn string() -> Self {
        Type::Primitive(Primitive::String)
    }

    pub fn number() -> Self {
        Type::Primitive(Primitive::Number)
    }

    pub fn bool() -> Self {
        Type::Primitive(Primitive::Bool)
    }

    pub fn any() -> Self {
        Type::Primitive(Primitive::Any)
    }

    pub fn list_of(element: Type) -> Self {
        Type::List(Box::new(element))
    }

    pub fn nullable(inner: Type) -> Self {
        Type::Nullable(Box::new(inner))
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, Type::Nullable(_))
    }

    pub fn is_list(&self) -> bool {
        match self {
            Type::List(_) => true,
            Type::Constrained(td) => td.base.borrow().is_list(),
            _ => false,
        }
    }

    pub fn as_entity(&self) -> Option<&Rc<EntityDefinition>> {
        match self {
            Type::Entity(def) => Some(def),
            _ => None,
        }
    }

    /// Resolve forward references once the namespace is complete. `from` is
    /// the fully qualified name of the namespace the reference was written in.
    pub fn normalize(
        &mut self,
        resolver: &Resolver,
        from: &str,
        location: &Location,
    ) -> Result<(), CompileError> {
        match self {
            Type::Unresolved(name) => {
                let resolved = resolver.lookup_type(name, from, location)?;
                *self = resolved;
                Ok(())
            }
            Type::List(inner) | Type::Nullable(inner) => inner.normalize(resolver, from, location),
            _ => Ok(()),
        }
    }

    /// Check a value against this type. `Unknown` passes every check: it
    /// stands for a value that will be produced downstream.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        if value.is_unknown() {
            return Ok(());
        }
        match self {
            Type::Primitive(p) => validate_primitive(*p, value),
            Type::List(element) => match value {
                Value::List(items) => {
                    for item in items {
                        element.validate(item)?;
                    }
                    Ok(())
                }
                other => Err(format!("expected a list, got {}", other.kind())),
            },
            Type::Nullable(inner) => {
                if value.is_null() {
                    Ok(())
                } else {
                    inner.validate(value)
                }
            }
            Type::Constrained(td) => {
                td.base.borrow().validate(value)?;
                match (td.predicate)(value) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(format!(
                        "value {} violates the constraint of typedef {}",
                        value,
                        td.name()
                    )),
                    Err(message) => Err(message),
                }
            }
            Type::Entity(def) => match value {
                Value::Instance(instance) => {
                    if instance.definition().is_subtype_of(def) {
                        Ok(())
                    } else {
                        Err(format!(
                            "invalid class type for {}, should be {}",
                            instance,
                            def.name()
                        ))
                    }
                }
                other => Err(format!("expected an instance of {}, got {}", def.name(), other.kind())),
            },
            Type::Unresolved(name) => Err(format!("reference to unresolved type {}", name)),
        }
    }
}

fn validate_primitive(primitive: Primitive, value: &Value) -> Result<(), String> {
    let ok = match primitive {
        Primitive::String => matches!(value, Value::String(_)),
        Primitive::Number => matches!(value, Value::Int(_) | Value::Float(_)),
        Primitive::Int => matches!(value, Value::Int(_)),
        Primitive::Float => matches!(value, Value::Float(_) | Value::Int(_)),
        Primitive::Bool => matches!(value, Value::Bool(_)),
        Primitive::Any => true,
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "expected {}, got {} ({})",
            primitive.name(),
            value.kind(),
            value
        ))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Type::Primitive(p) => write!(f, "{}", p.name()),
            Type::List(inner) => write!(f, "{}[]", inner),
            Type::Nullable(inner) => write!(f, "{}?", inner),
            Type::Constrained(td) => write!(f, "{}", td.name()),
            Type::Entity(def) => write!(f, "{}", def.name()),
            Type::Unresolved(name) => write!(f, "<unresolved {}>", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_validation() {
        assert!(Type::string().validate(&Value::string("a")).is_ok());
        assert!(Type::string().validate(&Value::Int(1)).is_err());
        assert!(Type::number().validate(&Value::Float(1.5)).is_ok());
    }

    #[test]
    fn unknown_validates_everywhere() {
        assert!(Type::string().validate(&Value::Unknown).is_ok());
        assert!(Type::list_of(Type::bool()).validate(&Value::Unknown).is_ok());
    }

    #[test]
    fn nullable_accepts_null() {
        let ty = Type::nullable(Type::string());
        assert!(ty.validate(&Value::Null).is_ok());
        assert!(Type::string().validate(&Value::Null).is_err());
    }

    #[test]
    fn constrained_checks_base_and_predicate() {
        let positive: Predicate = Rc::new(|v| match v.as_f64() {
            Some(n) => Ok(n > 0.0),
            None => Err("can only compare numbers".to_string()),
        });
        let td = Rc::new(TypeDef::new(
            "port".to_string(),
            Location::new("test", 1),
            Type::number(),
            positive,
        ));
        let ty = Type::Constrained(td);
        assert!(ty.validate(&Value::Int(80)).is_ok());
        assert!(ty.validate(&Value::Int(-1)).is_err());
        assert!(ty.validate(&Value::string("x")).is_err());
    }
}
