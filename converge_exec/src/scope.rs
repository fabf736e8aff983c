use converge_core::ResultVariable;
use fxhash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// A lexical variable scope.
///
/// Module blocks get a root scope; for-loop bodies and implementation blocks
/// get children. Names assigned in a block are declared into its scope
/// before the block's statements are emitted, so a reference that runs
/// before the assignment suspends on the open variable instead of failing.
#[derive(Debug)]
pub struct Scope {
    parent: Option<Rc<Scope>>,
    variables: RefCell<FxHashMap<String, Rc<ResultVariable>>>,
}

impl Scope {
    pub fn root() -> Rc<Scope> {
        Rc::new(Scope {
            parent: None,
            variables: RefCell::new(FxHashMap::default()),
        })
    }

    pub fn child(self: &Rc<Self>) -> Rc<Scope> {
        Rc::new(Scope {
            parent: Some(self.clone()),
            variables: RefCell::new(FxHashMap::default()),
        })
    }

    /// Get or create the variable `name` in this scope, shadowing any outer
    /// declaration.
    pub fn declare(&self, name: &str) -> Rc<ResultVariable> {
        if let Some(existing) = self.variables.borrow().get(name) {
            return existing.clone();
        }
        let variable = Rc::new(ResultVariable::new(name, None));
        self.variables
            .borrow_mut()
            .insert(name.to_string(), variable.clone());
        variable
    }

    /// Walk the scope chain for `name`.
    pub fn lookup(&self, name: &str) -> Option<Rc<ResultVariable>> {
        if let Some(variable) = self.variables.borrow().get(name) {
            return Some(variable.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_then_lookup() {
        let scope = Scope::root();
        let declared = scope.declare("x");
        let found = scope.lookup("x").unwrap();
        assert!(Rc::ptr_eq(&declared, &found));
    }

    #[test]
    fn children_see_outer_names() {
        let root = Scope::root();
        root.declare("x");
        let child = root.child();
        assert!(child.lookup("x").is_some());
        assert!(child.lookup("y").is_none());
    }

    #[test]
    fn child_declarations_shadow() {
        let root = Scope::root();
        let outer = root.declare("x");
        let child = root.child();
        let inner = child.declare("x");
        assert!(!Rc::ptr_eq(&outer, &inner));
        assert!(Rc::ptr_eq(&root.lookup("x").unwrap(), &outer));
    }
}
