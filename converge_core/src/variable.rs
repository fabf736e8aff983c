use crate::entity::Multiplicity;
use crate::error::{CompileError, Location};
use crate::instance::Instance;
use crate::types::Type;
use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Weak;

/// Index of a scheduled statement in the scheduler's arena. Waiter lists are
/// threaded through the statements themselves: a variable stores the head of
/// its waiter chain and every statement carries a single inline `next` link,
/// so registering a waiter never allocates.
pub type StatementId = usize;

/// The scheduler surface the variable machinery needs: waking a waiter chain
/// and linking a statement into one. Implemented by the queue scheduler; the
/// variables themselves never touch the queues directly.
pub trait WorkQueue {
    /// Move every statement in the chain starting at `head` onto the
    /// runnable queue.
    fn wake(&mut self, head: StatementId);

    /// Link `statement` in front of `next`, returning the new chain head.
    fn link(&mut self, statement: StatementId, next: Option<StatementId>) -> StatementId;
}

/// State of a single-valued result variable. Transitions are monotonic:
/// `Open -> Bound -> BoundFrozen` or `Open -> Frozen`, never backwards.
#[derive(Clone, Debug)]
pub enum VariableState {
    Open,
    Bound(Value),
    Frozen,
    BoundFrozen(Value),
}

/// A typed write-once cell.
///
/// Statements that need the value while it is still `Open` register as
/// waiters and are re-run when the variable is bound or frozen. The promise
/// counter tracks producers that have been scheduled but have not yet
/// delivered; a variable with outstanding promises is not a freeze candidate.
pub struct ResultVariable {
    label: String,
    ty: Option<Type>,
    state: RefCell<VariableState>,
    first_set: RefCell<Option<Location>>,
    waiters: Cell<Option<StatementId>>,
    promised: Cell<u32>,
    queued: Cell<bool>,
}

impl ResultVariable {
    pub fn new(label: impl Into<String>, ty: Option<Type>) -> Self {
        ResultVariable {
            label: label.into(),
            ty,
            state: RefCell::new(VariableState::Open),
            first_set: RefCell::new(None),
            waiters: Cell::new(None),
            promised: Cell::new(0),
            queued: Cell::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ty(&self) -> Option<&Type> {
        self.ty.as_ref()
    }

    pub fn state(&self) -> VariableState {
        self.state.borrow().clone()
    }

    pub fn value(&self) -> Option<Value> {
        match &*self.state.borrow() {
            VariableState::Bound(v) | VariableState::BoundFrozen(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(&*self.state.borrow(), VariableState::Open)
    }

    pub fn is_bound(&self) -> bool {
        matches!(
            &*self.state.borrow(),
            VariableState::Bound(_) | VariableState::BoundFrozen(_)
        )
    }

    pub fn is_frozen(&self) -> bool {
        matches!(
            &*self.state.borrow(),
            VariableState::Frozen | VariableState::BoundFrozen(_)
        )
    }

    /// Bind the variable. Idempotent when the new value equals the current
    /// one; a conflicting second write is a `DoubleSet` error. Binding wakes
    /// every waiter.
    pub fn set(
        &self,
        value: Value,
        location: &Location,
        queue: &mut dyn WorkQueue,
    ) -> Result<(), CompileError> {
        {
            let state = self.state.borrow();
            match &*state {
                VariableState::Bound(old) | VariableState::BoundFrozen(old) => {
                    return if *old == value {
                        Ok(())
                    } else {
                        Err(CompileError::DoubleSet {
                            target: self.label.clone(),
                            old: old.clone(),
                            new: value,
                            first: self
                                .first_set
                                .borrow()
                                .clone()
                                .unwrap_or_else(Location::internal),
                            location: location.clone(),
                        })
                    };
                }
                VariableState::Frozen => {
                    return Err(CompileError::typing(
                        format!("{} was set after it was frozen", self.label),
                        location.clone(),
                    ));
                }
                VariableState::Open => {}
            }
        }
        if let Some(ty) = &self.ty {
            ty.validate(&value).map_err(|message| {
                CompileError::typing(
                    format!("could not set {}: {}", self.label, message),
                    location.clone(),
                )
            })?;
        }
        *self.state.borrow_mut() = VariableState::Bound(value);
        *self.first_set.borrow_mut() = Some(location.clone());
        if let Some(head) = self.waiters.take() {
            queue.wake(head);
        }
        Ok(())
    }

    /// Irreversibly close the variable, waking all waiters. Freezing a bound
    /// variable keeps its value; freezing an open one leaves it empty.
    pub fn freeze(&self, queue: &mut dyn WorkQueue) {
        let next = match &*self.state.borrow() {
            VariableState::Open => VariableState::Frozen,
            VariableState::Bound(v) => VariableState::BoundFrozen(v.clone()),
            _ => return,
        };
        *self.state.borrow_mut() = next;
        if let Some(head) = self.waiters.take() {
            queue.wake(head);
        }
    }

    /// Suspend `statement` until this variable is bound or frozen.
    pub fn await_waiter(&self, statement: StatementId, queue: &mut dyn WorkQueue) {
        let head = queue.link(statement, self.waiters.get());
        self.waiters.set(Some(head));
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters.get().is_some()
    }

    /// A producer statement announced it will deliver a value here.
    pub fn promise(&self) {
        self.promised.set(self.promised.get() + 1);
    }

    /// The producer completed (with or without delivering).
    pub fn fulfil(&self) {
        let n = self.promised.get();
        self.promised.set(n.saturating_sub(1));
    }

    /// Freeze candidates must have no producer that could still deliver.
    pub fn can_freeze(&self) -> bool {
        self.promised.get() == 0
    }

    /// Mark as enqueued on the scheduler's freeze queues. Returns false when
    /// it already was, so a variable is queued at most once.
    pub fn mark_queued(&self) -> bool {
        if self.queued.get() {
            false
        } else {
            self.queued.set(true);
            true
        }
    }
}

impl fmt::Debug for ResultVariable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ResultVariable({}, {:?})", self.label, self.state.borrow())
    }
}

/// An accumulating relation variable with multiplicity bounds.
///
/// Values are kept in insertion order. Instances obey set semantics (a
/// duplicate insert is a no-op), scalars multiset semantics. The variable is
/// readable once it is frozen, or once it is full: a list that has reached
/// its upper bound can never change again, which is what lets `[1]`
/// relations collapse to scalar access without waiting for a freeze wave.
pub struct ListVariable {
    label: String,
    element: Type,
    multiplicity: Multiplicity,
    location: Location,
    owner: Weak<Instance>,
    inverse: Option<String>,
    values: RefCell<Vec<(Value, Location)>>,
    frozen: Cell<bool>,
    waiters: Cell<Option<StatementId>>,
    outstanding: Cell<u32>,
    queued: Cell<bool>,
}

impl ListVariable {
    pub fn new(
        label: impl Into<String>,
        element: Type,
        multiplicity: Multiplicity,
        location: Location,
        owner: Weak<Instance>,
        inverse: Option<String>,
    ) -> Self {
        ListVariable {
            label: label.into(),
            element,
            multiplicity,
            location,
            owner,
            inverse,
            values: RefCell::new(Vec::new()),
            frozen: Cell::new(false),
            waiters: Cell::new(None),
            outstanding: Cell::new(0),
            queued: Cell::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn multiplicity(&self) -> &Multiplicity {
        &self.multiplicity
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn len(&self) -> usize {
        self.values.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.borrow().is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get()
    }

    fn is_full(&self) -> bool {
        match self.multiplicity.hi {
            Some(hi) => self.len() >= hi,
            None => false,
        }
    }

    /// Whether readers may observe the value set. Frozen lists are closed;
    /// full lists can no longer change.
    pub fn is_readable(&self) -> bool {
        self.frozen.get() || self.is_full()
    }

    pub fn values(&self) -> Vec<Value> {
        self.values.borrow().iter().map(|(v, _)| v.clone()).collect()
    }

    /// Append a value, preserving insertion order. Returns whether the value
    /// was new. Inserting into a paired relation writes the owner back into
    /// the inverse end; the identity check is what terminates that
    /// recursion.
    pub fn insert(
        &self,
        value: Value,
        location: &Location,
        queue: &mut dyn WorkQueue,
    ) -> Result<bool, CompileError> {
        let duplicate = matches!(&value, Value::Instance(_))
            && self.values.borrow().iter().any(|(v, _)| *v == value);
        if duplicate {
            return Ok(false);
        }
        if self.frozen.get() {
            return Err(CompileError::typing(
                format!("{} was modified after it was frozen", self.label),
                location.clone(),
            ));
        }
        self.element.validate(&value).map_err(|message| {
            CompileError::typing(
                format!("could not add to {}: {}", self.label, message),
                location.clone(),
            )
        })?;
        if self.is_full() {
            // idempotent on a value already present
            if self.values.borrow().iter().any(|(v, _)| *v == value) {
                return Ok(false);
            }
            let values = self.values.borrow();
            return Err(match (self.multiplicity.hi, values.first()) {
                (Some(1), Some((old, first))) => CompileError::DoubleSet {
                    target: self.label.clone(),
                    old: old.clone(),
                    new: value,
                    first: first.clone(),
                    location: location.clone(),
                },
                _ => CompileError::typing(
                    format!(
                        "{} accepts at most {} values",
                        self.label,
                        self.multiplicity.hi.unwrap_or(0)
                    ),
                    location.clone(),
                ),
            });
        }

        self.values
            .borrow_mut()
            .push((value.clone(), location.clone()));

        if let (Some(inverse), Value::Instance(target)) = (&self.inverse, &value) {
            if let Some(owner) = self.owner.upgrade() {
                if let Some(other_end) = target.relation(inverse) {
                    other_end.insert(Value::Instance(owner), location, queue)?;
                }
            }
        }

        if self.is_readable() {
            if let Some(head) = self.waiters.take() {
                queue.wake(head);
            }
        }
        Ok(true)
    }

    /// Close the set. Reports an underfill when fewer than `lo` values were
    /// collected, but freezes regardless so the fixpoint can terminate.
    pub fn freeze(&self, queue: &mut dyn WorkQueue) -> Result<(), CompileError> {
        if self.frozen.get() {
            return Ok(());
        }
        self.frozen.set(true);
        if let Some(head) = self.waiters.take() {
            queue.wake(head);
        }
        let len = self.len();
        if len < self.multiplicity.lo {
            return Err(CompileError::MultiplicityUnderfill {
                target: self.label.clone(),
                required: self.multiplicity.lo,
                actual: len,
                location: self.location.clone(),
            });
        }
        Ok(())
    }

    pub fn await_waiter(&self, statement: StatementId, queue: &mut dyn WorkQueue) {
        let head = queue.link(statement, self.waiters.get());
        self.waiters.set(Some(head));
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters.get().is_some()
    }

    /// A statement announced it will insert here but has not completed yet.
    pub fn register_producer(&self) {
        self.outstanding.set(self.outstanding.get() + 1);
    }

    pub fn complete_producer(&self) {
        let n = self.outstanding.get();
        self.outstanding.set(n.saturating_sub(1));
    }

    pub fn can_freeze(&self) -> bool {
        self.outstanding.get() == 0
    }

    pub fn mark_queued(&self) -> bool {
        if self.queued.get() {
            false
        } else {
            self.queued.set(true);
            true
        }
    }
}

impl fmt::Debug for ListVariable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ListVariable({}, {} values, frozen: {})",
            self.label,
            self.len(),
            self.frozen.get()
        )
    }
}

#[cfg(test)]
pub(crate) mod test_queue {
    use super::*;

    /// Minimal WorkQueue for unit tests: links live in a side table.
    #[derive(Default)]
    pub struct RecordingQueue {
        pub links: Vec<Option<StatementId>>,
        pub woken: Vec<StatementId>,
    }

    impl RecordingQueue {
        pub fn with_statements(n: usize) -> Self {
            RecordingQueue {
                links: vec![None; n],
                woken: Vec::new(),
            }
        }
    }

    impl WorkQueue for RecordingQueue {
        fn wake(&mut self, head: StatementId) {
            let mut cursor = Some(head);
            while let Some(id) = cursor {
                cursor = self.links[id].take();
                self.woken.push(id);
            }
        }

        fn link(&mut self, statement: StatementId, next: Option<StatementId>) -> StatementId {
            self.links[statement] = next;
            statement
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_queue::RecordingQueue;
    use super::*;

    fn loc() -> Location {
        Location::new("test", 1)
    }

    #[test]
    fn set_is_idempotent_on_equal_values() {
        let mut queue = RecordingQueue::with_statements(0);
        let rv = ResultVariable::new("x", Some(Type::string()));
        rv.set(Value::string("a"), &loc(), &mut queue).unwrap();
        assert!(rv.set(Value::string("a"), &loc(), &mut queue).is_ok());
    }

    #[test]
    fn conflicting_set_is_double_set() {
        let mut queue = RecordingQueue::with_statements(0);
        let rv = ResultVariable::new("x", Some(Type::string()));
        rv.set(Value::string("a"), &loc(), &mut queue).unwrap();
        let err = rv.set(Value::string("b"), &loc(), &mut queue).unwrap_err();
        assert!(matches!(err, CompileError::DoubleSet { .. }));
    }

    #[test]
    fn typed_variable_rejects_mismatched_values() {
        let mut queue = RecordingQueue::with_statements(0);
        let rv = ResultVariable::new("x", Some(Type::number()));
        assert!(rv.set(Value::string("a"), &loc(), &mut queue).is_err());
    }

    #[test]
    fn set_wakes_the_whole_waiter_chain() {
        let mut queue = RecordingQueue::with_statements(3);
        let rv = ResultVariable::new("x", None);
        rv.await_waiter(0, &mut queue);
        rv.await_waiter(1, &mut queue);
        rv.await_waiter(2, &mut queue);
        rv.set(Value::Bool(true), &loc(), &mut queue).unwrap();
        assert_eq!(queue.woken, vec![2, 1, 0]);
        assert!(!rv.has_waiters());
    }

    #[test]
    fn freeze_open_variable_is_empty() {
        let mut queue = RecordingQueue::with_statements(1);
        let rv = ResultVariable::new("x", None);
        rv.await_waiter(0, &mut queue);
        rv.freeze(&mut queue);
        assert!(rv.is_frozen());
        assert!(rv.value().is_none());
        assert_eq!(queue.woken, vec![0]);
    }

    #[test]
    fn list_preserves_insertion_order() {
        let mut queue = RecordingQueue::with_statements(0);
        let lv = ListVariable::new(
            "xs",
            Type::any(),
            Multiplicity::at_least(0),
            loc(),
            Weak::new(),
            None,
        );
        for v in &["a", "b", "c"] {
            lv.insert(Value::string(*v), &loc(), &mut queue).unwrap();
        }
        assert_eq!(
            lv.values(),
            vec![Value::string("a"), Value::string("b"), Value::string("c")]
        );
    }

    #[test]
    fn list_freeze_reports_underfill() {
        let mut queue = RecordingQueue::with_statements(0);
        let lv = ListVariable::new(
            "xs",
            Type::any(),
            Multiplicity::at_least(2),
            loc(),
            Weak::new(),
            None,
        );
        lv.insert(Value::Int(1), &loc(), &mut queue).unwrap();
        let err = lv.freeze(&mut queue).unwrap_err();
        assert!(matches!(
            err,
            CompileError::MultiplicityUnderfill {
                required: 2,
                actual: 1,
                ..
            }
        ));
        assert!(lv.is_frozen());
    }

    #[test]
    fn full_single_relation_is_readable_without_freeze() {
        let mut queue = RecordingQueue::with_statements(0);
        let lv = ListVariable::new(
            "host",
            Type::any(),
            Multiplicity::exactly(1),
            loc(),
            Weak::new(),
            None,
        );
        assert!(!lv.is_readable());
        lv.insert(Value::Int(9), &loc(), &mut queue).unwrap();
        assert!(lv.is_readable());
        let err = lv.insert(Value::Int(10), &loc(), &mut queue).unwrap_err();
        assert!(matches!(err, CompileError::DoubleSet { .. }));
    }

    #[test]
    fn producer_counting_gates_freeze() {
        let lv = ListVariable::new(
            "xs",
            Type::any(),
            Multiplicity::at_least(0),
            loc(),
            Weak::new(),
            None,
        );
        assert!(lv.can_freeze());
        lv.register_producer();
        assert!(!lv.can_freeze());
        lv.complete_producer();
        assert!(lv.can_freeze());
    }
}
