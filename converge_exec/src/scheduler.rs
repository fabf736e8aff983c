use crate::ast::{Block, ImplementClause};
use crate::scope::Scope;
use crate::statement::{BlockedOn, Poll, StatementInstance, StatementKind};
use bit_set::BitSet;
use converge_core::{
    finalize, CompileError, Diagnostics, EntityDefinition, InstanceIds, Instance, ListVariable,
    ResultVariable, StatementId, WorkQueue,
};
use fxhash::FxHashMap;
use std::collections::VecDeque;
use std::rc::Rc;

/// Iteration ceiling for the fixpoint loop. Reaching it means the producer
/// bookkeeping is broken somewhere; it is a guard, not part of the
/// termination argument.
pub const MAX_ITERATIONS: usize = 500;

/// Knobs for one compile.
#[derive(Clone, Debug)]
pub struct CompileOptions {
    pub max_iterations: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            max_iterations: MAX_ITERATIONS,
        }
    }
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

/// A variable the scheduler may close in a freeze wave: a relation list or
/// an instance attribute / index slot.
enum FreezeCandidate {
    Single(Rc<ResultVariable>),
    List(Rc<ListVariable>),
}

impl FreezeCandidate {
    /// Already resolved elsewhere; nothing left to do.
    fn settled(&self) -> bool {
        match self {
            FreezeCandidate::Single(v) => v.is_bound() || v.is_frozen(),
            FreezeCandidate::List(l) => l.is_frozen(),
        }
    }

    fn has_waiters(&self) -> bool {
        match self {
            FreezeCandidate::Single(v) => v.has_waiters(),
            FreezeCandidate::List(l) => l.has_waiters(),
        }
    }

    /// Freezing is legal only when no scheduled producer could still
    /// deliver.
    fn can_freeze(&self) -> bool {
        match self {
            FreezeCandidate::Single(v) => v.can_freeze(),
            FreezeCandidate::List(l) => l.can_freeze(),
        }
    }

    fn label(&self) -> String {
        match self {
            FreezeCandidate::Single(v) => v.label().to_string(),
            FreezeCandidate::List(l) => l.label().to_string(),
        }
    }
}

/// The queue scheduler: drives every emitted statement to completion,
/// promotes stalled variables through freeze waves, and finally freezes the
/// whole model.
///
/// Three queues: `runnable` statements, the `waitqueue` of freeze
/// candidates, and `zerowaiters` for candidates nobody is waiting on yet.
/// All three are FIFO; together with the arena order of statements this
/// makes the freeze sequence, and therefore the resulting instance set,
/// deterministic.
pub struct Engine {
    slots: Vec<Rc<StatementInstance>>,
    done: BitSet,
    runnable: VecDeque<StatementId>,
    waitqueue: VecDeque<FreezeCandidate>,
    zerowaiters: VecDeque<FreezeCandidate>,
    scopes: FxHashMap<String, Rc<Scope>>,
    implements: FxHashMap<String, Vec<Rc<ImplementClause>>>,
    entities: Vec<Rc<EntityDefinition>>,
    ids: Rc<InstanceIds>,
    diagnostics: Diagnostics,
    options: CompileOptions,
    executed: usize,
    converged: bool,
}

impl Engine {
    pub fn new(
        entities: Vec<Rc<EntityDefinition>>,
        implements: FxHashMap<String, Vec<Rc<ImplementClause>>>,
        options: CompileOptions,
    ) -> Engine {
        Engine {
            slots: Vec::new(),
            done: BitSet::new(),
            runnable: VecDeque::new(),
            waitqueue: VecDeque::new(),
            zerowaiters: VecDeque::new(),
            scopes: FxHashMap::default(),
            implements,
            entities,
            ids: Rc::new(InstanceIds::new()),
            diagnostics: Diagnostics::new(),
            options,
            executed: 0,
            converged: false,
        }
    }

    pub fn instance_ids(&self) -> Rc<InstanceIds> {
        self.ids.clone()
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    pub fn entities(&self) -> &[Rc<EntityDefinition>] {
        &self.entities
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn add_module_scope(&mut self, namespace: &str, scope: Rc<Scope>) {
        self.scopes.insert(namespace.to_string(), scope);
    }

    pub fn scope_for(&self, namespace: &str) -> Option<Rc<Scope>> {
        self.scopes.get(namespace).cloned()
    }

    /// Schedule a statement onto the runnable queue.
    pub fn emit(
        &mut self,
        kind: StatementKind,
        scope: Rc<Scope>,
        namespace: &str,
    ) -> StatementId {
        let id = self.slots.len();
        self.slots.push(Rc::new(StatementInstance::new(
            kind,
            scope,
            namespace.to_string(),
        )));
        self.runnable.push_back(id);
        id
    }

    /// Declare a block's assigned names into `scope`, then schedule all of
    /// its statements in source order.
    pub fn emit_block(&mut self, block: &Rc<Block>, scope: &Rc<Scope>, namespace: &str) {
        for name in block.declared.borrow().iter() {
            scope.declare(name);
        }
        for stmt in &block.statements {
            self.emit(StatementKind::Stmt(stmt.clone()), scope.clone(), namespace);
        }
    }

    pub fn emit_register_index(
        &mut self,
        instance: &Rc<Instance>,
        declarer: Rc<EntityDefinition>,
        position: usize,
    ) {
        self.emit(
            StatementKind::RegisterIndex {
                instance: instance.clone(),
                declarer,
                position,
            },
            Scope::root(),
            "",
        );
    }

    /// Schedule every implementation candidate attached to the instance's
    /// entity or one of its ancestors. Each candidate gets a fresh scope
    /// with `self` bound.
    pub fn emit_implementations(&mut self, instance: &Rc<Instance>) {
        let mut clauses = Vec::new();
        for def in instance.definition().linearized() {
            if let Some(attached) = self.implements.get(def.name()) {
                clauses.extend(attached.iter().cloned());
            }
        }
        for clause in clauses {
            let parent = self
                .scope_for(&clause.namespace)
                .unwrap_or_else(Scope::root);
            let scope = parent.child();
            let self_var = scope.declare("self");
            if let Err(error) = self_var.set(
                converge_core::Value::Instance(instance.clone()),
                instance.location(),
                self,
            ) {
                self.diagnostics.report(error);
                continue;
            }
            let namespace = clause.namespace.clone();
            self.emit(
                StatementKind::Implement {
                    instance: instance.clone(),
                    clause,
                },
                scope,
                &namespace,
            );
        }
    }

    /// The fixpoint loop: drain runnable statements, then promote stalled
    /// variables by freezing, until nothing is left or the iteration
    /// ceiling is hit.
    pub fn run(&mut self) {
        let mut iteration = 0;
        loop {
            if self.runnable.is_empty()
                && self.waitqueue.is_empty()
                && self.zerowaiters.is_empty()
            {
                self.converged = true;
                break;
            }
            if iteration >= self.options.max_iterations {
                self.diagnostics.report(CompileError::FixpointExhausted {
                    iterations: iteration,
                });
                break;
            }
            iteration += 1;
            tracing::debug!(
                iteration,
                e = self.runnable.len(),
                w = self.waitqueue.len(),
                p = self.zerowaiters.len(),
                done = self.executed,
                "scheduler iteration"
            );

            // evaluate all that is ready
            while let Some(id) = self.runnable.pop_front() {
                if self.done.contains(id) {
                    continue;
                }
                let stmt = self.slots[id].clone();
                self.executed += 1;
                match stmt.execute(self) {
                    Ok(Poll::Done) => self.complete(id),
                    Ok(Poll::Blocked(blocked)) => self.register_blocked(id, blocked),
                    Err(error) => {
                        self.diagnostics.report(error);
                        self.complete(id);
                    }
                }
            }

            // all safe statements are done; free a stalled variable
            let mut progress = self.freeze_wave();
            if !progress {
                self.migrate_zero_waiters();
                progress = self.freeze_wave();
            }
            if !progress {
                self.sweep();
            }
        }

        tracing::debug!(
            iteration,
            executed = self.executed,
            converged = self.converged,
            "scheduler loop finished"
        );
    }

    /// Statements that never completed reference values that were never
    /// produced. Reported before finalization so the messages name the
    /// variable that was still open at the end of the loop.
    pub fn report_stuck(&mut self) {
        for id in 0..self.slots.len() {
            if self.done.contains(id) {
                continue;
            }
            let stmt = self.slots[id].clone();
            let name = stmt
                .blocked_on
                .borrow()
                .as_ref()
                .map(BlockedOn::label)
                .unwrap_or_else(|| "<unexecuted statement>".to_string());
            self.diagnostics.report(CompileError::NameNotFound {
                name,
                location: stmt.location(),
            });
        }
    }

    /// Freeze every instance and check multiplicities, in entity definition
    /// order and instance creation order.
    pub fn finalize_all(&mut self) {
        for def in self.entities.clone() {
            for instance in def.instances() {
                for error in finalize(&instance, self) {
                    self.diagnostics.report(error);
                }
            }
        }
    }

    pub fn into_diagnostics(self) -> Diagnostics {
        self.diagnostics
    }

    fn complete(&mut self, id: StatementId) {
        self.done.insert(id);
        let stmt = &self.slots[id];
        stmt.release_promises();
        stmt.blocked_on.borrow_mut().take();
    }

    fn register_blocked(&mut self, id: StatementId, blocked: BlockedOn) {
        let stmt = self.slots[id].clone();
        *stmt.blocked_on.borrow_mut() = Some(blocked.clone());
        match blocked {
            BlockedOn::Variable {
                variable,
                freezable,
            } => {
                variable.await_waiter(id, self);
                if freezable && variable.mark_queued() {
                    self.waitqueue
                        .push_back(FreezeCandidate::Single(variable));
                }
            }
            BlockedOn::List(list) => {
                list.await_waiter(id, self);
                if list.mark_queued() {
                    self.waitqueue.push_back(FreezeCandidate::List(list));
                }
            }
        }
    }

    /// Walk the waitqueue once, front to back: drop settled entries, park
    /// entries without waiters on the zero-waiter queue, freeze the first
    /// entry that has waiters and no outstanding producer. Entries that
    /// still have producers stay queued in order.
    fn freeze_wave(&mut self) -> bool {
        let mut rounds = self.waitqueue.len();
        while rounds > 0 {
            rounds -= 1;
            let candidate = match self.waitqueue.pop_front() {
                Some(c) => c,
                None => break,
            };
            if candidate.settled() {
                continue;
            }
            if !candidate.has_waiters() {
                self.zerowaiters.push_back(candidate);
                continue;
            }
            if candidate.can_freeze() {
                self.freeze_candidate(candidate);
                return true;
            }
            self.waitqueue.push_back(candidate);
        }
        false
    }

    /// Move zero-waiter entries that have gained waiters back into the
    /// waitqueue, preserving arrival order.
    fn migrate_zero_waiters(&mut self) {
        let mut remaining = VecDeque::new();
        while let Some(candidate) = self.zerowaiters.pop_front() {
            if candidate.settled() {
                continue;
            }
            if candidate.has_waiters() {
                self.waitqueue.push_back(candidate);
            } else {
                remaining.push_back(candidate);
            }
        }
        self.zerowaiters = remaining;
    }

    /// Terminating pass: no candidate can freeze legally, so force the
    /// issue. Zero-waiter variables are all closed; if none existed, the
    /// oldest waitqueue entry is closed despite its outstanding producers,
    /// which is what breaks cycles of mutually waiting producers.
    fn sweep(&mut self) {
        let mut any = false;
        while let Some(candidate) = self.zerowaiters.pop_front() {
            if candidate.settled() {
                continue;
            }
            self.freeze_candidate(candidate);
            any = true;
        }
        if !any {
            while let Some(candidate) = self.waitqueue.pop_front() {
                if candidate.settled() {
                    continue;
                }
                self.freeze_candidate(candidate);
                break;
            }
        }
    }

    fn freeze_candidate(&mut self, candidate: FreezeCandidate) {
        tracing::trace!(variable = %candidate.label(), "freezing");
        match candidate {
            FreezeCandidate::Single(variable) => variable.freeze(self),
            FreezeCandidate::List(list) => {
                if let Err(error) = list.freeze(self) {
                    self.diagnostics.report(error);
                }
            }
        }
    }
}

impl WorkQueue for Engine {
    fn wake(&mut self, head: StatementId) {
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            cursor = self.slots[id].next_waiter.take();
            if !self.done.contains(id) {
                self.runnable.push_back(id);
            }
        }
    }

    fn link(&mut self, statement: StatementId, next: Option<StatementId>) -> StatementId {
        self.slots[statement].next_waiter.set(next);
        statement
    }
}
