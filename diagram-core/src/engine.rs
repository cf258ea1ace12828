//! Diagramming engine seam.
//!
//! The sync core never touches rendering; it talks to the engine through
//! [`DiagramEngine`]. [`MemoryEngine`] is a headless implementation with the
//! same observable behavior (transactions, undo/redo replay, event
//! suppression, render lag) used by tests and non-GUI clients.

use crate::delta::{Delta, DeltaError};
use crate::model::{Document, ModelError};

/// Raised by the engine while a transaction progresses.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEvent {
    pub name: String,
    /// Only the last event of a transaction carries `true`.
    pub is_transaction_finished: bool,
    /// Raised while replaying undo/redo history.
    pub is_undo_redo: bool,
    /// Change tracking captured for the transaction, when the engine has it.
    pub delta: Option<Delta>,
}

impl TransactionEvent {
    pub fn finished(name: impl Into<String>, delta: Option<Delta>) -> Self {
        Self {
            name: name.into(),
            is_transaction_finished: true,
            is_undo_redo: false,
            delta,
        }
    }
}

/// Operations the sync core needs from a diagramming engine session.
pub trait DiagramEngine {
    /// Serialize the live model.
    fn to_snapshot(&self) -> Result<String, ModelError>;

    /// Replace the whole model. Does not raise transaction events.
    fn from_snapshot(&mut self, snapshot: &str) -> Result<(), ModelError>;

    /// Incremental serialization of one transaction.
    fn to_delta(&self, event: &TransactionEvent) -> Option<Delta>;

    /// Apply an incremental change as a single transaction.
    fn apply_delta(&mut self, delta: &Delta) -> Result<(), DeltaError>;

    fn skips_events(&self) -> bool;

    fn set_skips_events(&mut self, skip: bool);

    fn is_undoing_redoing(&self) -> bool;

    /// Returns the previous setting.
    fn set_animation_enabled(&mut self, enabled: bool) -> bool;

    /// Parts currently shown on the canvas (may lag the model).
    fn visible_part_count(&self) -> usize;

    fn zoom_to_fit(&mut self);

    /// Take the events raised since the last call, in order.
    fn drain_events(&mut self) -> Vec<TransactionEvent>;
}

#[derive(Debug, Clone)]
struct HistoryStep {
    name: String,
    before: Document,
    after: Document,
}

/// Headless engine holding the model in memory.
#[derive(Debug)]
pub struct MemoryEngine {
    document: Document,
    rendered_parts: usize,
    undo_stack: Vec<HistoryStep>,
    redo_stack: Vec<HistoryStep>,
    undoing_redoing: bool,
    skips_events: bool,
    animation_enabled: bool,
    fit_count: usize,
    events: Vec<TransactionEvent>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_document(Document::default())
    }

    pub fn with_document(document: Document) -> Self {
        let rendered_parts = document.node_count() + document.link_count();
        Self {
            document,
            rendered_parts,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            undoing_redoing: false,
            skips_events: false,
            animation_enabled: true,
            fit_count: 0,
            events: Vec::new(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    fn render(&mut self) {
        self.rendered_parts = self.document.node_count() + self.document.link_count();
    }

    fn raise(&mut self, event: TransactionEvent) {
        if !self.skips_events {
            self.events.push(event);
        }
    }

    /// Run `edit` as one undoable transaction.
    ///
    /// Link keys are re-derived when the edit returns. Raises an intermediate event when the transaction starts and a
    /// finished event carrying the delta when it commits.
    pub fn transact<R>(&mut self, name: &str, edit: impl FnOnce(&mut Document) -> R) -> R {
        self.raise(TransactionEvent {
            name: name.to_string(),
            is_transaction_finished: false,
            is_undo_redo: false,
            delta: None,
        });

        let before = self.document.clone();
        let result = edit(&mut self.document);
        self.document.rekey_links();
        self.render();

        let delta = match Delta::between(&before, &self.document, name) {
            Ok(delta) => Some(delta),
            Err(e) => {
                log::warn!("Change tracking failed for transaction {name:?}: {e}");
                None
            }
        };
        if before != self.document {
            self.undo_stack.push(HistoryStep {
                name: name.to_string(),
                before,
                after: self.document.clone(),
            });
            self.redo_stack.clear();
        }
        self.raise(TransactionEvent::finished(name, delta));
        result
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo(&mut self) -> bool {
        let Some(step) = self.undo_stack.pop() else {
            return false;
        };
        self.replay(&step.after, step.before.clone(), &step.name);
        self.redo_stack.push(step);
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(step) = self.redo_stack.pop() else {
            return false;
        };
        self.replay(&step.before, step.after.clone(), &step.name);
        self.undo_stack.push(step);
        true
    }

    fn replay(&mut self, from: &Document, to: Document, name: &str) {
        self.undoing_redoing = true;
        let delta = Delta::between(from, &to, name).ok();
        self.document = to;
        self.render();
        self.raise(TransactionEvent {
            name: name.to_string(),
            is_transaction_finished: true,
            is_undo_redo: true,
            delta,
        });
        self.undoing_redoing = false;
    }

    /// Swap in an empty model without re-rendering, the way an engine does
    /// for a moment while a model is being replaced.
    pub fn detach_model(&mut self) {
        self.document = Document::default();
        self.raise(TransactionEvent::finished("ModelReplaced", None));
    }

    pub fn animation_enabled(&self) -> bool {
        self.animation_enabled
    }

    /// How many times the view was fitted to content.
    pub fn fit_count(&self) -> usize {
        self.fit_count
    }
}

impl DiagramEngine for MemoryEngine {
    fn to_snapshot(&self) -> Result<String, ModelError> {
        self.document.to_json()
    }

    fn from_snapshot(&mut self, snapshot: &str) -> Result<(), ModelError> {
        self.document = Document::parse(snapshot)?;
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.render();
        Ok(())
    }

    fn to_delta(&self, event: &TransactionEvent) -> Option<Delta> {
        event.delta.clone()
    }

    fn apply_delta(&mut self, delta: &Delta) -> Result<(), DeltaError> {
        delta.apply_to(&mut self.document)?;
        self.render();
        self.raise(TransactionEvent::finished(
            delta.transaction.clone(),
            Some(delta.clone()),
        ));
        Ok(())
    }

    fn skips_events(&self) -> bool {
        self.skips_events
    }

    fn set_skips_events(&mut self, skip: bool) {
        self.skips_events = skip;
    }

    fn is_undoing_redoing(&self) -> bool {
        self.undoing_redoing
    }

    fn set_animation_enabled(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.animation_enabled, enabled)
    }

    fn visible_part_count(&self) -> usize {
        self.rendered_parts
    }

    fn zoom_to_fit(&mut self) {
        self.fit_count += 1;
    }

    fn drain_events(&mut self) -> Vec<TransactionEvent> {
        std::mem::take(&mut self.events)
    }
}
