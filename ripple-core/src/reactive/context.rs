//! Reactive Context
//!
//! A context is one re-runnable computation: a computed, a watcher or a
//! render binding. While it runs it sits on top of its runtime's context
//! stack, and every tracked read records the context as a reader.
//!
//! # Implementation
//!
//! Entering a context bumps its track id and drops every subscription from
//! its previous run, so the dependency set always reflects exactly the reads
//! of the latest run. Leaving restores whatever context was active before,
//! which makes nesting (a watcher reading a computed reading a cell) work
//! without any bookkeeping by the caller.

use std::fmt;
use std::rc::Rc;

use super::runtime::Runtime;
use crate::graph::{ContextId, ContextKind, DirtyLevel};

/// Handle to a context in a runtime's graph.
///
/// Handles are cheap to clone and do not keep the context alive: a context
/// lives until it is stopped or its owner (a [`crate::Computed`], say) is
/// dropped.
#[derive(Clone)]
pub struct Context {
    rt: Runtime,
    id: ContextId,
}

impl Context {
    /// Create a bare context of the given kind.
    pub fn new(rt: &Runtime, kind: ContextKind) -> Self {
        Self {
            rt: rt.clone(),
            id: rt.create_context(kind),
        }
    }

    pub(crate) fn from_id(rt: &Runtime, id: ContextId) -> Self {
        Self { rt: rt.clone(), id }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// The context's kind, `None` once stopped.
    pub fn kind(&self) -> Option<ContextKind> {
        self.rt.with_context(self.id, |node| node.kind)
    }

    /// The current dirty level, `None` once stopped.
    pub fn dirty_level(&self) -> Option<DirtyLevel> {
        self.rt.dirty_level(self.id)
    }

    /// Number of runs started so far.
    pub fn track_id(&self) -> u64 {
        self.rt.with_context(self.id, |node| node.track_id).unwrap_or(0)
    }

    /// Number of observers read during the latest run.
    pub fn dependency_count(&self) -> usize {
        self.rt.with_context(self.id, |node| node.deps.len()).unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.rt
            .with_context(self.id, |node| node.running > 0)
            .unwrap_or(false)
    }

    pub fn is_stopped(&self) -> bool {
        self.rt.dirty_level(self.id).is_none()
    }

    /// Whether the context must re-run.
    ///
    /// A "maybe dirty" context is resolved here by refreshing the computeds
    /// it read, in order, until one of them turns out to have changed.
    pub fn is_dirty(&self) -> bool {
        self.rt.is_dirty(self.id)
    }

    /// Let the context's job be queued again while it is running.
    pub fn set_allow_recurse(&self, allow: bool) {
        self.rt.with_context(self.id, |node| node.allow_recurse = allow);
    }

    /// Make this context active until the guard drops.
    ///
    /// Entering starts a new run: previous subscriptions are dropped and
    /// the level resets to clean.
    pub fn enter(&self) -> ContextGuard {
        let tracked = self.rt.start(self.id);
        ContextGuard {
            rt: self.rt.clone(),
            id: self.id,
            tracked,
        }
    }

    /// Run `f` as this context.
    pub fn run_with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.rt.run_context(self.id, f)
    }

    /// Re-run the body installed by [`Context::bind_to`].
    ///
    /// Does nothing for contexts without a body.
    pub fn run(&self) {
        let body = self.rt.with_context(self.id, |node| node.body.clone()).flatten();
        if let Some(body) = body {
            self.rt.run_context(self.id, || body());
        }
    }

    /// Bind a render function to this context.
    ///
    /// `render` runs immediately, tracked. Afterwards, whenever something it
    /// read changes, `on_dirty` is called from the render lane of the batch
    /// flush; re-rendering is up to the caller, through [`Context::run`].
    pub fn bind_to(
        &self,
        render: impl Fn() + 'static,
        on_dirty: impl Fn() + 'static,
    ) -> &Self {
        let job: Rc<dyn Fn()> = {
            let rt = self.rt.downgrade();
            let id = self.id;
            Rc::new(move || {
                if let Some(rt) = rt.upgrade() {
                    if rt.is_dirty(id) {
                        on_dirty();
                    }
                }
            })
        };
        let render: Rc<dyn Fn()> = Rc::new(render);
        self.rt.with_context(self.id, |node| {
            node.body = Some(render);
            node.job = Some(job);
        });
        self.run();
        self
    }

    /// Stop the context: cancel any queued job, drop every subscription and
    /// free its slot. Stopping twice is a no-op.
    pub fn stop(&self) {
        self.rt.stop_context(self.id);
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.rt.ptr_eq(&other.rt)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("dirty", &self.dirty_level())
            .finish()
    }
}

/// Guard returned by [`Context::enter`]. Ends the run when dropped.
///
/// This keeps the context stack balanced even if the computation panics.
#[must_use = "the context is exited as soon as the guard drops"]
pub struct ContextGuard {
    rt: Runtime,
    id: ContextId,
    tracked: bool,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.rt.end(self.id, self.tracked);
    }
}

impl Runtime {
    /// Create a render binding. See [`Context::bind_to`].
    pub fn bind_render(
        &self,
        render: impl Fn() + 'static,
        on_dirty: impl Fn() + 'static,
    ) -> Context {
        let context = Context::new(self, ContextKind::Render);
        context.bind_to(render, on_dirty);
        context
    }
}
