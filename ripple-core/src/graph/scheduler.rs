//! Batch Scheduler
//!
//! The scheduler coalesces the consequences of synchronous mutations into a
//! single settle pass.
//!
//! # Algorithm
//!
//! 1. `start` / `end` nest: only the outermost `end` reports that a flush is due
//! 2. While a batch is open, dirty contexts push their job, de-duplicated by
//!    context, and container listeners accumulate the changes they missed
//! 3. The flush drains in priority order:
//!    - pure jobs (watchers) first, including any they enqueue
//!    - then container listeners, each called once with all its changes
//!    - then render jobs, in the order they were queued
//!
//! By the time a render job runs, every derived value it might read has
//! settled.

use std::rc::Rc;

use indexmap::IndexMap;

use super::{ContextId, ContextKind, ObserverId};
use crate::reactive::PropChange;

/// A queued context job.
#[derive(Clone)]
pub(crate) struct Job {
    pub context: ContextId,
    pub run: Rc<dyn Fn()>,
}

/// Pending notification for one container listener.
pub(crate) struct ListenerNotice {
    pub listener: Rc<dyn Fn(&[PropChange])>,
    pub source: ObserverId,
    pub changes: Vec<PropChange>,
}

/// Next unit of work handed out by [`BatchQueue::next`].
pub(crate) enum Pending {
    Job(Job),
    Listener(ListenerNotice),
}

/// The batch buffer.
#[derive(Default)]
pub(crate) struct BatchQueue {
    depth: usize,
    flushing: bool,
    pure: IndexMap<ContextId, Job>,
    render: IndexMap<ContextId, Job>,
    listeners: Vec<ListenerNotice>,
}

impl BatchQueue {
    pub fn start(&mut self) {
        self.depth += 1;
    }

    /// Close one level. Returns `true` when the outermost batch closed and
    /// no flush is already draining the queue.
    pub fn end(&mut self) -> bool {
        self.depth = self.depth.saturating_sub(1);
        self.depth == 0 && !self.flushing && !self.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn set_flushing(&mut self, flushing: bool) {
        self.flushing = flushing;
    }

    /// Queue a job. A context already queued in this batch is not queued again.
    pub fn push_job(&mut self, kind: ContextKind, job: Job) -> bool {
        let lane = match kind {
            ContextKind::Render => &mut self.render,
            ContextKind::Computed | ContextKind::Watch => &mut self.pure,
        };
        if lane.contains_key(&job.context) {
            return false;
        }
        lane.insert(job.context, job);
        true
    }

    /// Queue a change for a listener, merging with its pending notice.
    pub fn push_listener(
        &mut self,
        listener: &Rc<dyn Fn(&[PropChange])>,
        source: ObserverId,
        change: PropChange,
    ) {
        if let Some(notice) = self
            .listeners
            .iter_mut()
            .find(|notice| Rc::ptr_eq(&notice.listener, listener))
        {
            notice.changes.push(change);
            return;
        }
        self.listeners.push(ListenerNotice {
            listener: Rc::clone(listener),
            source,
            changes: vec![change],
        });
    }

    /// Drop a context's pending job.
    pub fn cancel(&mut self, context: ContextId) {
        self.pure.shift_remove(&context);
        self.render.shift_remove(&context);
    }

    pub fn next(&mut self) -> Option<Pending> {
        if let Some((_, job)) = self.pure.shift_remove_index(0) {
            return Some(Pending::Job(job));
        }
        if !self.listeners.is_empty() {
            return Some(Pending::Listener(self.listeners.remove(0)));
        }
        self.render
            .shift_remove_index(0)
            .map(|(_, job)| Pending::Job(job))
    }

    pub fn is_empty(&self) -> bool {
        self.pure.is_empty() && self.render.is_empty() && self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pure.len() + self.render.len() + self.listeners.len()
    }

    /// Drop everything queued. Returns the contexts whose jobs were dropped.
    pub fn clear(&mut self) -> Vec<ContextId> {
        self.listeners.clear();
        self.pure
            .drain(..)
            .chain(self.render.drain(..))
            .map(|(context, _)| context)
            .collect()
    }
}
