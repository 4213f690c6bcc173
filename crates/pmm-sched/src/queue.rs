//! Serial dispatcher for deferred work.
//!
//! Callbacks pushed from any thread run serialized on the worker, at
//! most one drain per second. Expensive stats work can accumulate
//! here without ever blocking a trading cycle.

use crate::scheduler::Scheduler;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

type Action = Box<dyn FnOnce() + Send>;

struct Inner {
    dsp: Mutex<VecDeque<Action>>,
    sch: Scheduler,
}

#[derive(Clone)]
pub struct ActionQueue {
    inner: Arc<Inner>,
}

impl ActionQueue {
    pub fn new(sch: Scheduler) -> Self {
        Self {
            inner: Arc::new(Inner {
                dsp: Mutex::new(VecDeque::new()),
                sch,
            }),
        }
    }

    /// Append a callback. Arms the 1-second timer when the queue was
    /// empty; otherwise the already-armed drain will pick it up.
    pub fn push(&self, action: impl FnOnce() + Send + 'static) {
        let was_empty = {
            let mut dsp = self.inner.dsp.lock();
            let was_empty = dsp.is_empty();
            dsp.push_back(Box::new(action));
            was_empty
        };
        if was_empty {
            self.goon();
        }
    }

    fn goon(&self) {
        let me = self.clone();
        self.inner
            .sch
            .after(Duration::from_secs(1), move || me.exec());
    }

    fn exec(&self) {
        let batch = std::mem::take(&mut *self.inner.dsp.lock());
        if batch.is_empty() {
            return;
        }
        for action in batch {
            action();
        }
        if !self.inner.dsp.lock().is_empty() {
            self.goon();
        }
    }
}
