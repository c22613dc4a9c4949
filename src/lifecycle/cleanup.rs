//! Ordered release actions for one lifecycle attempt.

type ReleaseAction = Box<dyn FnOnce() + Send>;

/// Release actions registered while an attempt opens its connection and
/// channel: listener removals, deferred-notification cancellation and the
/// `on_closed` hook.
///
/// [`run`](CleanupSet::run) invokes every action exactly once, in
/// registration order, no matter how many termination paths reach it. An
/// action pushed after the set has run is invoked immediately. Dropping the
/// set runs it if nothing else has.
pub(crate) struct CleanupSet {
    actions: Vec<ReleaseAction>,
    ran: bool,
}

impl CleanupSet {
    pub(crate) fn new() -> Self {
        Self {
            actions: Vec::new(),
            ran: false,
        }
    }

    pub(crate) fn push<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // ---
        if self.ran {
            action();
            return;
        }
        self.actions.push(Box::new(action));
    }

    /// Run all registered actions. Returns `false` if the set had already run.
    pub(crate) fn run(&mut self) -> bool {
        // ---
        if self.ran {
            return false;
        }
        self.ran = true;

        for action in self.actions.drain(..) {
            action();
        }
        true
    }

    pub(crate) fn has_run(&self) -> bool {
        self.ran
    }
}

impl Drop for CleanupSet {
    fn drop(&mut self) {
        self.run();
    }
}
