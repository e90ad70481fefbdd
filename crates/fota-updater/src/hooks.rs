//! Callbacks the embedding application may install.
//!
//! Every hook is optional. Without a progress hook, progress is logged in
//! 10 % steps.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::flash::{ProgressCallback, UpdateTarget};

/// Called when a partition refuses to begin an update.
pub type TargetHook = Arc<dyn Fn(UpdateTarget) + Send + Sync>;

/// Called when validation fails, with a negative reason code.
pub type CheckFailHook = Arc<dyn Fn(UpdateTarget, i32) + Send + Sync>;

/// Called after a successful update, with whether a restart follows.
pub type FinishedHook = Arc<dyn Fn(UpdateTarget, bool) + Send + Sync>;

/// The set of installed callbacks.
#[derive(Clone, Default)]
pub struct UpdateHooks {
    progress: Option<ProgressCallback>,
    begin_fail: Option<TargetHook>,
    write_end: Option<TargetHook>,
    check_fail: Option<CheckFailHook>,
    finished: Option<FinishedHook>,
}

impl UpdateHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn on_begin_fail<F>(mut self, callback: F) -> Self
    where
        F: Fn(UpdateTarget) + Send + Sync + 'static,
    {
        self.begin_fail = Some(Arc::new(callback));
        self
    }

    pub fn on_write_end<F>(mut self, callback: F) -> Self
    where
        F: Fn(UpdateTarget) + Send + Sync + 'static,
    {
        self.write_end = Some(Arc::new(callback));
        self
    }

    pub fn on_check_fail<F>(mut self, callback: F) -> Self
    where
        F: Fn(UpdateTarget, i32) + Send + Sync + 'static,
    {
        self.check_fail = Some(Arc::new(callback));
        self
    }

    pub fn on_finished<F>(mut self, callback: F) -> Self
    where
        F: Fn(UpdateTarget, bool) + Send + Sync + 'static,
    {
        self.finished = Some(Arc::new(callback));
        self
    }

    /// The installed progress hook, or the logging default.
    pub fn progress(&self) -> ProgressCallback {
        self.progress.clone().unwrap_or_else(default_progress)
    }

    pub(crate) fn begin_failed(&self, target: UpdateTarget) {
        if let Some(hook) = &self.begin_fail {
            hook(target);
        }
    }

    pub(crate) fn write_ended(&self, target: UpdateTarget) {
        if let Some(hook) = &self.write_end {
            hook(target);
        }
    }

    pub(crate) fn check_failed(&self, target: UpdateTarget, reason: i32) {
        if let Some(hook) = &self.check_fail {
            hook(target, reason);
        }
    }

    pub(crate) fn update_finished(&self, target: UpdateTarget, restart: bool) {
        if let Some(hook) = &self.finished {
            hook(target, restart);
        }
    }
}

impl fmt::Debug for UpdateHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateHooks")
            .field("progress", &self.progress.is_some())
            .field("begin_fail", &self.begin_fail.is_some())
            .field("write_end", &self.write_end.is_some())
            .field("check_fail", &self.check_fail.is_some())
            .field("finished", &self.finished.is_some())
            .finish()
    }
}

/// Logs progress each time another 10 % of the image is written.
pub fn default_progress() -> ProgressCallback {
    let last_step = Arc::new(AtomicU64::new(u64::MAX));
    Arc::new(move |done: u64, total: u64| {
        let step = progress_step(done, total);
        if last_step.swap(step, Ordering::Relaxed) != step {
            info!(done, total, "Update progress: {}%", step * 10);
        }
    })
}

/// Completed tenths of `total`, clamped to 10.
fn progress_step(done: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (done.saturating_mul(10) / total).min(10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_progress_step() {
        assert_eq!(progress_step(0, 100), 0);
        assert_eq!(progress_step(9, 100), 0);
        assert_eq!(progress_step(10, 100), 1);
        assert_eq!(progress_step(100, 100), 10);
        assert_eq!(progress_step(150, 100), 10);
        assert_eq!(progress_step(5, 0), 0);
    }

    #[test]
    fn test_installed_hooks_fire() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (events.clone(), events.clone(), events.clone());

        let hooks = UpdateHooks::new()
            .on_begin_fail(move |t| a.lock().unwrap().push(format!("begin:{t}")))
            .on_check_fail(move |t, code| b.lock().unwrap().push(format!("check:{t}:{code}")))
            .on_finished(move |t, restart| c.lock().unwrap().push(format!("done:{t}:{restart}")));

        hooks.begin_failed(UpdateTarget::Filesystem);
        hooks.write_ended(UpdateTarget::Firmware);
        hooks.check_failed(UpdateTarget::Firmware, -2);
        hooks.update_finished(UpdateTarget::Firmware, true);

        assert_eq!(
            *events.lock().unwrap(),
            vec!["begin:filesystem", "check:firmware:-2", "done:firmware:true"]
        );
    }

    #[test]
    fn test_custom_progress_replaces_default() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hooks = UpdateHooks::new().on_progress(move |d, t| sink.lock().unwrap().push((d, t)));

        let progress = hooks.progress();
        progress(1, 2);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 2)]);
    }
}
