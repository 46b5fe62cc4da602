//! In-order command queues.
//!
//! Work submitted to a queue is retired strictly in submission order when the
//! queue is synchronized or when an event recorded on it is waited on. Errors
//! raised by a command are sticky: the first one is returned by the next
//! synchronization.
//!
//! Retiring a command issues its device work. A command only counts as
//! retired once the device timeline has passed everything it issued.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::DeviceTimeline;
use crate::context::ContextId;
use crate::error::{GpuError, Result};
use crate::sync::QueueEvent;

type Command = Box<dyn FnOnce() -> Result<()> + Send>;

struct PendingCommand {
    seq: u64,
    label: &'static str,
    command: Command,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingCommand>,
    submitted: u64,
    retired: u64,
    error: Option<GpuError>,
}

pub(crate) struct QueueInner {
    id: u64,
    name: String,
    context: ContextId,
    timeline: Arc<dyn DeviceTimeline>,
    state: Mutex<QueueState>,
    // Serializes retirement so commands never run out of order.
    retire: Mutex<()>,
}

impl QueueInner {
    /// Retire every command with a sequence number up to `target`.
    pub(crate) fn retire_through(&self, target: u64) -> Result<()> {
        let _retiring = self.retire.lock();

        let mut last = None;
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.pending.front() {
                    Some(front) if front.seq <= target => state.pending.pop_front(),
                    _ => None,
                }
            };
            let Some(pending) = next else {
                break;
            };

            if let Err(err) = (pending.command)() {
                tracing::warn!(queue = %self.name, command = pending.label, "Command failed: {err}");
                self.state.lock().error.get_or_insert(err);
            }
            last = Some(pending.seq);
        }

        if let Some(seq) = last {
            let device = self.timeline.wait(self.timeline.submitted());
            let mut state = self.state.lock();
            state.retired = seq;
            if let Err(err) = device {
                tracing::warn!(queue = %self.name, "Device wait failed: {err}");
                state.error.get_or_insert(err);
            }
        }

        self.state.lock().error.take().map_or(Ok(()), Err)
    }

    pub(crate) fn retired(&self) -> u64 {
        self.state.lock().retired
    }
}

/// An in-order queue of device commands.
///
/// Cloning a queue yields another handle to the same queue.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl CommandQueue {
    pub(crate) fn new(context: ContextId, id: u64, name: String, timeline: Arc<dyn DeviceTimeline>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                id,
                name,
                context,
                timeline,
                state: Mutex::new(QueueState::default()),
                retire: Mutex::new(()),
            }),
        }
    }

    /// Get the queue id (unique within its context).
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Get the queue name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the context the queue belongs to.
    pub fn context_id(&self) -> ContextId {
        self.inner.context
    }

    /// Submit a command. Returns its sequence number.
    pub fn submit<F>(&self, label: &'static str, command: F) -> u64
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        state.submitted += 1;
        let seq = state.submitted;
        state.pending.push_back(PendingCommand {
            seq,
            label,
            command: Box::new(command),
        });
        tracing::trace!(queue = %self.inner.name, seq, label, "Submitted command");
        seq
    }

    /// Record an event that completes once all work submitted so far has retired.
    pub fn record_event(&self) -> QueueEvent {
        let seq = self.inner.state.lock().submitted;
        QueueEvent::new(Arc::clone(&self.inner), seq)
    }

    /// Retire all submitted work.
    pub fn synchronize(&self) -> Result<()> {
        let target = self.inner.state.lock().submitted;
        self.inner.retire_through(target)
    }

    /// Number of commands not yet retired.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Check whether two handles refer to the same queue.
    pub fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GpuContextBuilder;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[test]
    fn commands_retire_in_order() {
        let context = GpuContextBuilder::new().build().unwrap();
        let queue = context.create_queue("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let log = Arc::clone(&log);
            queue.submit("push", move || {
                log.lock().push(i);
                Ok(())
            });
        }

        assert!(log.lock().is_empty());
        assert_eq!(queue.pending_count(), 4);

        queue.synchronize().unwrap();
        assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn event_retires_only_prior_work() {
        let context = GpuContextBuilder::new().build().unwrap();
        let queue = context.create_queue("test");
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        queue.submit("first", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let event = queue.record_event();
        let c = Arc::clone(&counter);
        queue.submit("second", move || {
            c.fetch_add(10, Ordering::SeqCst);
            Ok(())
        });

        assert!(!event.is_complete());
        event.wait().unwrap();
        assert!(event.is_complete());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn errors_are_reported_once() {
        let context = GpuContextBuilder::new().build().unwrap();
        let queue = context.create_queue("test");
        queue.submit("fail", || Err(GpuError::InvalidHandle(7)));
        queue.submit("ok", || Ok(()));

        assert_eq!(queue.synchronize(), Err(GpuError::InvalidHandle(7)));
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.synchronize().is_ok());
    }

    /// Device work finishes only when waited on; waits past `fail_at` fail.
    #[derive(Default)]
    struct ManualTimeline {
        submitted: AtomicU64,
        completed: AtomicU64,
        fail_at: Option<u64>,
    }

    impl DeviceTimeline for ManualTimeline {
        fn submitted(&self) -> u64 {
            self.submitted.load(Ordering::SeqCst)
        }

        fn completed(&self) -> Result<u64> {
            Ok(self.completed.load(Ordering::SeqCst))
        }

        fn wait(&self, value: u64) -> Result<()> {
            if self.fail_at.is_some_and(|fail_at| value >= fail_at) {
                return Err(GpuError::UnsupportedFeature("device lost".into()));
            }
            self.completed.fetch_max(value, Ordering::SeqCst);
            Ok(())
        }
    }

    fn queue_on(timeline: &Arc<ManualTimeline>) -> CommandQueue {
        let context = GpuContextBuilder::new().build().unwrap();
        CommandQueue::new(context.id(), 1, "timeline".into(), Arc::clone(timeline) as Arc<dyn DeviceTimeline>)
    }

    #[test]
    fn retirement_waits_for_device_work() {
        let timeline = Arc::new(ManualTimeline::default());
        let queue = queue_on(&timeline);

        let t = Arc::clone(&timeline);
        queue.submit("issue", move || {
            t.submitted.fetch_add(3, Ordering::SeqCst);
            Ok(())
        });
        let event = queue.record_event();
        assert_eq!(timeline.completed().unwrap(), 0);

        event.wait().unwrap();
        assert!(event.is_complete());
        assert_eq!(timeline.completed().unwrap(), 3);
    }

    #[test]
    fn device_failure_is_sticky() {
        let timeline = Arc::new(ManualTimeline {
            fail_at: Some(1),
            ..ManualTimeline::default()
        });
        let queue = queue_on(&timeline);

        let t = Arc::clone(&timeline);
        queue.submit("issue", move || {
            t.submitted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(queue.synchronize(), Err(GpuError::UnsupportedFeature(_))));
        assert!(queue.record_event().is_complete());
    }
}
