//! Completion tokens for batches of fills.

use std::sync::{Arc, OnceLock};

use demandtex_gpu::{GpuError, QueueEvent};

use crate::error::Result;

/// Events of one batch and, once waited on, its outcome.
///
/// Shared between the [`Ticket`] handed to the caller and the loader, so
/// whichever waits first observes the result for both.
pub(crate) struct Batch {
    events: Vec<QueueEvent>,
    outcome: OnceLock<std::result::Result<(), GpuError>>,
}

impl Batch {
    fn new(events: Vec<QueueEvent>) -> Self {
        Self {
            events,
            outcome: OnceLock::new(),
        }
    }

    /// Block until the batch completed and return its outcome.
    pub(crate) fn wait(&self) -> std::result::Result<(), GpuError> {
        self.outcome
            .get_or_init(|| self.events.iter().try_for_each(QueueEvent::wait))
            .clone()
    }

    /// Outcome, if someone already waited.
    pub(crate) fn outcome(&self) -> Option<std::result::Result<(), GpuError>> {
        self.outcome.get().cloned()
    }

    fn is_done(&self) -> bool {
        self.outcome.get().is_some() || self.events.iter().all(QueueEvent::is_complete)
    }
}

/// Tracks the fills issued by one call to
/// [`DemandLoader::process_requests`](crate::DemandLoader::process_requests).
pub struct Ticket {
    batch: Arc<Batch>,
    num_tasks: usize,
}

impl Ticket {
    pub(crate) fn new(events: Vec<QueueEvent>, num_tasks: usize) -> Self {
        Self {
            batch: Arc::new(Batch::new(events)),
            num_tasks,
        }
    }

    /// A ticket with no work.
    pub fn empty() -> Self {
        Self::new(Vec::new(), 0)
    }

    pub(crate) fn batch(&self) -> Arc<Batch> {
        Arc::clone(&self.batch)
    }

    /// Number of pages serviced by the batch.
    pub const fn num_tasks_total(&self) -> usize {
        self.num_tasks
    }

    /// Check whether all work has completed, without blocking.
    pub fn is_done(&self) -> bool {
        self.batch.is_done()
    }

    /// Block until all work of the batch has completed.
    ///
    /// Later calls return the first call's result without waiting. When the
    /// batch failed, the loader forgets the pages it filled at its next
    /// launch, so they are requested again.
    pub fn wait(&self) -> Result<()> {
        self.batch.wait().map_err(Into::into)
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("num_tasks", &self.num_tasks)
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use demandtex_gpu::GpuContextBuilder;

    #[test]
    fn empty_ticket_is_done() {
        let ticket = Ticket::empty();
        assert!(ticket.is_done());
        assert_eq!(ticket.num_tasks_total(), 0);
        assert!(ticket.wait().is_ok());
    }

    #[test]
    fn wait_retires_work_once() {
        let context = GpuContextBuilder::new().build().unwrap();
        let queue = context.create_queue("fill");
        queue.submit("fail", || Err(GpuError::InvalidHandle(9)));
        let ticket = Ticket::new(vec![queue.record_event()], 1);
        assert!(!ticket.is_done());

        assert!(matches!(ticket.wait(), Err(Error::Gpu(GpuError::InvalidHandle(9)))));
        assert!(ticket.is_done());
        assert!(matches!(ticket.wait(), Err(Error::Gpu(GpuError::InvalidHandle(9)))));
        assert_eq!(ticket.num_tasks_total(), 1);
    }

    #[test]
    fn outcome_is_shared_with_the_loader() {
        let context = GpuContextBuilder::new().build().unwrap();
        let queue = context.create_queue("fill");
        queue.submit("fail", || Err(GpuError::InvalidHandle(4)));
        let ticket = Ticket::new(vec![queue.record_event()], 1);
        let batch = ticket.batch();
        assert_eq!(batch.outcome(), None);

        assert!(ticket.wait().is_err());
        assert_eq!(batch.outcome(), Some(Err(GpuError::InvalidHandle(4))));
        assert_eq!(batch.wait(), Err(GpuError::InvalidHandle(4)));
    }
}
