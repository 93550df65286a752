use std::collections::VecDeque;

use crate::error::EngineError;
use crate::types::ExecutionId;

/// One atomic step of execution-tree advancement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// The execution arrived at its current activity.
    Enter { execution: ExecutionId },
    /// Run the behavior of the execution's current activity.
    ExecuteActivity { execution: ExecutionId },
    /// Leave along outgoing transition `transition` (index into `outgoing`).
    Take {
        execution: ExecutionId,
        transition: usize,
    },
    End { execution: ExecutionId },
}

impl Operation {
    pub fn execution(&self) -> ExecutionId {
        match self {
            Operation::Enter { execution }
            | Operation::ExecuteActivity { execution }
            | Operation::Take { execution, .. }
            | Operation::End { execution } => *execution,
        }
    }
}

/// FIFO queue of pending operations for one unit of work, drained by a loop.
///
/// `limit` bounds the operations dispatched over the agenda's lifetime, not
/// the queue length.
#[derive(Debug)]
pub struct Agenda {
    queue: VecDeque<Operation>,
    dispatched: usize,
    limit: usize,
}

impl Agenda {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            dispatched: 0,
            limit,
        }
    }

    pub fn push(&mut self, op: Operation) {
        self.queue.push_back(op);
    }

    /// Pop the next operation, counting it against the limit.
    pub fn next(&mut self) -> Result<Option<Operation>, EngineError> {
        let Some(op) = self.queue.pop_front() else {
            return Ok(None);
        };
        if self.dispatched >= self.limit {
            return Err(EngineError::AgendaLimitExceeded { limit: self.limit });
        }
        self.dispatched += 1;
        Ok(Some(op))
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched
    }
}
