//! Scheduling contexts: batches of submissions that are queued together or
//! not at all.

use crate::error::SchedError;
use crate::packet::Packet;

#[derive(Debug, Default)]
pub struct SchedContext {
    open: bool,
    /// Opened on behalf of a caller that did not open one.
    implicit: bool,
    staged: Vec<Packet>,
}

impl SchedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&mut self) -> Result<(), SchedError> {
        if self.open {
            return Err(SchedError::NestedContext);
        }
        self.open = true;
        self.implicit = false;
        Ok(())
    }

    pub(crate) fn enter_implicit(&mut self) -> bool {
        if self.open {
            return false;
        }
        self.open = true;
        self.implicit = true;
        true
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_implicit(&self) -> bool {
        self.open && self.implicit
    }

    pub fn stage(&mut self, packets: impl IntoIterator<Item = Packet>) {
        self.staged.extend(packets);
    }

    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    /// Closes the context and hands back the staged packets for queueing.
    pub fn leave(&mut self) -> Result<Vec<Packet>, SchedError> {
        if !self.open {
            return Err(SchedError::NoContext);
        }
        self.open = false;
        self.implicit = false;
        Ok(std::mem::take(&mut self.staged))
    }

    /// Closes the context and drops everything staged in it. Returns how many
    /// packets were discarded.
    pub fn fail(&mut self) -> Result<usize, SchedError> {
        if !self.open {
            return Err(SchedError::NoContext);
        }
        self.open = false;
        self.implicit = false;
        let discarded = self.staged.len();
        self.staged.clear();
        Ok(discarded)
    }
}
