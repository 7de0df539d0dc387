//! Priority ordering for a categorized batch.
//!
//! Highest importance first, so an interrupted run loses only the
//! low-priority tail. Equal importance keeps fetch order.

use std::cmp::Reverse;

use crate::pipeline::types::CategorizedMessage;

/// Orders a categorized batch for processing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityScheduler;

impl PriorityScheduler {
    /// Sort by importance descending. `sort_by_key` is stable, so ties stay
    /// in the order they were fetched.
    pub fn schedule(&self, mut batch: Vec<CategorizedMessage>) -> Vec<CategorizedMessage> {
        batch.sort_by_key(|item| Reverse(item.result.importance));
        batch
    }
}
