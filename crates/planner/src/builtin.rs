//! Built-in planning strategies.

use async_trait::async_trait;

use crate::Planner;

/// Strict submission order: oldest job first.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoPlanner;

#[async_trait]
impl Planner for FifoPlanner {
    fn order_by(&self) -> &[&str] {
        &["id"]
    }
}

/// Priority order: lower value first, submission order within a level.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityPlanner;

#[async_trait]
impl Planner for PriorityPlanner {
    fn order_by(&self) -> &[&str] {
        &["priority", "id"]
    }
}
