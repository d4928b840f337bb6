pub mod pagination;
pub mod read_tracking;
pub mod reconciliation;
