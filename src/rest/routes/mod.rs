pub mod approvals;
pub mod health;
pub mod sessions;
