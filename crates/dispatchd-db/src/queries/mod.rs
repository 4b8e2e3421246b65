pub mod checkpoints;
pub mod dependencies;
pub mod schedules;
pub mod tasks;
