pub mod job;
pub mod node;
