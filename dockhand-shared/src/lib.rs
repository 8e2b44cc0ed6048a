pub mod appspec;
pub mod deployment;
pub mod instruction;
pub mod lifecycle;
