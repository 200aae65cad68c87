pub mod checkpoint;
pub mod message;
pub mod tool;
