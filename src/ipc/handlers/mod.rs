pub mod core;
pub mod publish;
pub mod results;
pub mod scores;
pub mod setup;
pub mod students;
pub mod subjects;
