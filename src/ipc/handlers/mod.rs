pub mod core;
pub mod grades;
pub mod import;
pub mod mapping;
pub mod setup;
pub mod students;
