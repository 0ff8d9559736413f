pub mod backup;
pub mod bulletin;
pub mod classes;
pub mod core;
pub mod grades;
pub mod setup;
pub mod students;
pub mod subjects;
pub mod transfer;
