pub mod auth;
pub mod classes;
pub mod core;
pub mod dashboard;
pub mod grades;
pub mod parents;
pub mod reports;
pub mod setup;
pub mod students;
pub mod subjects;
pub mod teachers;
pub mod years;
