pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod setup;
pub mod students;
pub mod teachers;
pub mod timetable;
pub mod views;
