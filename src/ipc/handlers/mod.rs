pub mod backup;
pub mod classes;
pub mod core;
pub mod exams;
pub mod grades;
pub mod results;
pub mod settings;
pub mod students;
pub mod subjects;
