use serde::Serialize;

/// A class session: one section of a subject at an institution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Class {
  pub id: i64,
  pub subject: String,
  pub section: String,
  pub shift: String,
  pub institution: String,
}

/// Editable fields of a class
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassInput {
  pub subject: String,
  pub section: String,
  pub shift: String,
  pub institution: String,
}

/// An enrolled student with their star count
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Student {
  pub id: i64,
  pub class_id: i64,
  pub first_name: String,
  pub last_name: String,
  pub national_id: String,
  pub stars: i64,
}

/// Editable fields of a student
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudentInput {
  pub first_name: String,
  pub last_name: String,
  pub national_id: String,
}

/// A student as displayed, with their class-relative grade
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GradedStudent {
  pub student: Student,
  pub grade: i64,
}

/// A class with its students, newest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassView {
  pub class: Class,
  pub students: Vec<GradedStudent>,
}
