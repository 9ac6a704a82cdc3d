//! Relational schema for the roster store.
//!
//! Every statement is create-if-absent so the batch can run against a store
//! restored from an older snapshot without touching existing rows.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS classes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject TEXT NOT NULL,
    section TEXT NOT NULL,
    shift TEXT NOT NULL,
    institution TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS students (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    class_id INTEGER NOT NULL,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    national_id TEXT NOT NULL,
    stars INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (class_id) REFERENCES classes(id)
);

CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id);
"#;
