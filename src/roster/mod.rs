//! Class roster backed by the local durable store.
//!
//! Every mutation is followed by a snapshot save before it is reported as
//! committed. A failed save does not undo the mutation: the in-memory store stays
//! authoritative for display and the failure is handed back in [`Mutation::persisted`].

pub mod grade;
pub mod types;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{self, LoadOrigin, PersistError, PersistenceSlot, StoreHandle};

use self::types::{Class, ClassInput, ClassView, GradedStudent, Student, StudentInput};

/// Outcome of a committed mutation.
#[derive(Debug)]
pub struct Mutation<T> {
  /// Value produced by the mutation, already visible in memory
  pub value: T,
  /// Whether the snapshot reached the persistence slot
  pub persisted: Result<(), PersistError>,
}

impl<T> Mutation<T> {
  pub fn is_persisted(&self) -> bool {
    self.persisted.is_ok()
  }
}

/// Roster controller: owns the store handle and the slot it is persisted to.
pub struct Roster<S: PersistenceSlot> {
  store: StoreHandle,
  slot: S,
  key: String,
  origin: LoadOrigin,
}

impl<S: PersistenceSlot> Roster<S> {
  /// Load the roster persisted under `key`, or start empty.
  pub fn open(slot: S, key: &str) -> Result<Self> {
    let outcome = db::load(&slot, key)?;
    Ok(Self {
      store: outcome.handle,
      slot,
      key: key.to_string(),
      origin: outcome.origin,
    })
  }

  /// How the store was obtained at startup.
  pub fn load_origin(&self) -> &LoadOrigin {
    &self.origin
  }

  /// Persist the current state without mutating anything.
  pub fn save(&self) -> Result<(), PersistError> {
    db::save(&self.store, &self.slot, &self.key)
  }

  fn commit<T>(&self, value: T) -> Mutation<T> {
    Mutation {
      value,
      persisted: self.save(),
    }
  }

  // ==========================================================================
  // Classes
  // ==========================================================================

  pub fn add_class(&self, input: ClassInput) -> Result<Mutation<Class>> {
    let input = validate_class(input)?;
    let conn = self.store.conn();
    conn
      .execute(
        "INSERT INTO classes (subject, section, shift, institution) VALUES (?, ?, ?, ?)",
        params![input.subject, input.section, input.shift, input.institution],
      )
      .map_err(|e| eyre!("Failed to add class: {}", e))?;

    let class = Class {
      id: conn.last_insert_rowid(),
      subject: input.subject,
      section: input.section,
      shift: input.shift,
      institution: input.institution,
    };
    Ok(self.commit(class))
  }

  pub fn update_class(&self, id: i64, input: ClassInput) -> Result<Mutation<Class>> {
    let input = validate_class(input)?;
    let changed = self
      .store
      .conn()
      .execute(
        "UPDATE classes SET subject = ?, section = ?, shift = ?, institution = ? WHERE id = ?",
        params![input.subject, input.section, input.shift, input.institution, id],
      )
      .map_err(|e| eyre!("Failed to update class {}: {}", id, e))?;
    if changed == 0 {
      return Err(eyre!("Class {} not found", id));
    }

    let class = Class {
      id,
      subject: input.subject,
      section: input.section,
      shift: input.shift,
      institution: input.institution,
    };
    Ok(self.commit(class))
  }

  /// Remove a class together with its students.
  pub fn remove_class(&self, id: i64) -> Result<Mutation<()>> {
    let tx = self
      .store
      .conn()
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    tx.execute("DELETE FROM students WHERE class_id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete students of class {}: {}", id, e))?;
    let removed = tx
      .execute("DELETE FROM classes WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete class {}: {}", id, e))?;
    if removed == 0 {
      return Err(eyre!("Class {} not found", id));
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(self.commit(()))
  }

  pub fn class(&self, id: i64) -> Result<Option<Class>> {
    self
      .store
      .conn()
      .query_row(
        "SELECT id, subject, section, shift, institution FROM classes WHERE id = ?",
        params![id],
        class_from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read class {}: {}", id, e))
  }

  /// All classes, newest first, each with its graded students.
  pub fn classes(&self) -> Result<Vec<ClassView>> {
    let conn = self.store.conn();
    let mut stmt = conn
      .prepare("SELECT id, subject, section, shift, institution FROM classes ORDER BY id DESC")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let classes = stmt
      .query_map([], class_from_row)
      .map_err(|e| eyre!("Failed to query classes: {}", e))?
      .collect::<rusqlite::Result<Vec<Class>>>()
      .map_err(|e| eyre!("Failed to read class: {}", e))?;

    classes
      .into_iter()
      .map(|class| {
        let students = self.graded_students(class.id)?;
        Ok(ClassView { class, students })
      })
      .collect()
  }

  // ==========================================================================
  // Students
  // ==========================================================================

  pub fn add_student(&self, class_id: i64, input: StudentInput) -> Result<Mutation<Student>> {
    let input = validate_student(input)?;
    if self.class(class_id)?.is_none() {
      return Err(eyre!("Class {} not found", class_id));
    }

    let conn = self.store.conn();
    conn
      .execute(
        "INSERT INTO students (class_id, first_name, last_name, national_id) VALUES (?, ?, ?, ?)",
        params![class_id, input.first_name, input.last_name, input.national_id],
      )
      .map_err(|e| eyre!("Failed to add student: {}", e))?;

    let student = Student {
      id: conn.last_insert_rowid(),
      class_id,
      first_name: input.first_name,
      last_name: input.last_name,
      national_id: input.national_id,
      stars: 0,
    };
    Ok(self.commit(student))
  }

  pub fn update_student(&self, id: i64, input: StudentInput) -> Result<Mutation<Student>> {
    let input = validate_student(input)?;
    let changed = self
      .store
      .conn()
      .execute(
        "UPDATE students SET first_name = ?, last_name = ?, national_id = ? WHERE id = ?",
        params![input.first_name, input.last_name, input.national_id, id],
      )
      .map_err(|e| eyre!("Failed to update student {}: {}", id, e))?;
    if changed == 0 {
      return Err(eyre!("Student {} not found", id));
    }

    let student = self.require_student(id)?;
    Ok(self.commit(student))
  }

  pub fn remove_student(&self, id: i64) -> Result<Mutation<()>> {
    let removed = self
      .store
      .conn()
      .execute("DELETE FROM students WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete student {}: {}", id, e))?;
    if removed == 0 {
      return Err(eyre!("Student {} not found", id));
    }
    Ok(self.commit(()))
  }

  /// A single student with their grade recomputed against the current class range.
  pub fn student(&self, id: i64) -> Result<Option<GradedStudent>> {
    let Some(student) = self.find_student(id)? else {
      return Ok(None);
    };
    let (max, min) = self.star_range(student.class_id)?.unwrap_or((student.stars, 0));
    let grade = grade::grade(student.stars, max, min);
    Ok(Some(GradedStudent { student, grade }))
  }

  // ==========================================================================
  // Stars
  // ==========================================================================

  /// Add one star. Returns the new count.
  pub fn add_star(&self, id: i64) -> Result<Mutation<i64>> {
    let changed = self
      .store
      .conn()
      .execute("UPDATE students SET stars = stars + 1 WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to add star to student {}: {}", id, e))?;
    if changed == 0 {
      return Err(eyre!("Student {} not found", id));
    }

    let stars = self.require_student(id)?.stars;
    Ok(self.commit(stars))
  }

  /// Remove one star, never going below zero. Returns the new count.
  pub fn remove_star(&self, id: i64) -> Result<Mutation<i64>> {
    // Read the stored count rather than trusting whatever the caller last displayed
    let current = self.require_student(id)?.stars;
    let next = (current - 1).max(0);

    self
      .store
      .conn()
      .execute("UPDATE students SET stars = ? WHERE id = ?", params![next, id])
      .map_err(|e| eyre!("Failed to remove star from student {}: {}", id, e))?;

    Ok(self.commit(next))
  }

  // ==========================================================================
  // Helpers
  // ==========================================================================

  fn find_student(&self, id: i64) -> Result<Option<Student>> {
    self
      .store
      .conn()
      .query_row(
        "SELECT id, class_id, first_name, last_name, national_id, stars FROM students WHERE id = ?",
        params![id],
        student_from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read student {}: {}", id, e))
  }

  fn require_student(&self, id: i64) -> Result<Student> {
    self
      .find_student(id)?
      .ok_or_else(|| eyre!("Student {} not found", id))
  }

  /// (max, min) star counts in a class, or None when it has no students.
  fn star_range(&self, class_id: i64) -> Result<Option<(i64, i64)>> {
    let (max, min): (Option<i64>, Option<i64>) = self
      .store
      .conn()
      .query_row(
        "SELECT MAX(stars), MIN(stars) FROM students WHERE class_id = ?",
        params![class_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .map_err(|e| eyre!("Failed to read star range of class {}: {}", class_id, e))?;
    Ok(max.zip(min))
  }

  fn graded_students(&self, class_id: i64) -> Result<Vec<GradedStudent>> {
    let conn = self.store.conn();
    let mut stmt = conn
      .prepare(
        "SELECT id, class_id, first_name, last_name, national_id, stars FROM students
         WHERE class_id = ?
         ORDER BY id DESC",
      )
      .map_err(|e| eyre!("Failed to prepare student query: {}", e))?;
    let students = stmt
      .query_map(params![class_id], student_from_row)
      .map_err(|e| eyre!("Failed to query students: {}", e))?
      .collect::<rusqlite::Result<Vec<Student>>>()
      .map_err(|e| eyre!("Failed to read student: {}", e))?;

    let (max, min) = self.star_range(class_id)?.unwrap_or((0, 0));
    Ok(
      students
        .into_iter()
        .map(|student| GradedStudent {
          grade: grade::grade(student.stars, max, min),
          student,
        })
        .collect(),
    )
  }
}

fn class_from_row(row: &Row<'_>) -> rusqlite::Result<Class> {
  Ok(Class {
    id: row.get(0)?,
    subject: row.get(1)?,
    section: row.get(2)?,
    shift: row.get(3)?,
    institution: row.get(4)?,
  })
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
  Ok(Student {
    id: row.get(0)?,
    class_id: row.get(1)?,
    first_name: row.get(2)?,
    last_name: row.get(3)?,
    national_id: row.get(4)?,
    stars: row.get(5)?,
  })
}

fn validate_class(input: ClassInput) -> Result<ClassInput> {
  let input = ClassInput {
    subject: input.subject.trim().to_string(),
    section: input.section.trim().to_string(),
    shift: input.shift.trim().to_string(),
    institution: input.institution.trim().to_string(),
  };
  if input.subject.is_empty()
    || input.section.is_empty()
    || input.shift.is_empty()
    || input.institution.is_empty()
  {
    return Err(eyre!("Please fill in every class field"));
  }
  Ok(input)
}

fn validate_student(input: StudentInput) -> Result<StudentInput> {
  let input = StudentInput {
    first_name: input.first_name.trim().to_string(),
    last_name: input.last_name.trim().to_string(),
    national_id: input.national_id.trim().to_string(),
  };
  if input.first_name.is_empty() || input.last_name.is_empty() || input.national_id.is_empty() {
    return Err(eyre!("Please fill in every student field"));
  }
  Ok(input)
}

#[cfg(test)]
mod tests {
  use super::grade::{GRADE_FLOOR, GRADE_TOP};
  use super::*;
  use crate::db::{MemorySlot, DEFAULT_KEY};
  use std::rc::Rc;

  /// Lets a test keep a view of the slot the roster owns.
  struct SharedSlot(Rc<MemorySlot>);

  impl PersistenceSlot for SharedSlot {
    fn get(&self, key: &str) -> std::io::Result<Option<String>> {
      self.0.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistError> {
      self.0.set(key, value)
    }
  }

  fn math() -> ClassInput {
    ClassInput {
      subject: "Mathematics".into(),
      section: "A".into(),
      shift: "Morning".into(),
      institution: "Central University".into(),
    }
  }

  fn student(name: &str) -> StudentInput {
    StudentInput {
      first_name: name.into(),
      last_name: "Pérez".into(),
      national_id: format!("V-{}", name.len()),
    }
  }

  fn roster() -> (Roster<SharedSlot>, Rc<MemorySlot>) {
    let slot = Rc::new(MemorySlot::new());
    let roster = Roster::open(SharedSlot(Rc::clone(&slot)), DEFAULT_KEY).unwrap();
    (roster, slot)
  }

  #[test]
  fn test_single_student_grade_and_star_round_trip() {
    let (roster, _) = roster();
    let class = roster.add_class(math()).unwrap().value;
    let ana = roster.add_student(class.id, student("Ana")).unwrap().value;
    for _ in 0..3 {
      roster.add_star(ana.id).unwrap();
    }

    let graded = roster.student(ana.id).unwrap().unwrap();
    assert_eq!(graded.student.stars, 3);
    assert!(graded.grade > GRADE_FLOOR && graded.grade < GRADE_TOP);

    assert_eq!(roster.remove_star(ana.id).unwrap().value, 2);
    assert_eq!(roster.add_star(ana.id).unwrap().value, 3);
    assert_eq!(roster.student(ana.id).unwrap().unwrap().student.stars, 3);
  }

  #[test]
  fn test_remove_star_stops_at_zero() {
    let (roster, _) = roster();
    let class = roster.add_class(math()).unwrap().value;
    let ana = roster.add_student(class.id, student("Ana")).unwrap().value;

    assert_eq!(roster.remove_star(ana.id).unwrap().value, 0);
    assert_eq!(roster.student(ana.id).unwrap().unwrap().grade, GRADE_FLOOR);
  }

  #[test]
  fn test_grades_are_class_relative() {
    let (roster, _) = roster();
    let class = roster.add_class(math()).unwrap().value;
    let low = roster.add_student(class.id, student("Luis")).unwrap().value;
    let high = roster.add_student(class.id, student("Marta")).unwrap().value;
    roster.add_star(low.id).unwrap();
    for _ in 0..4 {
      roster.add_star(high.id).unwrap();
    }

    let views = roster.classes().unwrap();
    let grades: Vec<(i64, i64)> = views[0]
      .students
      .iter()
      .map(|s| (s.student.id, s.grade))
      .collect();
    // Newest first
    assert_eq!(grades, vec![(high.id, 20), (low.id, 12)]);
  }

  #[test]
  fn test_round_trip_through_slot() {
    let (roster, slot) = roster();
    let history = roster
      .add_class(ClassInput {
        subject: "History".into(),
        ..math()
      })
      .unwrap()
      .value;
    let math = roster.add_class(math()).unwrap().value;
    let ana = roster.add_student(math.id, student("Ana")).unwrap().value;
    let ben = roster.add_student(history.id, student("Ben")).unwrap().value;
    roster.add_star(ana.id).unwrap();
    roster.add_star(ana.id).unwrap();
    roster.add_star(ben.id).unwrap();
    roster
      .update_student(ben.id, StudentInput {
        first_name: "Benjamín".into(),
        ..student("Ben")
      })
      .unwrap();
    roster.remove_star(ana.id).unwrap();

    let before = roster.classes().unwrap();
    drop(roster);

    let reopened = Roster::open(SharedSlot(slot), DEFAULT_KEY).unwrap();
    assert!(matches!(reopened.load_origin(), LoadOrigin::Restored));
    assert_eq!(reopened.classes().unwrap(), before);
  }

  #[test]
  fn test_ids_keep_increasing_after_reload() {
    let (roster, slot) = roster();
    let first = roster.add_class(math()).unwrap().value;
    roster.remove_class(first.id).unwrap();
    drop(roster);

    let reopened = Roster::open(SharedSlot(slot), DEFAULT_KEY).unwrap();
    let second = reopened.add_class(math()).unwrap().value;
    assert!(second.id > first.id);
  }

  #[test]
  fn test_remove_class_removes_students() {
    let (roster, _) = roster();
    let class = roster.add_class(math()).unwrap().value;
    let ana = roster.add_student(class.id, student("Ana")).unwrap().value;

    roster.remove_class(class.id).unwrap();
    assert!(roster.classes().unwrap().is_empty());
    assert!(roster.student(ana.id).unwrap().is_none());
  }

  #[test]
  fn test_validation_and_missing_rows() {
    let (roster, _) = roster();
    assert!(roster
      .add_class(ClassInput {
        subject: "   ".into(),
        ..math()
      })
      .is_err());
    assert!(roster.add_student(42, student("Ana")).is_err());
    assert!(roster.add_star(42).is_err());
    assert!(roster.remove_star(42).is_err());
    assert!(roster.update_class(42, math()).is_err());
    assert!(roster.remove_student(42).is_err());
  }

  #[test]
  fn test_update_class_trims() {
    let (roster, _) = roster();
    let class = roster.add_class(math()).unwrap().value;
    let updated = roster
      .update_class(class.id, ClassInput {
        section: "  B ".into(),
        ..math()
      })
      .unwrap()
      .value;
    assert_eq!(updated.section, "B");
    assert_eq!(roster.class(class.id).unwrap().unwrap().section, "B");
  }

  #[test]
  fn test_failed_save_keeps_mutation_visible() {
    let (roster, slot) = roster();
    let class = roster.add_class(math()).unwrap().value;
    let ana = roster.add_student(class.id, student("Ana")).unwrap().value;

    slot.set_failing(true);
    let mutation = roster.add_star(ana.id).unwrap();
    assert!(!mutation.is_persisted());
    assert_eq!(roster.student(ana.id).unwrap().unwrap().student.stars, 1);

    // The slot still holds the last good snapshot
    let stale = Roster::open(SharedSlot(Rc::clone(&slot)), DEFAULT_KEY).unwrap();
    assert_eq!(stale.student(ana.id).unwrap().unwrap().student.stars, 0);

    slot.set_failing(false);
    assert!(roster.save().is_ok());
    let synced = Roster::open(SharedSlot(slot), DEFAULT_KEY).unwrap();
    assert_eq!(synced.student(ana.id).unwrap().unwrap().student.stars, 1);
  }

  #[test]
  fn test_quota_exceeded_is_reported() {
    let roster = Roster::open(MemorySlot::new().with_quota(16), DEFAULT_KEY).unwrap();
    let mutation = roster.add_class(math()).unwrap();
    assert!(matches!(
      mutation.persisted,
      Err(PersistError::QuotaExceeded { .. })
    ));
    assert_eq!(roster.classes().unwrap().len(), 1);
  }
}
