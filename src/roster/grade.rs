//! Star count to grade conversion.
//!
//! Grades are relative to the class: `min` and `max` are the lowest and highest
//! star counts currently held by students of the same class.

/// Grade for a student with no stars.
pub const GRADE_FLOOR: i64 = 1;
/// Grade for the class's lowest star count.
pub const GRADE_PASS: i64 = 12;
/// Grade for the class's highest star count.
pub const GRADE_TOP: i64 = 20;

pub fn grade(stars: i64, max: i64, min: i64) -> i64 {
  if stars == 0 {
    return GRADE_FLOOR;
  }
  if stars == min {
    return GRADE_PASS;
  }
  if stars == max {
    return GRADE_TOP;
  }

  let span = match max - min {
    0 => 1,
    span => span,
  };
  let scaled = (stars - min) as f64 * (GRADE_TOP - GRADE_PASS) as f64 / span as f64;
  GRADE_PASS + scaled.round() as i64
}
