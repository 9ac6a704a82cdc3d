use crate::cache::{
  CacheController, CacheStorage, HttpNetwork, Registration, Request, Served, SqliteCacheStorage,
  UpdateOutcome, VersionTag,
};
use crate::config::Config;
use crate::db::{FileSlot, LoadOrigin};
use crate::roster::types::{ClassInput, ClassView, StudentInput};
use crate::roster::{Mutation, Roster};
use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Offline layer wired for this process
pub struct Offline {
  storage: Arc<SqliteCacheStorage>,
  network: Arc<HttpNetwork>,
  registration: Registration<SqliteCacheStorage, HttpNetwork>,
}

/// Main application state
pub struct App {
  /// Application configuration
  config: Config,

  /// Roster backed by the durable store
  roster: Roster<FileSlot>,

  /// Offline cache, absent when registration failed
  offline: Option<Offline>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let data_dir = config.data_dir()?;

    // Nothing else starts until the store is ready
    let slot = FileSlot::new(data_dir.join("storage")).with_quota(config.storage.quota_bytes);
    let roster = Roster::open(slot, &config.storage.key)?;
    if let LoadOrigin::Recovered(reason) = roster.load_origin() {
      eprintln!(
        "warning: saved roster could not be read ({}); starting with an empty one",
        reason
      );
    }

    let offline = match bootstrap_offline(&config, &data_dir) {
      Ok(offline) => Some(offline),
      Err(e) => {
        error!(error = %e, "Offline cache unavailable, continuing online only");
        None
      }
    };

    Ok(Self {
      config,
      roster,
      offline,
    })
  }

  // ==========================================================================
  // Roster commands
  // ==========================================================================

  pub fn add_class(&self, input: ClassInput) -> Result<()> {
    let mutation = self.roster.add_class(input)?;
    println!("Added class #{}", mutation.value.id);
    report_persisted(&mutation);
    Ok(())
  }

  pub fn edit_class(&self, id: i64, input: ClassInput) -> Result<()> {
    let current = self
      .roster
      .class(id)?
      .ok_or_else(|| eyre!("Class {} not found", id))?;

    // Unset fields keep their current value
    let input = ClassInput {
      subject: or_current(input.subject, current.subject),
      section: or_current(input.section, current.section),
      shift: or_current(input.shift, current.shift),
      institution: or_current(input.institution, current.institution),
    };
    let mutation = self.roster.update_class(id, input)?;
    println!("Updated class #{}", id);
    report_persisted(&mutation);
    Ok(())
  }

  pub fn remove_class(&self, id: i64) -> Result<()> {
    let mutation = self.roster.remove_class(id)?;
    println!("Removed class #{} and its students", id);
    report_persisted(&mutation);
    Ok(())
  }

  pub fn add_student(&self, class_id: i64, input: StudentInput) -> Result<()> {
    let mutation = self.roster.add_student(class_id, input)?;
    println!("Added student #{} to class #{}", mutation.value.id, class_id);
    report_persisted(&mutation);
    Ok(())
  }

  pub fn edit_student(&self, id: i64, input: StudentInput) -> Result<()> {
    let current = self
      .roster
      .student(id)?
      .ok_or_else(|| eyre!("Student {} not found", id))?
      .student;

    let input = StudentInput {
      first_name: or_current(input.first_name, current.first_name),
      last_name: or_current(input.last_name, current.last_name),
      national_id: or_current(input.national_id, current.national_id),
    };
    let mutation = self.roster.update_student(id, input)?;
    println!("Updated student #{}", id);
    report_persisted(&mutation);
    Ok(())
  }

  pub fn remove_student(&self, id: i64) -> Result<()> {
    let mutation = self.roster.remove_student(id)?;
    println!("Removed student #{}", id);
    report_persisted(&mutation);
    Ok(())
  }

  pub fn add_star(&self, id: i64) -> Result<()> {
    let mutation = self.roster.add_star(id)?;
    report_persisted(&mutation);
    self.print_student(id)
  }

  pub fn remove_star(&self, id: i64) -> Result<()> {
    let mutation = self.roster.remove_star(id)?;
    report_persisted(&mutation);
    self.print_student(id)
  }

  fn print_student(&self, id: i64) -> Result<()> {
    let graded = self
      .roster
      .student(id)?
      .ok_or_else(|| eyre!("Student {} not found", id))?;
    println!(
      "{} {}: {}",
      graded.student.first_name,
      graded.student.last_name,
      star_line(graded.student.stars, graded.grade)
    );
    Ok(())
  }

  pub fn list(&self, json: bool) -> Result<()> {
    let classes = self.roster.classes()?;
    if json {
      let out = serde_json::to_string_pretty(&classes)
        .map_err(|e| eyre!("Failed to serialize classes: {}", e))?;
      println!("{}", out);
      return Ok(());
    }
    if classes.is_empty() {
      println!("No classes registered yet.");
      return Ok(());
    }
    for view in &classes {
      print_class(view);
    }
    Ok(())
  }

  // ==========================================================================
  // Cache commands
  // ==========================================================================

  fn offline(&mut self) -> Result<&mut Offline> {
    self
      .offline
      .as_mut()
      .ok_or_else(|| eyre!("Offline cache is unavailable; see the log for the registration error"))
  }

  fn controller(&self, offline: &Offline) -> Result<CacheController<SqliteCacheStorage, HttpNetwork>> {
    Ok(
      CacheController::new(
        self.config.version_tag(),
        self.config.manifest(),
        self.config.origin_url()?,
        Arc::clone(&offline.storage),
        Arc::clone(&offline.network),
      )
      .with_install_timeout(Duration::from_secs(self.config.cache.install_timeout_secs)),
    )
  }

  /// Install this build's cache generation and activate it.
  pub async fn install_cache(&mut self) -> Result<()> {
    let controller = {
      let offline = self
        .offline
        .as_ref()
        .ok_or_else(|| eyre!("Offline cache is unavailable; see the log for the registration error"))?;
      self.controller(offline)?
    };
    let version = controller.version().clone();

    match self.offline()?.registration.update(controller).await {
      Ok(UpdateOutcome::Activated { purged }) => {
        println!("Activated {}", version);
        for name in purged {
          println!("  purged {}", name);
        }
        Ok(())
      }
      Ok(UpdateOutcome::Waiting) => {
        println!("Installed {}, waiting for open pages to close", version);
        Ok(())
      }
      Err(e) => Err(eyre!("Install of {} failed: {}", version, e)),
    }
  }

  /// Fetch one path as an open page would, through the active generation if any.
  pub async fn fetch(&mut self, path: &str, navigate: bool) -> Result<Served> {
    let url = self
      .config
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))?;
    let request = if navigate {
      Request::navigate(url)
    } else {
      Request::resource(url)
    };

    let offline = self.offline()?;
    let page = offline.registration.open_client();
    let served = offline.registration.fetch(page, &request).await;
    offline.registration.close_client(page).await?;

    served.map_err(|e| eyre!("{}", e))
  }

  pub fn cache_status(&mut self) -> Result<()> {
    let current = self.config.version_tag();
    let offline = self.offline()?;

    println!("Build version: {}", current);
    match offline.registration.active_version() {
      Some(active) => println!("Active:        {}", active),
      None => println!("Active:        none (run `clases cache install`)"),
    }
    if let Some(waiting) = offline.registration.waiting_version() {
      println!("Waiting:       {}", waiting);
    }
    println!("Script:        {}", offline.registration.script());
    println!("Scope:         {}", offline.registration.scope());

    let names = offline.storage.keys()?;
    if names.is_empty() {
      println!("No caches.");
    }
    for name in names {
      let count = offline.storage.entry_count(&name)?;
      println!("  {} ({} entries)", name, count);
    }
    Ok(())
  }
}

/// Open cache storage, register the worker and resume this build's generation if installed.
fn bootstrap_offline(config: &Config, data_dir: &Path) -> Result<Offline> {
  let origin = config.origin_url()?;
  let network = Arc::new(HttpNetwork::new(origin.clone())?);
  let storage = Arc::new(SqliteCacheStorage::open(&data_dir.join("cache.db"))?);

  let mut registration = Registration::register(
    &origin,
    &config.worker_script(),
    &config.worker_scope(),
    Arc::clone(&network),
  )
  .map_err(|e| eyre!("Worker registration failed: {}", e))?
  .with_skip_waiting(config.cache.skip_waiting);

  let controller = CacheController::new(
    config.version_tag(),
    config.manifest(),
    origin,
    Arc::clone(&storage),
    Arc::clone(&network),
  );
  if registration.resume(controller).map_err(|e| eyre!("{}", e))? {
    info!(
      active = ?registration.active_version().map(|v| v.as_str()),
      build = %config.version_tag(),
      "Offline cache ready"
    );
  }

  Ok(Offline {
    storage,
    network,
    registration,
  })
}

/// Derive a content-hash version tag for an asset directory.
pub fn content_tag(config: &Config, dir: &Path) -> Result<VersionTag> {
  VersionTag::from_dir(&config.cache.prefix, dir)
}

fn report_persisted<T>(mutation: &Mutation<T>) {
  if let Err(e) = &mutation.persisted {
    eprintln!("warning: change applied but not saved: {}", e);
  }
}

fn or_current(value: String, current: String) -> String {
  if value.trim().is_empty() {
    current
  } else {
    value
  }
}

fn star_line(stars: i64, grade: i64) -> String {
  let icons = "⭐".repeat(stars.max(0) as usize);
  format!("{} ({}) · Grade {}", icons, stars, grade)
}

fn print_class(view: &ClassView) {
  let class = &view.class;
  println!(
    "#{} {} · {} · Section {} · {}",
    class.id, class.subject, class.institution, class.section, class.shift
  );
  if view.students.is_empty() {
    println!("    No students in this class yet.");
  }
  for graded in &view.students {
    let student = &graded.student;
    println!(
      "    #{} {} {} ({}) {}",
      student.id,
      student.first_name,
      student.last_name,
      student.national_id,
      star_line(student.stars, graded.grade)
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_star_line() {
    assert_eq!(star_line(0, 1), " (0) · Grade 1");
    assert_eq!(star_line(2, 20), "⭐⭐ (2) · Grade 20");
  }

  #[test]
  fn test_or_current() {
    assert_eq!(or_current("".into(), "kept".into()), "kept");
    assert_eq!(or_current("new".into(), "kept".into()), "new");
  }

  #[test]
  fn test_app_starts_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
      data_dir: Some(dir.path().to_path_buf()),
      ..Config::default()
    };

    let app = App::new(config.clone()).unwrap();
    app
      .add_class(ClassInput {
        subject: "Physics".into(),
        section: "C".into(),
        shift: "Night".into(),
        institution: "Tech".into(),
      })
      .unwrap();
    drop(app);

    let reopened = App::new(config).unwrap();
    assert!(matches!(reopened.roster.load_origin(), LoadOrigin::Restored));
    assert_eq!(reopened.roster.classes().unwrap().len(), 1);
  }

  #[test]
  fn test_bad_worker_scope_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config {
      data_dir: Some(dir.path().to_path_buf()),
      ..Config::default()
    };
    config.worker.script = Some("/clases/js/sw.js".into());

    let mut app = App::new(config).unwrap();
    assert!(app.offline.is_none());
    assert!(app.cache_status().is_err());
    // Roster still works
    app.list(false).unwrap();
  }
}
