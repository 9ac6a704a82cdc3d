mod app;
mod cache;
mod config;
mod db;
mod logging;
mod roster;

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use std::io::Write;
use std::path::PathBuf;

use crate::roster::types::{ClassInput, StudentInput};

#[derive(Parser, Debug)]
#[command(name = "clases")]
#[command(about = "Offline-first class roster with star grading")]
#[command(version)]
struct Cli {
  /// Path to config file (default: $XDG_CONFIG_HOME/clases/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Directory for the saved roster, asset cache and log
  #[arg(long)]
  data_dir: Option<PathBuf>,

  /// Origin serving the app's assets
  #[arg(long)]
  origin: Option<String>,

  /// Log to stderr instead of the log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Manage classes
  #[command(subcommand)]
  Class(ClassCommand),
  /// Manage students
  #[command(subcommand)]
  Student(StudentCommand),
  /// Award or take back stars
  #[command(subcommand)]
  Star(StarCommand),
  /// Manage the offline asset cache
  #[command(subcommand)]
  Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
enum ClassCommand {
  /// Add a class
  Add(ClassFields),
  /// Edit a class; omitted fields keep their value
  Edit {
    id: i64,
    #[command(flatten)]
    fields: ClassFields,
  },
  /// Remove a class and its students
  Rm { id: i64 },
  /// List classes with their students and grades
  List {
    /// Print as JSON
    #[arg(long)]
    json: bool,
  },
}

#[derive(Args, Debug)]
struct ClassFields {
  #[arg(long, default_value = "")]
  subject: String,
  #[arg(long, default_value = "")]
  section: String,
  #[arg(long, default_value = "")]
  shift: String,
  #[arg(long, default_value = "")]
  institution: String,
}

impl From<ClassFields> for ClassInput {
  fn from(f: ClassFields) -> Self {
    ClassInput {
      subject: f.subject,
      section: f.section,
      shift: f.shift,
      institution: f.institution,
    }
  }
}

#[derive(Subcommand, Debug)]
enum StudentCommand {
  /// Enroll a student in a class
  Add {
    class_id: i64,
    #[command(flatten)]
    fields: StudentFields,
  },
  /// Edit a student; omitted fields keep their value
  Edit {
    id: i64,
    #[command(flatten)]
    fields: StudentFields,
  },
  /// Remove a student
  Rm { id: i64 },
}

#[derive(Args, Debug)]
struct StudentFields {
  #[arg(long, default_value = "")]
  first_name: String,
  #[arg(long, default_value = "")]
  last_name: String,
  #[arg(long, default_value = "")]
  national_id: String,
}

impl From<StudentFields> for StudentInput {
  fn from(f: StudentFields) -> Self {
    StudentInput {
      first_name: f.first_name,
      last_name: f.last_name,
      national_id: f.national_id,
    }
  }
}

#[derive(Subcommand, Debug)]
enum StarCommand {
  /// Add a star to a student
  Add { student_id: i64 },
  /// Remove a star from a student (never below zero)
  Rm { student_id: i64 },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Install and activate this build's cache generation
  Install,
  /// Show cache generations and the active version
  Status,
  /// Fetch a path through the cache as an open page would
  Fetch {
    path: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Print a content-hash version tag for an asset directory
  Tag { dir: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Cli::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(dir) = args.data_dir {
    config.data_dir = Some(dir);
  }
  if let Some(origin) = args.origin {
    config.origin = origin;
  }

  let _log_guard = logging::init(&config.data_dir()?, args.log_stderr)?;

  match args.command {
    // Hashing a directory needs neither the roster nor the cache
    Command::Cache(CacheCommand::Tag { dir }) => {
      println!("{}", app::content_tag(&config, &dir)?);
    }
    Command::Cache(CacheCommand::Install) => app::App::new(config)?.install_cache().await?,
    Command::Cache(CacheCommand::Status) => app::App::new(config)?.cache_status()?,
    Command::Cache(CacheCommand::Fetch { path, navigate }) => {
      let served = app::App::new(config)?.fetch(&path, navigate).await?;
      eprintln!(
        "{} {} from {:?}",
        served.response.status,
        served.response.url,
        served.source
      );
      std::io::stdout().write_all(&served.response.body)?;
    }
    Command::Class(cmd) => {
      let app = app::App::new(config)?;
      match cmd {
        ClassCommand::Add(fields) => app.add_class(fields.into())?,
        ClassCommand::Edit { id, fields } => app.edit_class(id, fields.into())?,
        ClassCommand::Rm { id } => app.remove_class(id)?,
        ClassCommand::List { json } => app.list(json)?,
      }
    }
    Command::Student(cmd) => {
      let app = app::App::new(config)?;
      match cmd {
        StudentCommand::Add { class_id, fields } => app.add_student(class_id, fields.into())?,
        StudentCommand::Edit { id, fields } => app.edit_student(id, fields.into())?,
        StudentCommand::Rm { id } => app.remove_student(id)?,
      }
    }
    Command::Star(cmd) => {
      let app = app::App::new(config)?;
      match cmd {
        StarCommand::Add { student_id } => app.add_star(student_id)?,
        StarCommand::Rm { student_id } => app.remove_star(student_id)?,
      }
    }
  }

  Ok(())
}
