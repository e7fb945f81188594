use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::ImagePayload;
use rollcall_engine::{AttendanceMark, AttendanceService, Config};
use rollcall_store::{AttendanceStatus, NewClass, NewPerson};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance")]
struct Cli {
    /// TOML configuration file; built-in defaults otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage people
    #[command(subcommand)]
    Person(PersonCommand),
    /// Manage classes and their rosters
    #[command(subcommand)]
    Class(ClassCommand),
    /// Enroll one or more face images for a person
    Enroll {
        person: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Make the (first successful) enrollment primary
        #[arg(long)]
        primary: bool,
    },
    /// Inspect or remove enrollments
    #[command(subcommand)]
    Enrollment(EnrollmentCommand),
    /// Check an image against the quality gate
    Validate { image: PathBuf },
    /// Identify the person in an image
    Recognize { image: PathBuf },
    /// Recognize a face and mark it present in a class
    Attend {
        /// Class id or code
        class: String,
        image: PathBuf,
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Recorded as the session creator
        #[arg(long)]
        by: Option<String>,
    },
    /// Mark attendance by hand
    Mark {
        class: String,
        person: String,
        #[arg(long, default_value = "present")]
        status: AttendanceStatus,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        by: Option<String>,
    },
    /// Attendance sessions
    #[command(subcommand)]
    Session(SessionCommand),
    /// Delete recognition records older than the cleanup window
    Cleanup {
        /// Window in hours (defaults to the configured one)
        #[arg(long)]
        hours: Option<u64>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Corpus backend maintenance
    #[command(subcommand)]
    Corpus(CorpusCommand),
    /// Remote faceset maintenance
    #[command(subcommand)]
    Faceset(FacesetCommand),
}

#[derive(Subcommand)]
enum PersonCommand {
    Add {
        id: String,
        name: String,
        /// Classes (id or code) to join
        #[arg(long = "class")]
        classes: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ClassCommand {
    Add {
        code: String,
        name: String,
        #[arg(long)]
        instructor: Option<String>,
    },
    Join { class: String, person: String },
    Leave { class: String, person: String },
}

#[derive(Subcommand)]
enum EnrollmentCommand {
    List { person: String },
    Primary { person: String },
    Remove { id: String },
}

#[derive(Subcommand)]
enum SessionCommand {
    Start {
        class: String,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        by: Option<String>,
    },
    End {
        class: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    Status {
        class: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[derive(Subcommand)]
enum CorpusCommand {
    /// Images per person
    Inventory,
    /// Drop the representation cache
    ClearCache,
}

#[derive(Subcommand)]
enum FacesetCommand {
    Create {
        #[arg(long)]
        outer_id: Option<String>,
    },
    Detail { token: Option<String> },
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn today(date: Option<NaiveDate>) -> NaiveDate {
    date.unwrap_or_else(|| chrono::Local::now().date_naive())
}

async fn read_image(path: &Path) -> Result<ImagePayload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(ImagePayload::Binary(bytes))
}

async fn class_id(service: &AttendanceService, class: &str) -> Result<String> {
    Ok(service.find_class(class).await?.id)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let service = AttendanceService::open(config, None)
        .await
        .context("opening attendance service")?;
    tracing::debug!(backend = %service.backend_kind(), "attendance service ready");

    match cli.command {
        Commands::Person(PersonCommand::Add { id, name, classes }) => {
            let mut class_ids = Vec::with_capacity(classes.len());
            for class in &classes {
                class_ids.push(class_id(&service, class).await?);
            }
            let person = service
                .create_person(NewPerson {
                    id,
                    display_name: name,
                    class_ids,
                })
                .await?;
            print(&person)?;
        }
        Commands::Class(ClassCommand::Add { code, name, instructor }) => {
            let class = service.create_class(NewClass { code, name, instructor }).await?;
            print(&class)?;
        }
        Commands::Class(ClassCommand::Join { class, person }) => {
            let class = class_id(&service, &class).await?;
            service.add_to_class(&class, &person).await?;
            println!("{person} joined {class}");
        }
        Commands::Class(ClassCommand::Leave { class, person }) => {
            let class = class_id(&service, &class).await?;
            if service.remove_from_class(&class, &person).await? {
                println!("{person} left {class}");
            } else {
                println!("{person} was not on the roster of {class}");
            }
        }
        Commands::Enroll { person, images, primary } => {
            let mut payloads = Vec::with_capacity(images.len());
            for path in &images {
                payloads.push(read_image(path).await?);
            }
            if let [single] = payloads.as_slice() {
                print(&service.enroll(&person, single, primary).await?)?;
            } else {
                print(&service.enroll_batch(&person, &payloads, primary).await?)?;
            }
        }
        Commands::Enrollment(EnrollmentCommand::List { person }) => {
            print(&service.list_enrollments(&person).await?)?;
        }
        Commands::Enrollment(EnrollmentCommand::Primary { person }) => {
            print(&service.primary_enrollment(&person).await?)?;
        }
        Commands::Enrollment(EnrollmentCommand::Remove { id }) => {
            print(&service.delete_enrollment(&id).await?)?;
        }
        Commands::Validate { image } => {
            let image = read_image(&image).await?;
            print(&service.validate_image(&image).await?)?;
        }
        Commands::Recognize { image } => {
            let image = read_image(&image).await?;
            print(&service.recognize(&image).await?)?;
        }
        Commands::Attend { class, image, date, by } => {
            let class = class_id(&service, &class).await?;
            let image = read_image(&image).await?;
            let result = service
                .recognize_and_mark(&class, today(date), &image, by.as_deref())
                .await?;
            print(&result)?;
        }
        Commands::Mark {
            class,
            person,
            status,
            date,
            notes,
            by,
        } => {
            let class = class_id(&service, &class).await?;
            let mut mark = AttendanceMark::new(&person, &class, today(date), status);
            mark.notes = notes;
            mark.created_by = by;
            print(&service.mark_attendance(mark).await?)?;
        }
        Commands::Session(SessionCommand::Start { class, date, by }) => {
            let class = class_id(&service, &class).await?;
            let session = service
                .get_or_create_session(&class, today(date), by.as_deref())
                .await?;
            print(&session)?;
        }
        Commands::Session(SessionCommand::End { class, date }) => {
            let class = class_id(&service, &class).await?;
            print(&service.end_session(&class, today(date)).await?)?;
        }
        Commands::Session(SessionCommand::Status { class, date }) => {
            let class = class_id(&service, &class).await?;
            print(&service.attendance_status(&class, today(date)).await?)?;
        }
        Commands::Cleanup { hours, dry_run } => {
            print(&service.run_stale_attendance_cleanup(hours, dry_run).await?)?;
        }
        Commands::Corpus(CorpusCommand::Inventory) => {
            print(&service.corpus_inventory().await?)?;
        }
        Commands::Corpus(CorpusCommand::ClearCache) => {
            if service.clear_representation_cache().await? {
                println!("representation cache cleared");
            } else {
                println!("the {} backend keeps no representation cache", service.backend_kind());
            }
        }
        Commands::Faceset(FacesetCommand::Create { outer_id }) => {
            let token = service.create_faceset(outer_id.as_deref()).await?;
            println!("{token}");
        }
        Commands::Faceset(FacesetCommand::Detail { token }) => {
            print(&service.faceset_detail(token.as_deref()).await?)?;
        }
    }

    Ok(())
}
