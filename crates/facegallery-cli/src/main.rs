use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegallery_store::{GalleryStore, PersonSummary};
use std::path::PathBuf;

mod review;

#[derive(Parser)]
#[command(name = "facegallery", about = "Face gallery review and maintenance CLI")]
struct Cli {
    /// Gallery root; holds `database/` and `faces/` unless overridden
    #[arg(long, global = true, env = "FACEGALLERY_DATA_DIR")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, env = "FACEGALLERY_DATABASE_DIR")]
    database_dir: Option<PathBuf>,
    #[arg(long, global = true, env = "FACEGALLERY_SAMPLES_DIR")]
    samples_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List persons in the gallery
    List {
        /// Only persons still named "Unknown"
        #[arg(long)]
        unknown: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show one person and its samples
    Show { id: String },
    /// Give a person a name
    Rename { id: String, name: String },
    /// Remove one sample; the person goes with its last sample
    RemoveSample { id: String, sample: String },
    /// Delete a person and all of its samples
    DeletePerson { id: String },
    /// Override a person's classification threshold
    SetThreshold { id: String, threshold: f32 },
    /// Recompute classification thresholds from sample spread
    Calibrate,
    /// 2-D projection of the gallery
    Project {
        #[arg(long)]
        json: bool,
    },
    /// Gallery counts
    Stats,
    /// Review samples one by one
    Review {
        /// Include named persons, not only "Unknown" ones
        #[arg(long)]
        all: bool,
    },
    /// Delete every person and sample image
    Clear {
        /// Required; there is no undo
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            std::env::var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("facegallery")
        })
    }

    fn open_store(&self) -> Result<GalleryStore> {
        let data_dir = self.data_dir();
        let database_dir = self.database_dir.clone().unwrap_or_else(|| data_dir.join("database"));
        let samples_dir = self.samples_dir.clone().unwrap_or_else(|| data_dir.join("faces"));
        GalleryStore::open(&database_dir, &samples_dir)
            .with_context(|| format!("failed to open gallery in {}", database_dir.display()))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = cli.open_store()?;

    match cli.command {
        Commands::List { unknown, json } => {
            let persons = store.list_persons(unknown)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&persons)?);
            } else if persons.is_empty() {
                println!("No persons in the gallery");
            } else {
                println!("{:<36}  {:<20}  {:>7}  {:>9}", "ID", "NAME", "SAMPLES", "THRESHOLD");
                for p in &persons {
                    println!(
                        "{:<36}  {:<20}  {:>7}  {:>9.3}",
                        p.global_id,
                        p.name,
                        p.samples.len(),
                        p.classification_threshold
                    );
                }
            }
        }
        Commands::Show { id } => {
            let Some(person) = store.get_by_id(&id)? else {
                bail!("person not found: {id}");
            };
            print_person(&PersonSummary::from(&person));
        }
        Commands::Rename { id, name } => {
            store.rename(&id, &name)?;
            println!("Renamed {id} to {name}");
        }
        Commands::RemoveSample { id, sample } => {
            if store.remove_sample(&id, &sample)? {
                println!("Removed sample {sample}; person {id} had no samples left and was deleted");
            } else {
                println!("Removed sample {sample} from {id}");
            }
        }
        Commands::DeletePerson { id } => {
            store.delete_person(&id)?;
            println!("Deleted person {id}");
        }
        Commands::SetThreshold { id, threshold } => {
            store.set_threshold(&id, threshold)?;
            println!("Threshold of {id} set to {threshold:.3}");
        }
        Commands::Calibrate => {
            let updated = store.recalibrate()?;
            println!("Recalibrated {updated} person(s)");
        }
        Commands::Project { json } => {
            let projection = store.project()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&projection)?);
            } else {
                for p in &projection.persons {
                    println!(
                        "{:<36}  {:<20}  ({:>8.3}, {:>8.3})  r=({:.3}, {:.3})",
                        p.global_id, p.name, p.point[0], p.point[1], p.radii[0], p.radii[1]
                    );
                }
            }
        }
        Commands::Stats => {
            let stats = store.stats()?;
            println!("Database:        {}", store.db_path().display());
            println!("Persons:         {}", stats.persons);
            println!("Unknown persons: {}", stats.unknown_persons);
            println!("Samples:         {}", stats.samples);
        }
        Commands::Review { all } => {
            let persons = store.get_all(!all)?;
            if persons.is_empty() {
                println!("Nothing to review");
                return Ok(());
            }
            let report = review::run(&store, &persons, &mut std::io::stdin().lock(), &mut std::io::stdout())?;
            review::print_report(&report, &mut std::io::stdout())?;
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to clear the gallery without --yes");
            }
            let removed = store.clear()?;
            println!("Removed {removed} person(s)");
        }
    }

    Ok(())
}

fn print_person(p: &PersonSummary) {
    println!("ID:        {}", p.global_id);
    println!("Name:      {}", p.name);
    println!("Threshold: {:.3}", p.classification_threshold);
    println!("Last seen: {}", p.last_image_time);
    println!("Samples:   {}", p.samples.len());
    for s in &p.samples {
        println!("  {}  {}", s.id, s.image_path.display());
    }
}
