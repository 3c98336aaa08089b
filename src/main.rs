use clap::{ArgGroup, Parser};
use rpakit::depot::normalize_input;
use rpakit::pipeline::{self, DepotLifecycle, Options, RunReport, Task};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rpakit",
    version,
    about = "Search for and unpack Ren'Py archives (RPA)",
    after_help = "The output directory defaults to <TARGET>/rpakit_out. Change it with -o."
)]
#[command(group(
    ArgGroup::new("task")
        .required(true)
        .args(["expand", "list", "test", "simulate"])
))]
struct Cli {
    /// Directory to search, or a single archive
    #[arg(value_name = "TARGET")]
    target: String,
    /// Unpack all stored files
    #[arg(short, long)]
    expand: bool,
    /// List all stored files
    #[arg(short, long)]
    list: bool,
    /// Check whether the archives are a known format
    #[arg(short, long)]
    test: bool,
    /// Unpack into a temporary directory that is thrown away
    #[arg(short, long)]
    simulate: bool,
    /// Extract here instead of the default directory
    #[arg(short, long, value_name = "DIR")]
    outdir: Option<std::path::PathBuf>,
    /// Amount of output: 0 warnings only, 1 progress, 2 everything
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    verbose: u8,
    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn task(&self) -> Task {
        match (self.expand, self.list, self.test) {
            (true, _, _) => Task::Extract,
            (_, true, _) => Task::List,
            (_, _, true) => Task::Test,
            _            => Task::Simulate,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let target = normalize_input(&cli.target);
    if !target.exists() {
        return Err(format!("target {} does not exist", target.display()).into());
    }

    let options = Options {
        task:        cli.task(),
        destination: cli.outdir.clone(),
        json:        cli.json,
    };
    let report = pipeline::run(&target, &options)?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn print_report(report: &RunReport) {
    match report.task {

        // ── List ─────────────────────────────────────────────────────────────
        Task::List => {
            for depot in report.depots.iter().filter(|d| d.lifecycle == DepotLifecycle::Listed) {
                println!("{}:", depot.path.display());
                for path in &depot.listing {
                    println!("  {path}");
                }
                println!("  {} file(s)", depot.entries);
            }
        }

        // ── Test ─────────────────────────────────────────────────────────────
        Task::Test => {
            println!("{:<8} {:<7} {:>8}  Archive", "Format", "Alias", "Entries");
            for depot in &report.depots {
                let format = depot.format.map(|f| f.name()).unwrap_or("-");
                let verdict = match depot.lifecycle {
                    DepotLifecycle::Tested => String::new(),
                    _ => format!("  ({})", depot.message.as_deref().unwrap_or("not processed")),
                };
                println!(
                    "{:<8} {:<7} {:>8}  {}{}",
                    format,
                    depot.alias.unwrap_or("-"),
                    depot.entries,
                    depot.path.display(),
                    verdict
                );
            }
        }

        // ── Extract / Simulate ───────────────────────────────────────────────
        Task::Extract | Task::Simulate => {
            for depot in report.depots.iter().filter(|d| d.written > 0) {
                let extra = match (depot.renamed, depot.truncated, depot.failed_entries) {
                    (0, _, 0) => String::new(),
                    (r, 0, f) => format!(" ({r} renamed, {f} failed)"),
                    (r, t, f) => format!(" ({r} renamed, {t} incomplete, {f} failed)"),
                };
                println!("  unpacked {:>6}  {}{}", depot.written, depot.path.display(), extra);
            }
            match (&report.destination, report.task) {
                (Some(dest), _)        => println!("Unpacked to: {}", dest.display()),
                (None, Task::Simulate) => println!("Simulation finished; nothing was kept"),
                (None, _)              => println!("Nothing was unpacked"),
            }
        }
    }
    println!("{}", report.summary());
}
