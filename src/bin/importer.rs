use clap::Parser;
use osmatlas_import::config::{ImportParameter, Router, VEHICLE_BICYCLE, VEHICLE_CAR, VEHICLE_FOOT};
use osmatlas_import::progress::{Breaker, ConsoleProgress, Progress};
use osmatlas_import::Importer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "osmatlas-import")]
#[command(about = "Imports OSM extracts into a queryable map database")]
struct Args {
    /// OSM input files, either *.osm or *.pbf
    map_files: Vec<PathBuf>,

    /// JSON parameter file; command line flags override its values
    #[arg(short, long)]
    parameter_file: Option<PathBuf>,

    /// Type catalogue file
    #[arg(short, long)]
    typefile: Option<PathBuf>,

    /// Destination directory for all database files
    #[arg(short, long)]
    destination: Option<PathBuf>,

    /// First import step to execute (1-based)
    #[arg(long)]
    start_step: Option<usize>,

    /// Last import step to execute (1-based)
    #[arg(long)]
    end_step: Option<usize>,

    /// Delete temporary files as soon as no remaining step requires them
    #[arg(long)]
    eco: bool,

    /// Router definitions as <vehicles>:<filebase>, e.g. car:router or
    /// foot,bicycle:slowrouter; may be given multiple times
    #[arg(long = "router")]
    routers: Vec<String>,

    /// Generate the optional full-text index over names
    #[arg(long)]
    text_index: bool,

    /// Language preference for name tags; '#' is the untagged default
    #[arg(long)]
    lang_order: Vec<String>,
}

fn parse_router(spec: &str) -> Result<Router, String> {
    let (vehicles, filebase) = spec
        .split_once(':')
        .ok_or_else(|| format!("router '{}' is not <vehicles>:<filebase>", spec))?;

    let mut mask = 0u8;
    for vehicle in vehicles.split(',') {
        mask |= match vehicle {
            "foot" => VEHICLE_FOOT,
            "bicycle" => VEHICLE_BICYCLE,
            "car" => VEHICLE_CAR,
            other => return Err(format!("unknown vehicle '{}'", other)),
        };
    }

    Ok(Router::new(mask, filebase))
}

fn build_parameter(args: &Args) -> Result<ImportParameter, String> {
    let mut parameter = match &args.parameter_file {
        Some(path) => ImportParameter::from_file(path).map_err(|e| format!("{:#}", e))?,
        None => ImportParameter::default(),
    };

    if !args.map_files.is_empty() {
        parameter.map_files = args.map_files.clone();
    }
    if let Some(typefile) = &args.typefile {
        parameter.type_file = typefile.clone();
    }
    if let Some(destination) = &args.destination {
        parameter.destination_directory = destination.clone();
    }
    if let Some(start_step) = args.start_step {
        parameter.start_step = start_step;
    }
    if let Some(end_step) = args.end_step {
        parameter.end_step = end_step;
    }
    if args.eco {
        parameter.eco = true;
    }
    if args.text_index {
        parameter.text_index = true;
    }
    if !args.lang_order.is_empty() {
        parameter.lang_order = args.lang_order.clone();
    }
    if !args.routers.is_empty() {
        parameter.routers = args
            .routers
            .iter()
            .map(|spec| parse_router(spec))
            .collect::<Result<_, _>>()?;
    }

    if parameter.map_files.is_empty() {
        return Err("no input files given".to_string());
    }

    Ok(parameter)
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let parameter = match build_parameter(&args) {
        Ok(parameter) => parameter,
        Err(message) => {
            error!("{}", message);
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&parameter.destination_directory) {
        error!(
            "Cannot create destination directory {:?}: {}",
            parameter.destination_directory, e
        );
        std::process::exit(1);
    }

    let importer = Importer::new(parameter);
    let progress: Arc<ConsoleProgress> = Arc::new(ConsoleProgress::new());
    let breaker = Breaker::new();

    let result = importer.run(progress.clone(), breaker);

    match result {
        Ok(()) if progress.error_count() == 0 => {
            info!("Import done");
        }
        Ok(()) => {
            error!("Import finished with {} error(s)", progress.error_count());
            std::process::exit(1);
        }
        Err(e) => {
            error!("Import failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
