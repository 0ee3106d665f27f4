use std::{
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::Duration,
};

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use racecraft::{
    RaceCraftError, RaceSession, StrategyConfig, StrategyEngine,
    features::{TrainingSet, build_training_set},
    strategy::{Forecaster, PaceModel, TrainingTask},
    telemetry::{JsonlTelemetrySource, TelemetryBatch, TelemetrySource},
};
use serde::Serialize;

const DEFAULT_RACE: &str = "R1";
const DEFAULT_TOTAL_LAPS: u32 = 27;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    /// Strategy config file, defaults to the one in the user config directory
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the strategy picture of every vehicle in a telemetry file
    Analyze {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long, default_value = DEFAULT_RACE)]
        race: String,

        #[arg(short, long, default_value_t = DEFAULT_TOTAL_LAPS)]
        total_laps: u32,

        #[arg(short, long, default_value_t = 5)]
        laps_ahead: usize,

        /// Trained pace model, trend extrapolation is used without one
        #[arg(short, long)]
        model: Option<PathBuf>,
    },
    /// Print the leaderboard and battle groups
    Leaderboard {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long, default_value = DEFAULT_RACE)]
        race: String,
    },
    /// Fit the pace model on a telemetry file
    Train {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long, default_value = DEFAULT_RACE)]
        race: String,

        #[arg(long, default_value_t = 1)]
        lookahead: usize,

        /// Where to write the model artifact
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Follow a telemetry file that is still being written
    Watch {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long, default_value = DEFAULT_RACE)]
        race: String,

        #[arg(short, long, default_value_t = DEFAULT_TOTAL_LAPS)]
        total_laps: u32,

        /// Seconds between polls
        #[arg(long, default_value_t = 2)]
        interval: u64,

        #[arg(short, long)]
        model: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<StrategyConfig, RaceCraftError> {
    match path {
        Some(path) => StrategyConfig::from_path(path),
        None => Ok(StrategyConfig::from_local_file()?.unwrap_or_default()),
    }
}

fn load_forecaster(model: Option<&Path>) -> Forecaster {
    let Some(path) = model else {
        return Forecaster::TrendOnly;
    };
    match PaceModel::load(path) {
        Ok(model) => Forecaster::Trained(model),
        Err(e) => {
            warn!("Could not load pace model, using trend extrapolation: {}", e);
            Forecaster::TrendOnly
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), RaceCraftError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| RaceCraftError::OutputError { source: e })?;
    println!("{}", json);
    Ok(())
}

fn load_session(
    input: &Path,
    race: &str,
    config: StrategyConfig,
    forecaster: Forecaster,
) -> Result<RaceSession, RaceCraftError> {
    let mut source = JsonlTelemetrySource::new(input, config.segmenter.track_length_m)?;
    let mut session = RaceSession::new(race, StrategyEngine::new(config, forecaster)?);
    let vehicles = session.poll(&mut source)?;
    info!("Loaded telemetry for {} vehicles from {:?}", vehicles, input);
    Ok(session)
}

fn analyze(
    config: StrategyConfig,
    input: &Path,
    race: &str,
    total_laps: u32,
    laps_ahead: usize,
    model: Option<&Path>,
) -> Result<(), RaceCraftError> {
    let session = load_session(input, race, config, load_forecaster(model))?;
    for update in session.process_vehicles()? {
        for warning in &update.warnings {
            warn!("{}: {:?}", update.vehicle.vehicle_id, warning);
        }
    }
    print_json(&session.strategy(laps_ahead, total_laps)?)
}

#[derive(Serialize)]
struct LeaderboardOutput {
    leaderboard: Vec<racecraft::LeaderboardEntry>,
    battles: Vec<Vec<String>>,
}

fn leaderboard(config: StrategyConfig, input: &Path, race: &str) -> Result<(), RaceCraftError> {
    let session = load_session(input, race, config, Forecaster::TrendOnly)?;
    let leaderboard = session.leaderboard()?;
    let battles = session.engine().aggregator().battle_groups(&leaderboard);
    print_json(&LeaderboardOutput {
        leaderboard,
        battles,
    })
}

fn train(
    config: StrategyConfig,
    input: &Path,
    race: &str,
    lookahead: usize,
    output: Option<&Path>,
) -> Result<(), RaceCraftError> {
    let lookback = config.forecast.lookback;
    let mae_target_s = config.forecast.mae_target_s;
    let session = load_session(input, race, config, Forecaster::TrendOnly)?;

    let mut set = TrainingSet::default();
    for rows in session.histories()?.values() {
        set.extend(build_training_set(rows, lookback, lookahead));
    }

    let (model, metrics) = TrainingTask::spawn(set, lookback, mae_target_s).join()?;
    if let Some(output) = output {
        model.save(output)?;
        info!("Saved pace model to {:?}", output);
    }
    print_json(&metrics)
}

fn watch(
    config: StrategyConfig,
    input: &Path,
    race: &str,
    total_laps: u32,
    interval: u64,
    model: Option<&Path>,
) -> Result<(), RaceCraftError> {
    let mut source = JsonlTelemetrySource::new(input, config.segmenter.track_length_m)?;
    let mut session = RaceSession::new(race, StrategyEngine::new(config, load_forecaster(model))?);
    let (batch_tx, batch_rx) = mpsc::channel::<Vec<TelemetryBatch>>();

    let poll_race = race.to_string();
    thread::spawn(move || {
        loop {
            match source.poll(&poll_race) {
                Ok(batches) => {
                    if batch_tx.send(batches).is_err() {
                        break;
                    }
                }
                Err(e) => error!("Error polling telemetry: {}", e),
            }
            thread::sleep(Duration::from_secs(interval));
        }
    });

    for batches in batch_rx {
        if session.ingest(batches) == 0 {
            continue;
        }
        print_json(&session.strategy(1, total_laps)?)?;
    }
    Ok(())
}

fn main() {
    #[cfg(debug_assertions)]
    colog::init();

    let cli = Args::parse();
    ctrlc::set_handler(move || {
        println!("Exiting...");
        std::process::exit(0);
    })
    .expect("Could not set Ctrl-C handler");

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid strategy config: {}", e);
            std::process::exit(1);
        }
    };

    let result = match &cli.command {
        Commands::Analyze {
            input,
            race,
            total_laps,
            laps_ahead,
            model,
        } => analyze(config, input, race, *total_laps, *laps_ahead, model.as_deref()),
        Commands::Leaderboard { input, race } => leaderboard(config, input, race),
        Commands::Train {
            input,
            race,
            lookahead,
            output,
        } => train(config, input, race, *lookahead, output.as_deref()),
        Commands::Watch {
            input,
            race,
            total_laps,
            interval,
            model,
        } => watch(config, input, race, *total_laps, *interval, model.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
