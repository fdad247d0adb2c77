mod scoreboard;

use crate::scoreboard::{FeedEvent, ScoreboardWorker};
use anyhow::Context;
use chrono::Local;
use crg_api::{
    DerbyGame, GameMeta, StateCache, Team, extract_game, read_game_file, read_tsv_file,
    write_tsv_file,
};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

#[derive(Debug)]
enum Input {
    GameJson(PathBuf),
    Tsv(PathBuf),
    Server(String),
}

#[derive(Debug)]
struct CliOptions {
    input: Input,
    out: Option<PathBuf>,
    summary: bool,
    anonymize: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let CliOptions { input, out, summary, anonymize } = parse_cli_args();

    match input {
        Input::Server(server) => run_live(server, out, anonymize).await,
        input => run_file(input, out, summary, anonymize),
    }
}

fn run_file(
    input: Input,
    out: Option<PathBuf>,
    summary: bool,
    anonymize: bool,
) -> anyhow::Result<()> {
    let mut game = match &input {
        Input::GameJson(path) => {
            let state = read_game_file(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let mut game = extract_game(state)
                .with_context(|| format!("extracting {}", path.display()))?;
            game.meta
                .set(GameMeta::SOURCE_FILEPATH, path.display().to_string());
            game.meta.set("extracted_at", Local::now().to_rfc3339());
            game
        }
        Input::Tsv(path) => {
            read_tsv_file(path).with_context(|| format!("reading {}", path.display()))?
        }
        Input::Server(_) => unreachable!(),
    };

    if anonymize {
        game.anonymize_names();
    }
    if let Some(out) = &out {
        write_tsv_file(&game, out).with_context(|| format!("writing {}", out.display()))?;
        info!("wrote {} jams to {}", game.jams.len(), out.display());
    }
    if summary || out.is_none() {
        print_summaries(&game);
    }
    Ok(())
}

async fn run_live(server: String, out: Option<PathBuf>, anonymize: bool) -> anyhow::Result<()> {
    let Some(out) = out else {
        anyhow::bail!("--server requires --out <jams.tsv>");
    };
    let url = format!("ws://{server}/WS/");
    let cache = Arc::new(Mutex::new(StateCache::new()));
    let (event_tx, mut events) = mpsc::channel::<FeedEvent>(100);

    let worker = ScoreboardWorker {
        url: url.clone(),
        cache: Arc::clone(&cache),
        events: event_tx,
    };
    let worker_task = tokio::spawn(worker.run());

    info!("following scoreboard at {url}, writing {}", out.display());
    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Connected => info!("connected to scoreboard"),
            FeedEvent::Disconnected => warn!("scoreboard connection lost, retrying"),
            FeedEvent::Error(message) => warn!("{message}"),
            FeedEvent::StateChanged => {
                let snapshot = {
                    let mut guard = cache.lock().await;
                    guard.mark_clean();
                    if guard.is_empty() {
                        continue;
                    }
                    debug!("re-extracting after {} feed messages", guard.messages_applied());
                    guard.snapshot()
                };
                match extract_game(snapshot) {
                    Ok(mut game) => {
                        game.meta.set("extracted_at", Local::now().to_rfc3339());
                        if anonymize {
                            game.anonymize_names();
                        }
                        match write_tsv_file(&game, &out) {
                            Ok(()) => {
                                info!("wrote {} jams to {}", game.jams.len(), out.display())
                            }
                            Err(e) => warn!("writing {} failed: {e}", out.display()),
                        }
                    }
                    Err(e) => warn!("extraction failed: {e}"),
                }
            }
        }
    }

    worker_task.abort();
    Ok(())
}

fn parse_cli_args() -> CliOptions {
    let mut input: Option<Input> = None;
    let mut out = None;
    let mut summary = false;
    let mut anonymize = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{}", usage_text());
                std::process::exit(0);
            }
            "-V" | "--version" => {
                println!("derbystat {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--tsv" => {
                let path = PathBuf::from(required_value(&mut args, "--tsv"));
                set_input(&mut input, Input::Tsv(path));
            }
            "--server" => {
                let server = required_value(&mut args, "--server");
                set_input(&mut input, Input::Server(server));
            }
            "--out" => out = Some(PathBuf::from(required_value(&mut args, "--out"))),
            "--summary" => summary = true,
            "--anonymize" => anonymize = true,
            _ if arg.starts_with('-') => {
                eprintln!("Unknown argument: {arg}\n\n{}", usage_text());
                std::process::exit(2);
            }
            _ => set_input(&mut input, Input::GameJson(PathBuf::from(arg))),
        }
    }

    let Some(input) = input else {
        eprintln!("No input given.\n\n{}", usage_text());
        std::process::exit(2);
    };
    CliOptions { input, out, summary, anonymize }
}

fn required_value(args: &mut impl Iterator<Item = String>, flag: &str) -> String {
    match args.next() {
        Some(value) => value,
        None => {
            eprintln!("{flag} requires a value\n\n{}", usage_text());
            std::process::exit(2);
        }
    }
}

fn set_input(slot: &mut Option<Input>, input: Input) {
    if slot.is_some() {
        eprintln!("Only one input may be given.\n\n{}", usage_text());
        std::process::exit(2);
    }
    *slot = Some(input);
}

fn usage_text() -> &'static str {
    "derbystat - roller derby scoreboard analytics

Usage:
  derbystat <game.json> [--out jams.tsv] [--summary] [--anonymize]
  derbystat --tsv <jams.tsv> [--summary]
  derbystat --server <host:port> --out <jams.tsv> [--anonymize]

Options:
  --out <file>        Write the per-jam table as TSV
  --summary           Print game, team, and jammer summaries
  --anonymize         Replace skater and team names with pseudonyms
  --tsv <file>        Read a previously exported TSV instead of game JSON
  --server <host:port> Follow a live scoreboard and rewrite --out on change

Environment:
  RUST_LOG            Log filter (default: info)"
}

fn print_summaries(game: &DerbyGame) {
    let summary = game.game_summary();
    println!(
        "{} vs {}  ({})",
        game.meta.team_name(Team::One),
        game.meta.team_name(Team::Two),
        game.meta
            .get(GameMeta::SCOREBOARD_VERSION)
            .unwrap_or("unknown version"),
    );
    println!(
        "Final score: {} - {}",
        summary.final_score_1, summary.final_score_2
    );
    println!(
        "Periods: {}   Jams: {}   Duration: {:.1} min",
        summary.n_periods, summary.n_jams, summary.duration_minutes
    );

    println!();
    println!(
        "{:<24} {:>7} {:>6} {:>6} {:>6} {:>7} {:>7}",
        "Team", "Points", "Leads", "Losts", "Calls", "Trips", "Passes"
    );
    for totals in game.teams_summary() {
        println!(
            "{:<24} {:>7} {:>6} {:>6} {:>6} {:>7} {:>7}",
            totals.team,
            totals.jam_points,
            totals.leads,
            totals.losts,
            totals.calloffs,
            totals.scoring_trips,
            totals.star_passes,
        );
    }

    for team in Team::BOTH {
        let stats = game.jammer_summary(team);
        if stats.is_empty() {
            continue;
        }
        println!();
        println!("Jammers, {}:", game.meta.team_name(team));
        println!(
            "  {:<20} {:>4} {:>5} {:>6} {:>9} {:>7}",
            "Name", "Jams", "Pts", "Net", "Net/jam", "Lead%"
        );
        for jammer in stats {
            println!(
                "  {:<20} {:>4} {:>5} {:>6} {:>9.2} {:>6.0}%",
                jammer.name,
                jammer.jams,
                jammer.total_score,
                jammer.net_points,
                jammer.mean_net_points(),
                jammer.proportion_lead() * 100.0,
            );
        }
    }
}
