mod cli;

use cli::CliCommand;
use ruknock::config::{Settings, SettingsFile, SettingsProvider};
use ruknock::error::KnockError;
use ruknock::events::{EventLoggers, HistoryFile, LogEventLogger};
use ruknock::knocker::{KnockOptions, SystemKnocker};
use ruknock::report::{self, KnockStatistics};
use ruknock::sequence::{Sequence, SequenceId};
use ruknock::store::JsonFileStore;
use ruknock::utils;
use ruknock::watcher::ResourceState;
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            utils::exit_with_error(&format!("invalid arguments: {}", e), 2);
        }
    };

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let settings = match &args.config {
        Some(path) => match SettingsFile::load(path) {
            Ok(file) => file.settings(),
            Err(e) => utils::exit_with_error(&format!("{:#}", e), 1),
        },
        None => Settings::default(),
    };

    let history = match &args.history {
        Some(path) => match HistoryFile::open(path) {
            Ok(history) => Some(Arc::new(history)),
            Err(e) => utils::exit_with_error(&format!("cannot open history {}: {}", path.display(), e), 1),
        },
        None => None,
    };
    let mut loggers = EventLoggers::new().with(Arc::new(LogEventLogger));
    if let Some(history) = &history {
        loggers = loggers.with(history.clone());
    }

    let store = Arc::new(JsonFileStore::new(&args.store));
    let knocker = SystemKnocker::from_settings(&settings, store, Arc::new(loggers));

    let code = match run(&knocker, args.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ruknock: {:#}", e);
            1
        }
    };

    if let Some(history) = history {
        history.close().await;
    }
    std::process::exit(code);
}

async fn run(knocker: &SystemKnocker, command: CliCommand) -> anyhow::Result<i32> {
    match command {
        CliCommand::List => {
            let sequences = knocker.store().list()?;
            if sequences.is_empty() {
                println!("No sequences stored");
            }
            for sequence in &sequences {
                println!("{}", report::format_sequence(sequence));
            }
            Ok(0)
        }
        CliCommand::Show(id) => {
            let sequence = find(knocker, id)?;
            println!("{}", serde_json::to_string_pretty(&sequence)?);
            if let Err(e) = utils::validate_sequence(&sequence) {
                utils::print_warning(&e.to_string());
            }
            for warning in utils::sequence_warnings(&sequence) {
                utils::print_warning(&warning);
            }
            Ok(0)
        }
        CliCommand::Knock { id, verify } => knock(knocker, id, verify).await,
        CliCommand::Check(id) => {
            let state = knocker.check(id).await?;
            println!("{}", report::format_state(&state));
            Ok(if state.is_available() { 0 } else { 1 })
        }
        CliCommand::Watch(ids) => watch(knocker, ids).await,
        CliCommand::Import(path) => {
            let count = knocker.import(&path)?;
            println!("Imported {} sequence(s) from {}", count, path.display());
            Ok(0)
        }
        CliCommand::Export(path) => {
            let count = knocker.export(&path)?;
            println!("Exported {} sequence(s) to {}", count, path.display());
            Ok(0)
        }
        CliCommand::Delete(id) => {
            knocker.delete(id)?;
            println!("Deleted sequence {}", id);
            Ok(0)
        }
    }
}

fn find(knocker: &SystemKnocker, id: SequenceId) -> anyhow::Result<Sequence> {
    Ok(knocker.store().find(id)?.ok_or(KnockError::SequenceNotFound(id))?)
}

async fn knock(knocker: &SystemKnocker, id: SequenceId, verify: bool) -> anyhow::Result<i32> {
    let sequence = find(knocker, id)?;
    for warning in utils::sequence_warnings(&sequence) {
        utils::print_warning(&warning);
    }
    println!("{}", report::format_header(&sequence));

    // Ctrl+C cancels the run; the knock future then finishes as cancelled.
    let mut shutdown_signal = utils::setup_signal_handler();
    let run = knocker.knock_with(id, KnockOptions { force_verify: verify });
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = &mut shutdown_signal => {
            knocker.cancel(id);
            run.await
        }
    };
    let knocked = result?;

    for step in &knocked.outcome.steps {
        println!("{}", report::format_step(step));
    }
    println!("{}", report::format_outcome(&knocked.outcome));
    if !knocked.public_ips.is_empty() {
        let ips: Vec<String> = knocked.public_ips.iter().map(ToString::to_string).collect();
        println!("Public IP: {}", ips.join(", "));
    }
    if let Some(verification) = &knocked.verification {
        println!("{}", report::format_verification(verification));
    }
    println!(
        "{}",
        KnockStatistics::from_outcome(&knocked.outcome).format_summary(&knocked.outcome.name)
    );

    let available = knocked
        .verification
        .as_ref()
        .is_none_or(|verification| verification.state.is_available());
    Ok(if knocked.outcome.success && available { 0 } else { 1 })
}

/// Settled status of a resource; `None` while unknown or being checked.
fn settled(state: &ResourceState) -> Option<(bool, &str)> {
    match state {
        ResourceState::Available { .. } => Some((true, "")),
        ResourceState::Unavailable { reason, .. } => Some((false, reason.as_str())),
        ResourceState::Unknown | ResourceState::Checking { .. } => None,
    }
}

async fn watch(knocker: &SystemKnocker, ids: Vec<SequenceId>) -> anyhow::Result<i32> {
    let sequences = knocker.store().list()?;
    let ids = if ids.is_empty() {
        sequences
            .iter()
            .filter(|sequence| sequence.check.enabled)
            .filter_map(|sequence| sequence.id)
            .collect()
    } else {
        ids
    };
    let names: HashMap<SequenceId, String> = sequences
        .iter()
        .filter_map(|sequence| Some((sequence.id?, sequence.display_name())))
        .collect();

    let mut watched = Vec::new();
    for id in ids {
        if knocker.watch(id, true)? {
            watched.push(id);
        } else {
            utils::print_warning(&format!("sequence {} has no enabled access check", id));
        }
    }
    if watched.is_empty() {
        return Err(anyhow::anyhow!("nothing to watch"));
    }
    println!("Watching {} resource(s), press Ctrl+C to stop", watched.len());

    let mut states = knocker.watcher().subscribe();
    let mut shutdown_signal = utils::setup_signal_handler();
    let mut printed: HashMap<SequenceId, ResourceState> = HashMap::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = states.borrow_and_update().clone();
                for id in &watched {
                    let Some(state) = current.get(id) else { continue };
                    let Some(status) = settled(state) else { continue };
                    if printed.get(id).and_then(settled) == Some(status) {
                        continue;
                    }
                    let name = names.get(id).cloned().unwrap_or_else(|| format!("#{}", id));
                    println!("{}: {}", name, report::format_state(state));
                    printed.insert(*id, state.clone());
                }
            }
        }
    }

    knocker.watcher().unwatch_all();
    Ok(0)
}
