use std::collections::HashMap;
use std::env;
use std::io;
use std::process;

use rsv_eng::csv::{read_commands, read_show_dates, read_users, write_balances};
use rsv_eng::{Engine, EngineConfig, MemoryStore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let usage = "usage: rsv-eng <show_dates.csv> <users.csv> <commands.csv>";
    let show_dates_path = args.next().expect(usage);
    let users_path = args.next().expect(usage);
    let commands_path = args.next().expect(usage);

    let config = EngineConfig::from_env().unwrap_or_else(|e| {
        error!("invalid configuration: {e}");
        process::exit(2);
    });

    let commands = read_commands(commands_path).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });

    let store = MemoryStore::new();
    seed(&store, &show_dates_path, &users_path);

    let engine = Engine::new(store, config);
    let (command_sender, command_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(command) => {
                    if command_sender.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    engine.run(ReceiverStream::new(command_receiver)).await;

    let store = engine.store();
    let mut active: HashMap<_, usize> = HashMap::new();
    for reservation in store.reservations() {
        if reservation.status.is_active() {
            *active.entry(reservation.user).or_default() += 1;
        }
    }
    let balances = store.users().into_iter().map(|balance| {
        let count = active.get(&balance.user).copied().unwrap_or(0);
        (balance.user, balance.points, count)
    });

    if let Err(e) = write_balances(io::stdout().lock(), balances) {
        error!("{e}");
        process::exit(1);
    }
}

/// Load the catalog and the users. Bad rows are reported and skipped.
fn seed(store: &MemoryStore, show_dates_path: &str, users_path: &str) {
    match read_show_dates(show_dates_path) {
        Ok(details) => {
            for result in details {
                match result {
                    Ok(detail) => {
                        store.insert_show(detail.show);
                        if let Err(e) = store.insert_show_date(detail.show_date) {
                            warn!("{e}");
                        }
                    }
                    Err(e) => warn!("{e}"),
                }
            }
        }
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    }

    match read_users(users_path) {
        Ok(users) => {
            for result in users {
                match result {
                    Ok(user) => store.insert_user(user),
                    Err(e) => warn!("{e}"),
                }
            }
        }
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    }
}
