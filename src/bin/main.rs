use std::{collections::HashMap, process};

use nix::{sys::signal, unistd::Pid};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use notifyg::{
    cli::{parse_args, Cli, Commands},
    config::{load_config, Config},
    constants::MAX_WATCH_WAIT,
    delivery::DeliveryLoop,
    error::NotifygError,
    providers::ProviderRegistry,
    queue::PersistentQueue,
    retry::RetryPolicy,
    watcher::{build_watcher, WakeupPipe},
};

fn main() {
    let args = parse_args();
    init_logging(&args);

    let result = match &args.command {
        Commands::Start { config } => start_daemon(config),
        Commands::Send {
            config,
            contact,
            message,
        } => send_notification(config, contact, &message.join(" ")),
        Commands::List { config } => list_entries(config),
        Commands::Clear { config } => clear_queue(config),
    };

    if let Err(err) = result {
        error!("{err}");
        eprintln!("Error: {err}");
        if let NotifygError::QueueLocked { owner: Some(pid) } = err {
            eprintln!("The queue is locked by pid {pid}.");
        }
        process::exit(err.exit_code());
    }
}

/// Initializes tracing with `RUST_LOG` or the `--log-level` override.
fn init_logging(args: &Cli) {
    let filter = match args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Loads the configuration and opens the queue it describes.
fn open_queue(config: &Config) -> Result<PersistentQueue, NotifygError> {
    let policy = RetryPolicy::parse(&config.general.retry)?;
    PersistentQueue::new(config.general.queuedir.clone(), policy)
}

/// Runs the delivery daemon in the foreground until SIGINT/SIGTERM.
fn start_daemon(config_path: &str) -> Result<(), NotifygError> {
    let config = load_config(config_path.as_ref())?;
    let policy = RetryPolicy::parse(&config.general.retry)?;

    let registry = ProviderRegistry::build(&config);
    registry.validate_retry(&policy)?;

    let queue = PersistentQueue::new(config.general.queuedir.clone(), policy)?;
    let wake = WakeupPipe::install()?;
    let waker = wake.waker();
    let max_wait = config
        .general
        .maxwait
        .map(std::time::Duration::from_secs)
        .unwrap_or(MAX_WATCH_WAIT);
    let mut watcher = build_watcher(
        config.general.notify,
        &config.general.queuedir,
        wake,
        max_wait,
    )?;

    let mut delivery = DeliveryLoop::new(queue, registry, config.contacts.clone());
    let shutdown = delivery.shutdown_flag();
    if let Err(err) = ctrlc::set_handler(move || {
        shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        waker.wake();
    }) {
        warn!("Failed to register shutdown handler: {err}");
    }

    delivery.run(watcher.as_mut())
}

/// Commits a notification into the queue and signals the daemon.
fn send_notification(
    config_path: &str,
    contact: &str,
    message: &str,
) -> Result<(), NotifygError> {
    let config = load_config(config_path.as_ref())?;
    if !config.contacts.contains_key(contact) {
        return Err(NotifygError::Config(format!(
            "contact {contact} is not configured"
        )));
    }
    let queue = open_queue(&config)?;
    let entry = queue.enqueue(contact, message)?;
    info!(entry = %entry, "notification enqueued");

    // Shorten the daemon's watcher wait; omitting the signal is safe.
    if let Some(owner) = queue.lock_owner()
        && signal::kill(Pid::from_raw(owner), signal::Signal::SIGUSR1).is_err()
    {
        warn!(owner, "could not signal queue daemon");
    }
    Ok(())
}

/// Prints pending entries, earliest deadline first.
fn list_entries(config_path: &str) -> Result<(), NotifygError> {
    let config = load_config(config_path.as_ref())?;
    let queue = open_queue(&config)?;
    let mut entries = queue.iter_entries()?;
    entries.sort_by_key(|entry| (entry.deadline(), entry.file_name()));
    let contacts: HashMap<String, String> = entries
        .iter()
        .filter_map(|entry| {
            queue
                .contents(entry)
                .ok()
                .map(|(contact, _)| (entry.uid().to_string(), contact))
        })
        .collect();
    for entry in &entries {
        let due = entry.sleep_duration().as_secs();
        let contact = contacts.get(entry.uid()).map_or("?", String::as_str);
        println!(
            "{}  step={} due-in={}s contact={}",
            entry.file_name(),
            entry.step(),
            due,
            contact
        );
    }
    Ok(())
}

/// Drops every pending entry.
fn clear_queue(config_path: &str) -> Result<(), NotifygError> {
    let config = load_config(config_path.as_ref())?;
    let queue = open_queue(&config)?;
    queue.clear()
}
