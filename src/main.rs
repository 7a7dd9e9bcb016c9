use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use git_version::git_version;
use slog::*;
use sqlx::migrate::Migrate;
use sqlx::prelude::*;
use structopt::StructOpt;

mod aggregator;
mod anomaly;
mod classifier;
mod detection_log;
mod firewall;
mod gateway;
mod observer;
mod packet_parser;
mod policy;
mod resolver;
mod session;

#[derive(Debug, StructOpt)]
#[structopt(name = "warden", about = "A captive-portal hotspot access controller.")]
struct Opt {
    /// The path of the configuration file.
    #[structopt(
        short = "c",
        long = "config",
        default_value = "/etc/warden/config.yml"
    )]
    config: std::path::PathBuf,

    /// Run pending schema migrations against the local database
    #[structopt(long = "db-upgrade")]
    migrate: bool,

    /// The path of the directory containing database migration files.
    #[structopt(
        long = "db-migration-directory",
        default_value = "/usr/share/warden/migrations"
    )]
    migration_directory: std::path::PathBuf,

    /// Override the configured hotspot-side interface.
    #[structopt(long = "iface-hotspot")]
    iface_hotspot: Option<String>,

    /// Override the configured uplink interface.
    #[structopt(long = "iface-uplink")]
    iface_uplink: Option<String>,

    /// Show debug log information
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,

    #[structopt(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Reconcile the kernel filter with the stored policy once and exit.
    #[structopt(name = "policy-sync")]
    PolicySync,
    /// Probe active sessions and retire unreachable ones.
    #[structopt(name = "session-sweep")]
    SessionSweep,
    /// Transition lapsed temporary bans to expired.
    #[structopt(name = "ban-sweep")]
    BanSweep,
    /// Re-resolve blocked hostnames and rewrite the deny layer on change.
    #[structopt(name = "refresh-ips")]
    RefreshIps,
    /// Tear down every installed rule and rebuild the known-good baseline,
    /// restoring allowances for sessions that are still active.
    #[structopt(name = "reset-all")]
    ResetAll,
}

mod config {
    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Version {
        pub version: Option<i16>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct V1 {
        pub hotspot_interface: String,
        pub uplink_interface: String,
        pub hotspot_subnet: String,
        pub bind_address: String,
        pub portal_port: u16,
        pub resolver_address: String,
        pub ignored_addresses: Vec<String>,
        #[serde(with = "humantime_serde")]
        pub detection_flush_interval: std::time::Duration,
        #[serde(with = "humantime_serde")]
        pub aggregation_window: std::time::Duration,
        #[serde(with = "humantime_serde")]
        pub anomaly_interval: std::time::Duration,
        #[serde(with = "humantime_serde")]
        pub liveness_sweep_interval: std::time::Duration,
        #[serde(with = "humantime_serde")]
        pub ip_refresh_interval: std::time::Duration,
        #[serde(with = "humantime_serde")]
        pub ban_sweep_interval: std::time::Duration,
        #[serde(with = "humantime_serde")]
        pub command_timeout: std::time::Duration,
        #[serde(with = "humantime_serde")]
        pub detection_retention: std::time::Duration,
        pub model_seed: u64,
        pub token_secret: String,
        pub custom: V1Custom,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct V1Custom {
        pub db_location: String,
        pub db_user: String,
        pub db_pass: String,
    }

    // An internal configuration structure used by the rest of the program
    // that can be updated without breaking compatibility with existing
    // configuration files.
    #[derive(Debug)]
    pub struct Internal {
        pub db_name: String,
        pub db_user: String,
        pub db_pass: String,
        pub hotspot_interface: String,
        pub uplink_interface: String,
        pub hotspot_subnet: ipnetwork::IpNetwork,
        pub bind_address: std::net::IpAddr,
        pub portal_port: u16,
        pub resolver_address: std::net::SocketAddr,
        pub ignored_addresses: std::collections::HashSet<std::net::IpAddr>,
        pub detection_flush_interval: std::time::Duration,
        pub aggregation_window: chrono::Duration,
        pub anomaly_interval: std::time::Duration,
        pub liveness_sweep_interval: std::time::Duration,
        pub ip_refresh_interval: std::time::Duration,
        pub ban_sweep_interval: std::time::Duration,
        pub command_timeout: std::time::Duration,
        pub detection_retention: chrono::Duration,
        pub model_seed: u64,
        pub token_secret: String,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Find and store build version information
    const GIT_VERSION: &str = git_version!(
        args = ["--long", "--all", "--always", "--dirty=-modified"],
        fallback = "unknown"
    );

    // Parse input arguments
    let opt = Opt::from_args();

    // Setup slog terminal logging
    let log_decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::CompactFormat::new(log_decorator).build().fuse();

    let mut log_level = Level::Info;
    if opt.verbose {
        log_level = Level::Debug;
    }

    let drain = slog::LevelFilter::new(drain, log_level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    let root_log = slog::Logger::root(
        drain.fuse(),
        slog::o!("build" => GIT_VERSION,
        "pkg-version" => env!("CARGO_PKG_VERSION"),
        ),
    );

    slog::info!(root_log, "Arguments {:?}", opt);

    // Read the configuration file
    let config_string = std::fs::read_to_string(&opt.config)
        .with_context(|| format!("Failed to read config file {}", opt.config.display()))?;
    let parsed_config_version: config::Version = serde_yaml::from_str(&config_string)
        .context("Failed to extract version from config file")?;
    slog::debug!(
        root_log,
        "Parsed the config version {:?}",
        parsed_config_version
    );
    let config_version = parsed_config_version.version.unwrap_or(1);

    let config = match config_version {
        1 => {
            let parsed_config: config::V1 =
                serde_yaml::from_str(&config_string).context("Failed to parse config")?;
            slog::debug!(root_log, "Parsed config {:?}", parsed_config);
            config::Internal {
                db_name: parsed_config.custom.db_location,
                db_user: parsed_config.custom.db_user,
                db_pass: parsed_config.custom.db_pass,
                hotspot_interface: parsed_config.hotspot_interface,
                uplink_interface: parsed_config.uplink_interface,
                hotspot_subnet: ipnetwork::IpNetwork::from_str(&parsed_config.hotspot_subnet)
                    .context("Failed to parse configured hotspot subnet")?,
                bind_address: std::net::IpAddr::from_str(&parsed_config.bind_address)
                    .context("Failed to parse configured bind address")?,
                portal_port: parsed_config.portal_port,
                resolver_address: std::net::SocketAddr::from_str(&parsed_config.resolver_address)
                    .context("Failed to parse configured resolver address")?,
                ignored_addresses: parsed_config
                    .ignored_addresses
                    .iter()
                    .map(|a| std::net::IpAddr::from_str(a))
                    .collect::<std::result::Result<HashSet<_>, _>>()
                    .context("Failed to parse configured IP address")?,
                detection_flush_interval: parsed_config.detection_flush_interval,
                aggregation_window: chrono::Duration::from_std(parsed_config.aggregation_window)
                    .context("Aggregation window out of range")?,
                anomaly_interval: parsed_config.anomaly_interval,
                liveness_sweep_interval: parsed_config.liveness_sweep_interval,
                ip_refresh_interval: parsed_config.ip_refresh_interval,
                ban_sweep_interval: parsed_config.ban_sweep_interval,
                command_timeout: parsed_config.command_timeout,
                detection_retention: chrono::Duration::from_std(
                    parsed_config.detection_retention,
                )
                .context("Detection retention out of range")?,
                model_seed: parsed_config.model_seed,
                token_secret: parsed_config.token_secret,
            }
        }
        _ => {
            slog::error!(
                root_log,
                "Unsupported configuration version '{}' specified",
                config_version
            );
            anyhow::bail!("Unsupported configuration version {} specified", config_version);
        }
    };

    let mut config = config;
    if let Some(iface) = &opt.iface_hotspot {
        config.hotspot_interface = iface.clone();
    }
    if let Some(iface) = &opt.iface_uplink {
        config.uplink_interface = iface.clone();
    }
    let config = Arc::new(config);

    // Connect to backing storage database
    let db_string = format!(
        "postgres://{}:{}@localhost/{}",
        config.db_user, config.db_pass, config.db_name
    );

    // TODO(matt9j) Temporary workaround to set all transactions to serializable
    // until sqlx supports per-transaction isolation settings.
    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .after_connect(|conn| {
            Box::pin(async move {
                conn.execute("SET default_transaction_isolation TO 'serializable'")
                    .await?;
                Ok(())
            })
        })
        .connect(&db_string);

    let db_pool = tokio::time::timeout(std::time::Duration::from_secs(5), db_pool)
        .await
        .context("DB connection timed out")?
        .context("Failed to connect to the database")?;
    slog::info!(
        root_log,
        "Connected to database db={} user={}",
        config.db_name,
        config.db_user
    );
    let db_pool = Arc::new(db_pool);

    let mut migrator = sqlx::migrate::Migrator::new(opt.migration_directory.as_path())
        .await
        .context("Unable to read available database schema migrations")?;

    // If requested, run any necessary database migrations
    if opt.migrate {
        slog::warn!(
            root_log,
            "Running database migrations, this process can not be easily undone!"
        );
        migrator.set_ignore_missing(true);
        migrator
            .run(db_pool.as_ref())
            .await
            .context("Failed to run database migrations")?;
        slog::info!(root_log, "Migrations complete, exiting warden.");

        return Ok(());
    }

    // Get a set of available migrations and a set of applied migrations
    let available_migrations: HashSet<_> = migrator.iter().map(|x| x.version).collect();
    let mut migration_conn = db_pool
        .as_ref()
        .acquire()
        .await
        .context("Unable to acquire DB connection")?;
    let applied_migrations: HashSet<_> = migration_conn
        .list_applied_migrations()
        .await
        .context("Unable to query the applied DB schema migrations")?
        .iter()
        .map(|x| x.version)
        .collect();
    drop(migration_conn);

    if available_migrations != applied_migrations {
        slog::error!(
            root_log,
            "There is a difference between the expected set of DB schema migrations for this version of warden \
            and the migrations applied to the configured database."
        );
        let unapplied_migrations: HashSet<_> = available_migrations
            .difference(&applied_migrations)
            .collect();
        let extra_migrations: HashSet<_> = applied_migrations
            .difference(&available_migrations)
            .collect();

        if unapplied_migrations.len() != 0 {
            slog::error!(
                root_log,
                "The following migrations are expected by this version of warden, but not applied to the local database";
                "unapplied_migrations" => format!("{:?}", unapplied_migrations)
            );
            if extra_migrations.len() == 0 {
                slog::error!(
                    root_log,
                    "You can upgrade your database schema to be compatible with this version of warden by manually running `warden --db-upgrade`"
                );
                slog::error!(
                    root_log,
                    "***BE SURE TO BACK UP YOUR DATABASE BEFORE UPGRADING*** The upgrade operation cannot be easily undone."
                );
            }
        }

        if extra_migrations.len() != 0 {
            slog::error!(
                root_log,
                "The following migrations are present in your database but unknown to this version of warden!\n\
                This cannot be fixed automatically, and you may need to re-create your database from scratch :/";
                "extra_migrations" => format!("{:?}", extra_migrations)
            );
        }
        anyhow::bail!("Cannot proceed without correcting the database schema.");
    }

    // Create the core control-plane subsystems.
    let name_resolver = resolver::Resolver::new(
        config.resolver_address,
        config.command_timeout,
        root_log.new(o!("subsystem" => "resolver")),
    );
    let filter = Arc::new(firewall::Iptables::new(
        firewall::FirewallConfig {
            hotspot_interface: config.hotspot_interface.clone(),
            uplink_interface: config.uplink_interface.clone(),
            portal_port: config.portal_port,
            command_timeout: config.command_timeout,
        },
        name_resolver,
        root_log.new(o!("subsystem" => "firewall")),
    ));
    let sessions = session::SessionStore::new(
        db_pool.clone(),
        root_log.new(o!("subsystem" => "sessions")),
    );
    let policy_store = policy::PolicyStore::new(
        db_pool.clone(),
        root_log.new(o!("subsystem" => "policy")),
    );
    let user_aggregator = aggregator::Aggregator::new(
        db_pool.clone(),
        root_log.new(o!("subsystem" => "aggregator")),
    );

    // Ancillary one-shot modes run a single pass and exit.
    if let Some(command) = &opt.command {
        let exit_code = run_one_shot(
            command,
            &config,
            &filter,
            &sessions,
            &policy_store,
            &root_log,
        )
        .await;
        std::process::exit(exit_code);
    }

    // Bring up the data plane before anything can be observed or allowed.
    if let Err(e) = filter.install_base().await {
        slog::crit!(root_log, "Failed to install base filter state"; "error" => e.to_string());
        std::process::exit(1);
    }
    let initial_policy = policy_store
        .snapshot()
        .await
        .context("Unable to load filtering policy")?;
    if let Err(e) = filter.sync_policy(initial_policy.clone()).await {
        // install_base already left FORWARD defaulting to drop, which is
        // the safe state to die in.
        slog::crit!(root_log, "Failed to synchronize filtering policy"; "error" => e.to_string());
        std::process::exit(1);
    }

    // Re-install allowances for sessions that survived a restart.
    match sessions.all_active_ips().await {
        Ok(active_ips) => {
            for ip in active_ips {
                if let Err(e) = filter.allow_client(ip).await {
                    slog::error!(root_log, "Failed to restore session allowance";
                        "ip" => ip.to_string(), "error" => e.to_string());
                }
            }
        }
        Err(e) => {
            slog::error!(root_log, "Unable to query sessions for restore"; "error" => e.to_string());
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Observation pipeline: capture thread feeds the detection writer.
    let (observation_tx, observation_rx) = tokio::sync::mpsc::channel(1024);
    let detections = detection_log::DetectionLog::new(
        observation_rx,
        config.detection_flush_interval,
        config.detection_retention,
        db_pool.clone(),
        sessions.clone(),
        shutdown_rx.clone(),
        root_log.new(o!("subsystem" => "detections")),
    );

    let hostname_observer = observer::Observer::new(
        &config.hotspot_interface,
        config.hotspot_subnet,
        config.ignored_addresses.clone(),
        root_log.new(o!("subsystem" => "observer")),
    )
    .context("Failed to initialize packet observer")?;
    let observer_shutdown = shutdown_rx.clone();
    let observer_log = root_log.new(o!("subsystem" => "observer"));
    tokio::task::spawn_blocking(move || {
        if let Err(e) = hostname_observer.run(observation_tx, observer_shutdown) {
            slog::crit!(observer_log, "Packet observer failed"; "error" => e.to_string());
            std::process::exit(1);
        }
    });

    // Anomaly engine on its fixed cadence.
    let engine = anomaly::AnomalyEngine::new(
        user_aggregator,
        policy_store.clone(),
        sessions.clone(),
        Arc::clone(&filter),
        db_pool.clone(),
        &initial_policy.thresholds,
        config.aggregation_window,
        config.model_seed,
        root_log.new(o!("subsystem" => "anomaly")),
    );
    if engine.is_degraded() {
        slog::warn!(root_log, "Anomaly engine running rule-only, no model available");
    }
    let engine_log = root_log.new(o!("subsystem" => "anomaly"));
    let engine_interval = config.anomaly_interval;
    let mut engine_shutdown = shutdown_rx.clone();
    tokio::task::spawn(async move {
        let mut timer = tokio::time::interval_at(
            tokio::time::Instant::now() + engine_interval,
            engine_interval,
        );
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = engine.run_cycle().await {
                        slog::error!(engine_log, "anomaly cycle failed"; "error" => e.to_string());
                    }
                }
                _ = engine_shutdown.changed() => break,
            }
        }
    });

    // Liveness sweep.
    let sweep_sessions = sessions.clone();
    let sweep_filter = Arc::clone(&filter);
    let sweep_log = root_log.new(o!("subsystem" => "liveness"));
    let sweep_interval = config.liveness_sweep_interval;
    let probe_timeout = config.command_timeout;
    let mut sweep_shutdown = shutdown_rx.clone();
    tokio::task::spawn(async move {
        let prober = session::PingProber {
            timeout: probe_timeout,
        };
        let mut timer = tokio::time::interval_at(
            tokio::time::Instant::now() + sweep_interval,
            sweep_interval,
        );
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = sweep_sessions.sweep_liveness(&prober, &sweep_filter).await {
                        slog::error!(sweep_log, "liveness sweep failed"; "error" => e.to_string());
                    }
                }
                _ = sweep_shutdown.changed() => break,
            }
        }
    });

    // Ban expiry sweep.
    let expiry_sessions = sessions.clone();
    let expiry_log = root_log.new(o!("subsystem" => "bans"));
    let expiry_interval = config.ban_sweep_interval;
    let mut expiry_shutdown = shutdown_rx.clone();
    tokio::task::spawn(async move {
        let mut timer = tokio::time::interval_at(
            tokio::time::Instant::now() + expiry_interval,
            expiry_interval,
        );
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = expiry_sessions.expire_bans().await {
                        slog::error!(expiry_log, "ban expiry sweep failed"; "error" => e.to_string());
                    }
                }
                _ = expiry_shutdown.changed() => break,
            }
        }
    });

    // Periodic re-resolution of blocked hostnames.
    let refresh_filter = Arc::clone(&filter);
    let refresh_policy = policy_store.clone();
    let refresh_log = root_log.new(o!("subsystem" => "ip-refresh"));
    let refresh_interval = config.ip_refresh_interval;
    let mut refresh_shutdown = shutdown_rx.clone();
    tokio::task::spawn(async move {
        let mut timer = tokio::time::interval_at(
            tokio::time::Instant::now() + refresh_interval,
            refresh_interval,
        );
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match refresh_policy.snapshot().await {
                        Ok(current) => {
                            if let Err(e) = refresh_filter.refresh_ips(current).await {
                                slog::error!(refresh_log, "ip refresh failed"; "error" => e.to_string());
                            }
                        }
                        Err(e) => {
                            slog::error!(refresh_log, "unable to read policy for refresh"; "error" => e.to_string());
                        }
                    }
                }
                _ = refresh_shutdown.changed() => break,
            }
        }
    });

    // The portal and admin HTTP surface.
    let gateway_state = gateway::AppState {
        sessions: sessions.clone(),
        firewall: Arc::clone(&filter),
        policy: policy_store.clone(),
        token_secret: config.token_secret.clone(),
        log: root_log.new(o!("subsystem" => "gateway")),
    };
    let bind_addr = std::net::SocketAddr::new(config.bind_address, config.portal_port);
    let gateway_shutdown = shutdown_rx.clone();
    let gateway_log = root_log.new(o!("subsystem" => "gateway"));
    tokio::task::spawn(async move {
        if let Err(e) = gateway::serve(gateway_state, bind_addr, gateway_shutdown).await {
            slog::crit!(gateway_log, "gateway server failed"; "error" => e.to_string());
            std::process::exit(1);
        }
    });

    // Run until interrupted, then give tasks a grace period to flush.
    tokio::signal::ctrl_c()
        .await
        .context("Unable to listen for the shutdown signal")?;
    slog::info!(root_log, "Shutdown signal received, flushing in-flight work");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    slog::info!(root_log, "Shutdown complete";
        "dropped_detection_batches" => detections.dropped_batches());
    Ok(())
}

async fn run_one_shot(
    command: &Command,
    config: &config::Internal,
    filter: &firewall::Iptables,
    sessions: &session::SessionStore,
    policy_store: &policy::PolicyStore,
    log: &slog::Logger,
) -> i32 {
    match command {
        Command::PolicySync => {
            if let Err(e) = filter.install_base().await {
                slog::crit!(log, "Failed to install base filter state"; "error" => e.to_string());
                return 1;
            }
            let current = match policy_store.snapshot().await {
                Ok(current) => current,
                Err(e) => {
                    slog::crit!(log, "Unable to load filtering policy"; "error" => e.to_string());
                    return 1;
                }
            };
            match filter.sync_policy(current).await {
                Ok(()) => {
                    slog::info!(log, "Policy synchronized");
                    0
                }
                Err(e) => {
                    slog::crit!(log, "Policy sync failed"; "error" => e.to_string());
                    1
                }
            }
        }
        Command::SessionSweep => {
            let prober = session::PingProber {
                timeout: config.command_timeout,
            };
            match sessions.sweep_liveness(&prober, filter).await {
                Ok(swept) => {
                    slog::info!(log, "Liveness sweep complete"; "swept" => swept);
                    0
                }
                Err(e) => {
                    slog::crit!(log, "Liveness sweep failed"; "error" => e.to_string());
                    1
                }
            }
        }
        Command::BanSweep => match sessions.expire_bans().await {
            Ok(expired) => {
                slog::info!(log, "Ban sweep complete"; "expired" => expired);
                0
            }
            Err(e) => {
                slog::crit!(log, "Ban sweep failed"; "error" => e.to_string());
                1
            }
        },
        Command::RefreshIps => {
            let current = match policy_store.snapshot().await {
                Ok(current) => current,
                Err(e) => {
                    slog::crit!(log, "Unable to load filtering policy"; "error" => e.to_string());
                    return 1;
                }
            };
            match filter.refresh_ips(current).await {
                Ok(rewritten) => {
                    slog::info!(log, "IP refresh complete"; "rewritten" => rewritten);
                    0
                }
                Err(e) => {
                    slog::crit!(log, "IP refresh failed"; "error" => e.to_string());
                    1
                }
            }
        }
        Command::ResetAll => {
            if let Err(e) = filter.reset_all().await {
                slog::crit!(log, "Filter reset failed"; "error" => e.to_string());
                return 1;
            }
            // The rebuilt deny layer starts from an empty resolution table;
            // re-populate it from the stored policy.
            let current = match policy_store.snapshot().await {
                Ok(current) => current,
                Err(e) => {
                    slog::crit!(log, "Unable to load filtering policy"; "error" => e.to_string());
                    return 1;
                }
            };
            if let Err(e) = filter.sync_policy(current).await {
                slog::crit!(log, "Policy sync failed after reset"; "error" => e.to_string());
                return 1;
            }
            // Reset dropped every per-client allowance; restore the ones
            // the session store still vouches for.
            match sessions.all_active_ips().await {
                Ok(active_ips) => {
                    for ip in active_ips {
                        if let Err(e) = filter.allow_client(ip).await {
                            slog::error!(log, "Failed to restore session allowance";
                                "ip" => ip.to_string(), "error" => e.to_string());
                        }
                    }
                }
                Err(e) => {
                    slog::crit!(log, "Unable to query sessions for restore"; "error" => e.to_string());
                    return 1;
                }
            }
            slog::info!(log, "Filter state reset to baseline");
            0
        }
    }
}
