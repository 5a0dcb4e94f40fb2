//! `freightsync` - CLI for the freightsync offline sync engine
//!
//! This binary records route data locally, inspects the operation queue and
//! runs the sync worker.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;

use freightsync::api::{Credentials, Registration};
use freightsync::cli::{
    AuthCommand, Cli, Command, CompanyCommand, ConfigCommand, ListCommand, OfflineCommand,
    PageCommand, QueueCommand, RouteCommand, SyncCommand,
};
use freightsync::managers::{FinishRoute, NewRoutePage, StartRoute};
use freightsync::{init_logging, App, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Config commands must work even when the file is broken.
    if let Command::Config(config_cmd) = cli.command {
        return handle_config(cli.config, config_cmd);
    }

    let config = Config::load_from(cli.config.clone()).context("failed to load configuration")?;
    let app = App::build(config).context("failed to start freightsync")?;

    match cli.command {
        Command::Status(status_cmd) => handle_status(&app, status_cmd.json).await,
        Command::Sync(sync_cmd) => handle_sync(&app, sync_cmd).await,
        Command::Queue(queue_cmd) => handle_queue(&app, queue_cmd),
        Command::Download => handle_download(&app).await,
        Command::Offline(offline_cmd) => handle_offline(&app, offline_cmd).await,
        Command::Auth(auth_cmd) => handle_auth(&app, auth_cmd).await,
        Command::Company(company_cmd) => handle_company(&app, company_cmd).await,
        Command::Trucks(ListCommand::List { json }) => {
            app.network().refresh().await;
            let trucks = app.managers().trucks.get_trucks().await;
            print_rows(&trucks, json, |t| {
                format!(
                    "{:<8} {:<12} {}",
                    t.id,
                    t.registration_number,
                    t.model.as_deref().unwrap_or("-")
                )
            })
        }
        Command::Objects(ListCommand::List { json }) => {
            app.network().refresh().await;
            let objects = app.managers().truck_objects.get_truck_objects().await;
            print_rows(&objects, json, |o| {
                format!(
                    "{:<8} {:<24} {}",
                    o.id,
                    o.name,
                    o.address.as_deref().unwrap_or("-")
                )
            })
        }
        Command::Pages(page_cmd) => handle_pages(&app, page_cmd).await,
        Command::Routes(route_cmd) => handle_routes(&app, route_cmd).await,
        Command::Config(_) => Ok(()),
    }
}

async fn handle_status(app: &App, json: bool) -> anyhow::Result<()> {
    app.network().refresh().await;
    let status = app.status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("freightsync status");
    println!("------------------");
    println!("Platform:      {}", status.platform);
    println!("Store:         {}", status.store);
    println!("Network:       {}", status.network);
    println!(
        "Queue:         {} pending, {} syncing, {} failed, {} completed",
        status.queue.pending, status.queue.syncing, status.queue.failed, status.queue.completed
    );
    if let Some(oldest) = status.queue.oldest_pending {
        println!("Oldest:        {}", oldest.to_rfc3339());
    }
    println!(
        "Last sync:     {}",
        status.last_sync_at.as_deref().unwrap_or("never")
    );
    println!(
        "Last download: {}",
        status.last_download_at.as_deref().unwrap_or("never")
    );
    match status.user {
        Some(user) => println!(
            "User:          {} <{}>",
            user.name.as_deref().unwrap_or("-"),
            user.email
        ),
        None => println!("User:          not signed in"),
    }
    Ok(())
}

async fn handle_sync(app: &App, cmd: SyncCommand) -> anyhow::Result<()> {
    match cmd {
        SyncCommand::Run { once: true } => {
            let report = app.sync_once().await?;
            println!("Sync pass: {report}");
            if let Some(wait) = report.next_retry_in {
                println!("Next retry in {}s", wait.as_secs());
            }
        }
        SyncCommand::Run { once: false } => {
            app.network().refresh().await;
            let services = app.start();
            app.worker().trigger();
            println!("Sync worker running. Press Ctrl-C to stop.");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            services.shutdown().await;
        }
    }
    Ok(())
}

fn handle_queue(app: &App, cmd: QueueCommand) -> anyhow::Result<()> {
    let queue = app.queue();
    match cmd {
        QueueCommand::Stats { json } => {
            let stats = queue.stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Pending:   {}", stats.pending);
                println!("Syncing:   {}", stats.syncing);
                println!("Failed:    {}", stats.failed);
                println!("Completed: {}", stats.completed);
                println!("Total:     {}", stats.total());
            }
        }
        QueueCommand::List { status, limit, json } => {
            let ops = queue.list(status.map(Into::into), limit)?;
            print_rows(&ops, json, |op| {
                format!(
                    "{}  {:<9} {:<6} {:<24} retries={} {}",
                    op.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    op.status,
                    op.op_type,
                    op.endpoint,
                    op.retry_count,
                    op.last_error.as_deref().unwrap_or("")
                )
            })?;
        }
        QueueCommand::Retry => {
            let count = queue.retry_failed()?;
            println!("Re-armed {count} failed operations.");
        }
        QueueCommand::Purge { hours } => {
            let retention = hours.map_or_else(
                || app.config().completed_retention(),
                |h| Duration::from_secs(h * 60 * 60),
            );
            let count = queue.purge_completed(retention)?;
            println!("Purged {count} completed operations.");
        }
    }
    Ok(())
}

async fn handle_download(app: &App) -> anyhow::Result<()> {
    app.network().refresh().await;
    let summary = app.managers().download_all().await?;
    println!("Trucks:        {}", summary.trucks);
    println!("Truck objects: {}", summary.truck_objects);
    println!("Route pages:   {}", summary.route_pages);
    Ok(())
}

async fn handle_offline(app: &App, cmd: OfflineCommand) -> anyhow::Result<()> {
    let state = match cmd {
        OfflineCommand::On => app.set_forced_offline(true).await?,
        OfflineCommand::Off => app.set_forced_offline(false).await?,
        OfflineCommand::Status => app.network().refresh().await,
    };
    println!("Network: {state}");
    Ok(())
}

async fn handle_auth(app: &App, cmd: AuthCommand) -> anyhow::Result<()> {
    let auth = app.auth();
    match cmd {
        AuthCommand::Logout => {
            auth.logout()?;
            println!("Signed out.");
            return Ok(());
        }
        AuthCommand::Whoami => {
            match app.session().current().and_then(|s| s.user) {
                Some(user) => println!(
                    "{} <{}> ({})",
                    user.name.as_deref().unwrap_or("-"),
                    user.email,
                    user.company_code.as_deref().unwrap_or("no company")
                ),
                None => println!("Not signed in."),
            }
            return Ok(());
        }
        _ => {}
    }

    app.network().refresh().await;
    app.network().require_online()?;

    match cmd {
        AuthCommand::Login { email, password } => {
            let session = auth.login(&Credentials { email, password }).await?;
            match session.user {
                Some(user) => println!("Signed in as {}.", user.email),
                None => println!("Signed in."),
            }
        }
        AuthCommand::Register {
            email,
            password,
            name,
            company,
        } => {
            let registration = Registration {
                email,
                password,
                name,
                company_code: company,
            };
            match auth.register(&registration).await? {
                Some(_) => println!("Account created and signed in."),
                None => println!("Account created. Sign in to continue."),
            }
        }
        AuthCommand::Refresh => {
            let session = auth.refresh().await?;
            match session.expires_at {
                Some(at) => println!("Token renewed until {}.", at.to_rfc3339()),
                None => println!("Token renewed."),
            }
        }
        AuthCommand::Logout | AuthCommand::Whoami => {}
    }
    Ok(())
}

async fn handle_company(app: &App, cmd: CompanyCommand) -> anyhow::Result<()> {
    app.network().refresh().await;
    app.network().require_online()?;
    match cmd {
        CompanyCommand::Check { code } => {
            if app.companies().exists(&code).await? {
                println!("Company {code} exists.");
            } else {
                println!("Company {code} not found.");
            }
        }
    }
    Ok(())
}

async fn handle_pages(app: &App, cmd: PageCommand) -> anyhow::Result<()> {
    let pages = &app.managers().route_pages;
    match cmd {
        PageCommand::List { json } => {
            app.network().refresh().await;
            let rows = pages.get_route_pages().await;
            print_rows(&rows, json, |p| {
                format!(
                    "{:<40} truck={:<8} {}..{} fuel {:.1} -> {:.1} length {}",
                    p.id,
                    p.truck_id,
                    p.date_from,
                    p.date_to,
                    p.fuel_balance_start,
                    p.fuel_balance_end,
                    p.computed_route_length
                )
            })?;
        }
        PageCommand::Show { id } => {
            app.network().refresh().await;
            match pages.get_route_page(&id).await {
                Some(page) => println!("{}", serde_json::to_string_pretty(&page)?),
                None => println!("Route page {id} not found."),
            }
        }
        PageCommand::Create {
            truck,
            from,
            to,
            fuel,
            odometer,
        } => {
            let page = pages.create_route_page(NewRoutePage {
                truck_id: truck,
                date_from: from,
                date_to: to,
                fuel_balance_start: fuel,
                odometer_start: odometer,
            })?;
            println!("Created route page {}.", page.id);
        }
        PageCommand::Delete { id } => {
            pages.delete_route_page(&id)?;
            println!("Deleted route page {id}.");
        }
    }
    Ok(())
}

async fn handle_routes(app: &App, cmd: RouteCommand) -> anyhow::Result<()> {
    let routes = &app.managers().routes;
    match cmd {
        RouteCommand::List { page, json } => {
            app.network().refresh().await;
            let rows = routes.get_routes(&page).await;
            print_rows(&rows, json, |r| {
                let finish = r
                    .odometer_finish
                    .map_or_else(|| "active".to_string(), |f| f.to_string());
                format!(
                    "{:<40} {} -> {} km {}..{} fuel -{:.1} +{:.1}",
                    r.id,
                    r.object_from_id.as_deref().unwrap_or("?"),
                    r.object_to_id.as_deref().unwrap_or("?"),
                    r.odometer_start,
                    finish,
                    r.fuel_consumed,
                    r.fuel_received
                )
            })?;
        }
        RouteCommand::Start {
            page,
            odometer,
            from,
            to,
            fuel_received,
        } => {
            let route = routes.start_route(StartRoute {
                route_page_id: page,
                object_from_id: from,
                object_to_id: to,
                odometer_start: odometer,
                fuel_received,
            })?;
            println!("Started route {} for truck {}.", route.id, route.truck_id);
        }
        RouteCommand::Finish {
            id,
            odometer,
            fuel_consumed,
            fuel_received,
            to,
        } => {
            let route = routes.finish_route(
                &id,
                FinishRoute {
                    odometer_finish: odometer,
                    fuel_consumed,
                    fuel_received,
                    object_to_id: to,
                },
            )?;
            println!(
                "Finished route {} ({} km).",
                route.id,
                route.length().unwrap_or_default()
            );
        }
        RouteCommand::Delete { id } => {
            routes.delete_route(&id)?;
            println!("Deleted route {id}.");
        }
    }
    Ok(())
}

fn handle_config(path: Option<std::path::PathBuf>, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            let config = Config::load_from(path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[API]");
                println!("  Base URL:           {}", config.api.base_url);
                println!("  Timeout (s):        {}", config.api.timeout_secs);
                println!("  Probe path:         {}", config.api.probe_path);
                println!();
                println!("[Sync]");
                println!("  Batch size:         {}", config.sync.batch_size);
                println!("  Max retries:        {}", config.sync.max_retries);
                println!(
                    "  Backoff (ms):       {}..{}",
                    config.sync.base_delay_ms, config.sync.max_delay_ms
                );
                println!("  Interval (s):       {}", config.sync.interval_secs);
                println!();
                println!("[Storage]");
                println!("  Platform:           {}", config.storage.platform);
                println!("  Database path:      {}", config.database_path().display());
                println!("  Key-value path:     {}", config.kv_path().display());
                println!();
                println!("[Network]");
                println!("  Probe interval (s): {}", config.network.probe_interval_secs);
                println!("  Forced offline:     {}", config.network.forced_offline);
                println!();
                println!("[Session]");
                println!("  Path:               {}", config.session_path().display());
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.or(path).unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}

fn print_rows<T: Serialize>(
    rows: &[T],
    json: bool,
    line: impl Fn(&T) -> String,
) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(rows)?);
    } else if rows.is_empty() {
        println!("Nothing to show.");
    } else {
        for row in rows {
            println!("{}", line(row));
        }
    }
    Ok(())
}
