//! Application startup: banner, configuration file, password prompt,
//! supervisor loop, clean shutdown.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};

use crate::config::{DatabaseSettings, Settings};
use crate::server;
use crate::utils::datetime::seconds_to_string;
use crate::workers::supervisor::Supervisor;

/// Load the configuration, prompt for the database password, start the
/// supervisor and the control endpoint, and run until killed.
pub fn run(config_path: &Path) -> anyhow::Result<()> {
    println!("webacquire v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load(config_path)?;
    match prompt_password(&settings.database)? {
        Some(password) => settings.database.password = password,
        None => anyhow::bail!("cancelled"),
    }

    let db_path = PathBuf::from(format!("{}.sqlite3", settings.database.name));
    let supervisor = Arc::new(Mutex::new(
        Supervisor::new(&db_path, settings.server.clone())
            .context("could not initialise the server")?,
    ));
    println!("Server is up and running.");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let http_supervisor = Arc::clone(&supervisor);
    let port = settings.server.port;
    let http_thread = std::thread::spawn(move || {
        if let Err(error) = server::run_blocking(http_supervisor, port, shutdown_rx) {
            tracing::error!(%error, "control endpoint failed");
        }
    });

    // supervisor loop at ~1 Hz
    loop {
        {
            let mut sup = match supervisor.lock() {
                Ok(sup) => sup,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !sup.is_running() {
                break;
            }
            sup.tick();
        }
        std::thread::sleep(Duration::from_secs(1));
    }

    let uptime = {
        let mut sup = match supervisor.lock() {
            Ok(sup) => sup,
            Err(poisoned) => poisoned.into_inner(),
        };
        println!("Waiting for threads...");
        sup.shutdown();
        sup.uptime_seconds()
    };

    let _ = shutdown_tx.send(true);
    let _ = http_thread.join();

    println!("Up-time: {}.", seconds_to_string(uptime));
    println!("Bye bye.");
    Ok(())
}

/// Read the database password from the terminal without echo. Backspace
/// deletes, escape cancels (returns `None`), enter submits.
fn prompt_password(db: &DatabaseSettings) -> anyhow::Result<Option<String>> {
    print!("Enter password for {}@{}:{}: ", db.user, db.host, db.port);
    std::io::stdout().flush()?;

    if crossterm::terminal::enable_raw_mode().is_err() {
        // not a terminal: fall back to a plain line read
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        return Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()));
    }

    let mut password = String::new();
    let mut cancelled = false;
    loop {
        match event::read()? {
            Event::Key(key) if key.kind == KeyEventKind::Press => match key.code {
                KeyCode::Enter => break,
                KeyCode::Esc => {
                    cancelled = true;
                    break;
                }
                KeyCode::Backspace | KeyCode::Delete => {
                    password.pop();
                }
                KeyCode::Char(c) => password.push(c),
                _ => {}
            },
            _ => {}
        }
    }
    crossterm::terminal::disable_raw_mode()?;
    println!();

    Ok(if cancelled { None } else { Some(password) })
}
