//! `droidpilot run` — Carry out one automation request.

use std::io::BufRead;
use std::sync::Arc;

use droidpilot_agent::Engine;
use droidpilot_config::AppConfig;
use droidpilot_core::SessionOutcome;
use tracing::warn;

use crate::observer::TerminalObserver;

pub struct RunArgs {
    pub query: Vec<String>,
    pub device: Option<String>,
    pub max_iterations: Option<u32>,
    pub json: bool,
}

pub async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if let Some(device) = args.device {
        config.device.serial = device;
    }
    if let Some(max) = args.max_iterations {
        config.engine.max_iterations = max;
    }
    config.validate()?;

    // Check for API key early — give a clear error
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No oracle API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    DROIDPILOT_API_KEY=...   (generic)");
        eprintln!("    OPENROUTER_API_KEY=...   (recommended)");
        eprintln!("    OPENAI_API_KEY=...       (for OpenAI direct)");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_path().display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    if config.device.serial.is_empty() {
        warn!("No device serial configured; the server will pick its default device");
    }

    let query = if args.query.is_empty() {
        read_query()?
    } else {
        args.query.join(" ")
    };

    let oracle = droidpilot_oracle::from_config(&config.oracle)?;
    let engine = Arc::new(Engine::new(&config, oracle)?);
    engine.set_observer(Arc::new(TerminalObserver::new(args.json)));

    // Ctrl-C cancels the session instead of killing the process mid-call.
    let cancel_handle = Arc::clone(&engine);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  🛑 Cancelling...");
            cancel_handle.cancel();
        }
    });

    let report = engine.run_query(&query).await;
    ctrl_c.abort();
    let report = report?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        eprintln!();
        eprintln!(
            "  Session {} — {} step(s), {} call(s), {:.1}s",
            report.session_id,
            report.iterations,
            report.calls_sent,
            report.elapsed().num_milliseconds() as f64 / 1000.0
        );
        if let SessionOutcome::Completed { message } = &report.outcome {
            println!("{message}");
        }
    }

    match report.outcome {
        SessionOutcome::Completed { .. } => Ok(()),
        SessionOutcome::Failed { error } => Err(error.into()),
    }
}

fn read_query() -> Result<String, Box<dyn std::error::Error>> {
    eprint!("  What should the device do? ");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
