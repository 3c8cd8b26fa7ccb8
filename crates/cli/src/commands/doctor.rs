//! `droidpilot doctor` — Diagnose configuration and server health.

use std::time::Duration;

use droidpilot_config::AppConfig;
use droidpilot_transport::SseDecoder;
use futures::StreamExt;

/// How long to listen for the first event before giving up.
const LISTEN_WINDOW: Duration = Duration::from_secs(5);

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 DroidPilot Doctor — System Diagnostics");
    println!("========================================\n");

    let mut issues = 0;

    // Check config
    let config_path = AppConfig::config_path();
    if !config_path.exists() {
        println!("  ⚠️  No config file — run `droidpilot config init` (using defaults)");
        issues += 1;
    }

    let config = match AppConfig::load() {
        Ok(config) => {
            println!("  ✅ Configuration valid");
            config
        }
        Err(e) => {
            println!("  ❌ Config invalid: {e}");
            println!("\n  ⚠️  Cannot continue without a valid configuration.");
            return Ok(());
        }
    };

    // Check oracle
    if config.has_api_key() {
        println!("  ✅ Oracle API key configured ({})", config.oracle.model);
    } else {
        println!("  ❌ No oracle API key — set DROIDPILOT_API_KEY or oracle.api_key");
        issues += 1;
    }

    // Check device
    if config.device.serial.is_empty() {
        println!("  ⚠️  No device serial — set [device].serial or DROIDPILOT_DEVICE");
        issues += 1;
    } else {
        println!("  ✅ Device: {}", config.device.serial);
    }

    // Check the event stream
    match check_stream(&config).await {
        Ok(Some(kind)) => println!(
            "  ✅ Event stream live at {} (first event: {kind})",
            config.server.stream_url
        ),
        Ok(None) => {
            println!(
                "  ⚠️  Event stream at {} opened but sent nothing within {}s",
                config.server.stream_url,
                LISTEN_WINDOW.as_secs()
            );
            issues += 1;
        }
        Err(e) => {
            println!("  ❌ Event stream unreachable: {e}");
            issues += 1;
        }
    }

    // Summary
    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}

/// Open the stream once and report the type of the first complete event.
async fn check_stream(config: &AppConfig) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let client = droidpilot_transport::build_client(&config.server)?;
    let response = client
        .get(&config.server.stream_url)
        .header("Accept", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .timeout(LISTEN_WINDOW)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("server returned {status}").into());
    }

    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let first = tokio::time::timeout(LISTEN_WINDOW, async {
        while let Some(Ok(chunk)) = body.next().await {
            match decoder.feed(&chunk) {
                Ok(events) => {
                    if let Some(event) = events.into_iter().next() {
                        return Some(event.kind.as_str().to_string());
                    }
                }
                Err(_) => return None,
            }
        }
        None
    })
    .await;

    Ok(first.unwrap_or(None))
}
