//! Command execution.

use crate::Commands;
use colored::Colorize;
use printlink_client::{CancellationToken, Client, ClientError, Subscription};
use serde::Serialize;

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::WatchState | Commands::WatchProgress => {
            Err("watch commands stream records; run them with `watch`".into())
        }

        Commands::Info => {
            let info = client.get_printer_info().await?;
            format_record("Printer", info.success, &info)
        }

        Commands::State => {
            let state = client.get_state().await?;
            format_record("State", state.success, &state)
        }

        Commands::GetZOffset => {
            let record = client.get_z_offset().await?;
            format_record("Z offset", record.success, &record)
        }

        Commands::SetZOffset { value } => {
            let record = client.set_z_offset(value).await?;
            format_record("Z offset", record.success, &record)
        }

        Commands::Gcode { lines } => {
            let count = lines.len();
            let record = client.execute_gcode(lines).await?;
            if record.success {
                Ok(format!("{} {} G-code lines", "Executed".green(), count))
            } else {
                Ok(unexpected("G-code"))
            }
        }

        Commands::Upload { path } => {
            let record = client.upload_gcode_file(&path).await?;
            match (record.success, record.message) {
                (true, _) => Ok(format!(
                    "{} {}",
                    "Uploaded".green(),
                    path.display().to_string().cyan()
                )),
                (false, Some(message)) => Ok(format!("{}: {}", "Upload failed".red(), message)),
                (false, None) => Ok(unexpected("Upload")),
            }
        }

        Commands::Start { name } => {
            let record = client.start_print(&name).await?;
            if !record.success {
                Ok(unexpected("Start"))
            } else if record.started {
                Ok(format!("{} {}", "Printing".green(), record.file_name.cyan()))
            } else {
                Ok(format!(
                    "{}: printer refused to start {}",
                    "Warning".yellow(),
                    record.file_name.cyan()
                ))
            }
        }

        Commands::Stop => {
            let record = client.stop_print().await?;
            if record.success {
                Ok("Stopped".green().to_string())
            } else {
                Ok(unexpected("Stop"))
            }
        }

        Commands::SetPosition { x, y, z } => {
            let record = client.set_current_position(x, y, z).await?;
            format_record("Position", record.success, &record)
        }
    }
}

/// Prints every record from `subscription` as a JSON line until Ctrl+C.
pub async fn watch<R: Serialize + Send + 'static>(
    mut subscription: Subscription<R>,
    token: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    loop {
        tokio::select! {
            record = subscription.recv() => match record {
                Ok(record) => println!("{}", serde_json::to_string(&record)?),
                Err(ClientError::Cancelled) => break,
                Err(e) => return Err(e.into()),
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping watch...".dimmed());
                token.cancel();
            }
        }
    }
    Ok(())
}

fn format_record<R: Serialize>(
    label: &str,
    success: bool,
    record: &R,
) -> Result<String, Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(record)?;
    if success {
        Ok(format!("{}\n{}", label.bold(), json))
    } else {
        Ok(format!("{}\n{}", unexpected(label), json))
    }
}

fn unexpected(label: &str) -> String {
    format!("{}: unexpected reply", label.yellow())
}
