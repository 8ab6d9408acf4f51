//! Command-line front end for the navigation engine.
//!
//! Usage:
//!   sonar-nav [--config <path>] locate [--ppi]
//!   sonar-nav [--config <path>] heading
//!   sonar-nav [--config <path>] plan <x> <y>
//!   sonar-nav [--config <path>] navigate <name> <x> <y>
//!   sonar-nav [--config <path>] navigate "<name>, <x>, <y>"
//!   sonar-nav [--config <path>] navigate --closest "<name>, <x>, <y>"...

use anyhow::{bail, Context, Result};
use sonar_capture::DisplaySampler;
use sonar_data::NavConfig;
use sonar_nav_lib::{
    commands, LocalizationContext, LoggingAudio, LoggingCamera, NavEvent, NavigationController,
};
use sonar_state::{Destination, ScreenPoint};
use std::path::PathBuf;
use std::sync::Arc;

const USAGE: &str = "Usage: sonar-nav [--config <path>] <locate [--ppi] | heading | plan <x> <y> | navigate <name> <x> <y> | navigate \"<name>, <x>, <y>\" | navigate --closest \"<name>, <x>, <y>\"...>";

fn parse_coord(value: Option<&String>, name: &str) -> Result<f64> {
    let raw = value.with_context(|| format!("Missing {} coordinate\n{}", name, USAGE))?;
    raw.parse()
        .with_context(|| format!("Invalid {} coordinate '{}'", name, raw))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    sonar_nav_lib::init_tracing();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = NavConfig::default_path();
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        if pos + 1 >= args.len() {
            bail!("--config needs a path\n{}", USAGE);
        }
        config_path = PathBuf::from(args.remove(pos + 1));
        args.remove(pos);
    }
    let Some(command) = args.first().cloned() else {
        bail!(USAGE);
    };

    let config = NavConfig::load(&config_path)?;
    let context = Arc::new(LocalizationContext::new(config, Arc::new(DisplaySampler::new())));

    match command.as_str() {
        "locate" => {
            let use_ppi = args.iter().any(|a| a == "--ppi");
            let ctx = context.clone();
            let value = tokio::task::spawn_blocking(move || commands::locate(&ctx, use_ppi)).await?;
            print_json(&value)
        }
        "heading" => {
            let ctx = context.clone();
            let value = tokio::task::spawn_blocking(move || commands::heading(&ctx)).await?;
            print_json(&value)
        }
        "plan" => {
            let goal = ScreenPoint::new(
                parse_coord(args.get(1), "x")?,
                parse_coord(args.get(2), "y")?,
            );
            let ctx = context.clone();
            let value = tokio::task::spawn_blocking(move || commands::plan(&ctx, goal)).await??;
            print_json(&value)
        }
        "navigate" => {
            let destination = if args.get(1).is_some_and(|a| a == "--closest") {
                let candidates = args[2..]
                    .iter()
                    .map(|selection| Destination::parse_selection(selection))
                    .collect::<Result<Vec<_>>>()?;
                let ctx = context.clone();
                tokio::task::spawn_blocking(move || {
                    commands::closest_destination(&ctx, &candidates)
                })
                .await??
            } else {
                commands::destination_from_args(&args[1..])
                    .with_context(|| USAGE.to_string())?
            };
            navigate(context, destination).await
        }
        other => bail!("Unknown command '{}'\n{}", other, USAGE),
    }
}

/// Run one session, printing events until it ends or Ctrl-C stops it
async fn navigate(context: Arc<LocalizationContext>, destination: Destination) -> Result<()> {
    let config = context.config();
    if config.pathfinding.use_map_matching {
        let ctx = context.clone();
        tokio::task::spawn_blocking(move || ctx.prepare_map()).await??;
    }

    let audio = Arc::new(LoggingAudio::new(config.pathfinding.ping_volume_max_distance));
    let (controller, mut events) =
        NavigationController::new(&context, audio, Arc::new(LoggingCamera));

    controller.start_pathfinding(destination).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                controller.stop_pathfinding().await;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_json(&serde_json::to_value(&event)?)?;
                if matches!(
                    event,
                    NavEvent::Completed { .. } | NavEvent::Cancelled | NavEvent::Failed { .. }
                ) {
                    break;
                }
            }
        }
    }

    controller.stop_pathfinding().await;
    print_json(&commands::status(&controller.snapshot()))
}
