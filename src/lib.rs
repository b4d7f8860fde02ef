// src/lib.rs

pub mod channel;
pub mod cli;
pub mod config;
pub mod errors;
pub mod listener;
pub mod logging;
pub mod monitor;
pub mod params;
pub mod protocol;
pub mod sender;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::channel::{ApplyResponse, SimulatedChannelService};
use crate::cli::CliArgs;
use crate::config::{load_and_validate, parse_duration, ConfigFile, SenderDefinition};
use crate::errors::{CommandError, Result};

pub use crate::channel::{ChannelService, ChannelUpdate};
pub use crate::errors::{ChannelError, CommandFailure};
pub use crate::listener::{CompletionListener, ListenerDispatcher};
pub use crate::monitor::{CommandMonitor, CommandState, Outcome};
pub use crate::params::Parameter;
pub use crate::protocol::SenderState;
pub use crate::sender::{ApplyChannels, CommandSender, SenderConfig};
pub use crate::types::{CarState, Directive, ParameterValue, Value, ValueKind};

/// High-level entry point used by `main.rs`.
///
/// Without `--simulate` (or with `--dry-run`) the config is validated and
/// summarised. With `--simulate NAME` the named sender is posted once
/// against an in-process simulated apply record.
pub async fn run(args: CliArgs) -> anyhow::Result<()> {
    let cfg = load_and_validate(&args.config)?;

    let sender_name = match &args.simulate {
        Some(name) if !args.dry_run => name.clone(),
        _ => {
            print_dry_run(&cfg);
            return Ok(());
        }
    };

    let definition = cfg
        .sender(&sender_name)
        .ok_or_else(|| anyhow!("no sender named '{sender_name}' in {}", args.config))?;
    let delay = parse_duration(&args.simulate_delay)
        .map_err(|e| anyhow!("invalid --simulate-delay: {e}"))?;

    // Ctrl-C abandons the wait; the simulated execution is left to finish.
    let (cancel_tx, cancel_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        let _ = cancel_tx.send(());
    });

    let monitor = simulate_post(definition, &args.set, delay, cancel_rx).await?;
    match monitor.error() {
        None => {
            println!("{} #{}: {:?}", monitor.sender(), monitor.id(), monitor.state());
            Ok(())
        }
        Some(failure) => Err(anyhow!(
            "{} #{} failed: {failure}",
            monitor.sender(),
            monitor.id()
        )),
    }
}

/// Build `definition` on a fresh simulated channel service, apply the
/// `name=value` assignments and post it once, waiting for the outcome.
pub async fn simulate_post(
    definition: &SenderDefinition,
    assignments: &[(String, String)],
    busy_for: Duration,
    cancel: oneshot::Receiver<()>,
) -> Result<CommandMonitor> {
    let sim = SimulatedChannelService::new();
    let apply = &definition.apply;
    sim.install_apply_record(
        &apply.directive,
        &apply.status,
        apply.message.as_deref(),
        ApplyResponse::Succeed { after: busy_for },
    );

    let dispatcher = ListenerDispatcher::spawn("acm-dispatch")?;
    let sender = CommandSender::from_definition(definition, Arc::new(sim.clone()), dispatcher).await?;

    for (name, text) in assignments {
        let kind = definition
            .parameters
            .get(name)
            .map(|p| p.kind)
            .ok_or_else(|| CommandError::ParameterNotFound(name.clone()))?;
        let value = Value::parse(kind, text)?;
        sender.set_value(name, value).await?;
    }

    info!(sender = %definition.name, ?busy_for, "posting against simulated apply record");
    let result = sender.post_wait_until(cancel).await;

    debug!(writes = ?sim.writes(), "simulated channel writes");
    sender.shutdown().await;
    result
}

/// Dry-run output: print senders, their channels and parameters.
fn print_dry_run(cfg: &ConfigFile) {
    println!("acm dry-run");
    println!();

    println!("senders ({}):", cfg.senders.len());
    for (name, sender) in cfg.senders.iter() {
        println!("  - {name}");
        if !sender.description.is_empty() {
            println!("      description: {}", sender.description);
        }
        println!("      directive: {}", sender.apply.directive);
        if sender.apply.mark != sender.apply.directive {
            println!("      mark: {}", sender.apply.mark);
        }
        println!("      status: {}", sender.apply.status);
        if let Some(ref message) = sender.apply.message {
            println!("      message: {message}");
        }
        println!(
            "      timeouts: connect {:?}, write {:?}, command {:?}",
            sender.config.connect_timeout, sender.config.write_timeout, sender.config.command_timeout
        );
        for (param, def) in sender.parameters.iter() {
            match def.description {
                Some(ref d) => println!("      {param}: {} @ {} ({d})", def.kind, def.channel),
                None => println!("      {param}: {} @ {}", def.kind, def.channel),
            }
        }
    }

    debug!("dry-run complete (nothing posted)");
}
