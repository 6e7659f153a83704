//! flowlock-worker — a small CLI around the resource-lock coordinator.
//!
//! With no subcommand (or `list`), prints every currently running job as a
//! JSON array.
//!
//! RUN MODE:
//! - `run --input a --output b -- cmd...` declares the inputs/outputs given
//!   on the command line, waits for them to become available, holds the
//!   lock while the command runs, and releases it (committing outputs) when
//!   that command exits.
//!
//! ADMIN SUBCOMMANDS:
//! - `force-unlock`, `finish`, `fail`, `graph` recover from a job that died
//!   without releasing its locks, or inspect recorded lineage. These bypass
//!   ownership checks and should only be run by an operator who already
//!   knows the job in question is dead.
//!
//! CONFIGURATION:
//! - `FLOWLOCK_REDIS_URL` (default `redis://127.0.0.1:6379/0`)
//! - `FLOWLOCK_PREFIX`, `FLOWLOCK_GRAPH_HISTORY` — see `flowlock::config`.

use std::process::Command;

use anyhow::{bail, Context, Result};
use flowlock::{admin, config, store::Store, ResourceManager};
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    flowlock::signal::install().context("failed to install signal handlers")?;

    let mut args: Vec<String> = std::env::args().skip(1).collect();

    config::set_global(config::Config::from_env());
    let store = Store::from_global_config()
        .context("FLOWLOCK_REDIS_URL must point at a reachable Redis instance")?;

    // With no subcommand, print the running job list as a JSON array.
    if args.is_empty() {
        return list(store);
    }
    let subcommand = args.remove(0);

    match subcommand.as_str() {
        "list" => list(store),
        "run" => run(store, &args),
        "force-unlock" => force_unlock(store, &args),
        "finish" => finish(store, &args),
        "fail" => fail(store, &args),
        "graph" => graph(store, &args),
        other => bail!("unknown subcommand {other}"),
    }
}

/// `flowlock-worker` or `flowlock-worker list` — prints every currently
/// running job as a JSON array of `{id, exptime, inputs, outputs}`.
fn list(store: Store) -> Result<()> {
    let mut con = store.connection()?;
    let jobs = admin::list_running(&store, &mut con, flowlock::store::now_secs())?;
    println!("{}", serde_json::to_string(&jobs)?);
    Ok(())
}

/// `flowlock-worker run --input a --input b --output c -- some-command arg1 arg2`
fn run(store: Store, args: &[String]) -> Result<()> {
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut duration: i64 = 300;
    let mut wait: i64 = 0;
    let mut command: Vec<String> = Vec::new();

    let mut it = args.iter().peekable();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--input" => inputs.push(it.next().context("--input needs a value")?.clone()),
            "--output" => outputs.push(it.next().context("--output needs a value")?.clone()),
            "--duration" => duration = it.next().context("--duration needs a value")?.parse()?,
            "--wait" => wait = it.next().context("--wait needs a value")?.parse()?,
            "--" => {
                command.extend(it.by_ref().cloned());
                break;
            }
            other => bail!("unexpected argument {other}"),
        }
    }
    if command.is_empty() {
        bail!("no command given after `--`");
    }

    let mgr: std::sync::Arc<ResourceManager> = ResourceManager::new(
        inputs,
        outputs,
        duration,
        wait,
        false,
        store,
        config::global().graph_history,
        "flowlock.worker",
        None,
    );

    mgr.run_scoped(false, || -> flowlock::Result<()> {
        info!(identifier = %mgr.identifier(), "running command under lock");
        let status = Command::new(&command[0])
            .args(&command[1..])
            .status()
            .map_err(|e| flowlock::FlowLockError::Usage(format!("failed to spawn command: {e}")))?;
        if !status.success() {
            return Err(flowlock::FlowLockError::Usage(format!(
                "command exited with {status}"
            )));
        }
        Ok(())
    })?;
    Ok(())
}

fn force_unlock(store: Store, args: &[String]) -> Result<()> {
    let (inputs, outputs) = split_io(args)?;
    let mut con = store.connection()?;
    admin::force_unlock(&store, &mut con, &inputs, &outputs)?;
    println!("unlocked {} input(s), {} output(s)", inputs.len(), outputs.len());
    Ok(())
}

fn finish(store: Store, args: &[String]) -> Result<()> {
    let id = args.first().context("usage: finish <job-id>")?;
    let mut con = store.connection()?;
    let (inputs, outputs) = admin::finish_externally(&store, &mut con, id)?;
    println!(
        "finished {id}: released {} input(s), committed {} output(s)",
        inputs.len(),
        outputs.len()
    );
    Ok(())
}

fn fail(store: Store, args: &[String]) -> Result<()> {
    let id = args.first().context("usage: fail <job-id>")?;
    let mut con = store.connection()?;
    let (inputs, outputs) = admin::fail_externally(&store, &mut con, id)?;
    println!(
        "failed {id}: released {} input(s), {} output(s)",
        inputs.len(),
        outputs.len()
    );
    Ok(())
}

/// `flowlock-worker graph [--dot] [upstream|downstream <name>...]`
fn graph(store: Store, args: &[String]) -> Result<()> {
    let mut con = store.connection()?;
    let edges = admin::all_edges(&store, &mut con)?;

    if args.is_empty() {
        for e in &edges.inputs {
            println!("{} -> {}", e.left, e.right);
        }
        for e in &edges.outputs {
            println!("{} -> {}", e.left, e.right);
        }
        return Ok(());
    }

    let (direction, seeds) = args.split_first().context("usage: graph [upstream|downstream] <name>...")?;
    let seeds: Vec<String> = seeds.to_vec();
    let traversal = match direction.as_str() {
        "upstream" => admin::upstream(&edges, &seeds),
        "downstream" => admin::downstream(&edges, &seeds),
        other => bail!("unknown graph direction {other}"),
    };
    println!("{}", admin::graphviz(&traversal));
    Ok(())
}

fn split_io(args: &[String]) -> Result<(Vec<String>, Vec<String>)> {
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut it = args.iter().peekable();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--input" => inputs.push(it.next().context("--input needs a value")?.clone()),
            "--output" => outputs.push(it.next().context("--output needs a value")?.clone()),
            other => bail!("unexpected argument {other}"),
        }
    }
    Ok((inputs, outputs))
}
