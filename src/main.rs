use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use remote_jobs::{
    fetch_logs, find_submitted_jobs, load_host, remote_hash, sacct, Action, Config,
    ConnectionPool, Host, MemorySecretStore, RemoteError, SacctRecord, SecretStore,
    TargetRegistry, TargetsAction,
};

fn run_targets(registry: &mut TargetRegistry, action: TargetsAction) -> Result<()> {
    match action {
        TargetsAction::List => {
            if registry.is_empty() {
                eprintln!("No targets registered in {}", registry.path().display());
            }
            for host in registry.targets() {
                let marker = if registry.default_name() == Some(host.name.as_str()) {
                    "*".green().bold()
                } else {
                    " ".normal()
                };
                println!("{} {} via {}", marker, host, host.protocol.cyan());
            }
            return Ok(());
        }
        TargetsAction::Add {
            name,
            address,
            port,
            protocol,
            username,
            key_file,
            default,
        } => {
            let mut host = Host::new(&name, address)
                .with_port(port)
                .with_protocol(protocol);
            host.username = username;
            host.key_filename = key_file;
            registry.add_target(host)?;
            if default {
                registry.set_default(&name)?;
            }
        }
        TargetsAction::Remove { name } => {
            registry.del_target(&name)?;
        }
        TargetsAction::Default { name } => registry.set_default(&name)?,
        TargetsAction::Import { path } => {
            let host = load_host(&path)
                .with_context(|| format!("Failed to load host from {}", path.display()))?;
            registry.add_target(host)?;
        }
    }
    registry
        .save_targets()
        .with_context(|| format!("Failed to save {}", registry.path().display()))
}

fn resolve_target(
    registry: &TargetRegistry,
    name: Option<&str>,
    user: Option<&str>,
) -> Result<Host> {
    let host = match name {
        Some(name) => registry
            .get(name)
            .ok_or_else(|| RemoteError::UnknownTarget(name.to_string()))?,
        None => registry
            .default_target()
            .ok_or_else(|| anyhow!("No --target given and no default target set"))?,
    };
    let mut host = host.clone();
    if let Some(user) = user {
        host.username = Some(user.to_string());
    }
    Ok(host)
}

fn print_sacct(records: &[SacctRecord]) {
    for record in records {
        let field = |name: &str| record.get(name).map(String::as_str).unwrap_or("-");
        let state = field("state");
        let state = if state == "COMPLETED" {
            state.green()
        } else if state == "RUNNING" || state == "PENDING" {
            state.yellow()
        } else {
            state.red()
        };
        println!(
            "{:<12} {:<20} {:>10} {} -> {}",
            field("jobid"),
            state,
            field("elapsed"),
            field("start"),
            field("end")
        );
    }
}

async fn run(
    registry: &mut TargetRegistry,
    pool: &ConnectionPool,
    user: Option<&str>,
    action: Action,
) -> Result<()> {
    match action {
        Action::Targets(action) => run_targets(registry, action)?,
        Action::Run {
            target,
            detach,
            command,
        } => {
            let host = resolve_target(registry, target.as_deref(), user)?;
            let client = pool.connect(&host).await?;
            let command = command.join(" ");
            eprintln!("{} === run '{}' ===", host.to_string().bold(), command);
            match client.run_command(&command, !detach).await? {
                Some(output) => {
                    if !output.stdout.is_empty() {
                        println!("{}", output.stdout);
                    }
                    if !output.stderr.is_empty() {
                        eprintln!("{}", output.stderr.red());
                    }
                    let status = match output.exit_code {
                        Some(0) => "0".green(),
                        Some(code) => code.to_string().red(),
                        None => "signal".red(),
                    };
                    eprintln!("{} === done ({}) ===", host.to_string().bold(), status);
                    if !output.success() {
                        bail!("Command exited with status {}", status);
                    }
                }
                None => eprintln!("{} === detached ===", host.to_string().bold()),
            }
        }
        Action::Os { target } => {
            let host = resolve_target(registry, target.as_deref(), user)?;
            let client = pool.connect(&host).await?;
            println!("{}", client.which_os().await);
        }
        Action::Hash { target, path } => {
            let host = resolve_target(registry, target.as_deref(), user)?;
            let client = pool.connect(&host).await?;
            println!("{}  {}", remote_hash(client.as_ref(), &path).await?, path);
        }
        Action::Sacct { target, job_ids } => {
            let host = resolve_target(registry, target.as_deref(), user)?;
            let client = pool.connect(&host).await?;
            print_sacct(&sacct(client.as_ref(), &job_ids).await?);
        }
        Action::Submitted {
            target,
            job_id,
            logs,
        } => {
            let host = resolve_target(registry, target.as_deref(), user)?;
            let client = pool.connect(&host).await?;
            let logs: BTreeMap<String, String> = fetch_logs(client.as_ref(), &logs).await?;
            for id in find_submitted_jobs(&job_id, &logs) {
                println!("{}", id);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Config {
        targets_file,
        user,
        action,
    } = Config::parse();
    let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::default());
    let mut registry = TargetRegistry::open(targets_file, Arc::clone(&secrets));

    // Connections are opened lazily, so target management never touches the network.
    let pool = ConnectionPool::default().with_secrets(secrets);
    let result = run(&mut registry, &pool, user.as_deref(), action).await;
    pool.close_all().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_target_actions_never_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        let config = Config::try_parse_from([
            "remote-jobs",
            "--targets-file",
            path.to_str().unwrap(),
            "targets",
            "add",
            "gpu",
            "gpu.example.org",
            "--protocol",
            "nowhere",
            "--default",
        ])
        .unwrap();

        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::default());
        let mut registry = TargetRegistry::open(config.targets_file, Arc::clone(&secrets));
        let pool = ConnectionPool::default().with_secrets(secrets);
        run(&mut registry, &pool, None, config.action).await.unwrap();

        assert_eq!(registry.default_name(), Some("gpu"));
        assert!(path.is_file());
        assert!(pool.is_empty().await);
    }
}
