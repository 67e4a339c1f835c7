use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use futures::StreamExt;
use hubspawner_common::{PersistedState, SpawnerConfig, UserOptions};
use hubspawner_core::naming::escape;
use hubspawner_core::{DockerEngine, HubSpawner, Reconciler, ResilientEngine, Spawner, Variant};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hubspawner")]
#[command(about = "Run per-user notebook servers as Docker containers or swarm services")]
struct Cli {
    /// YAML configuration file
    #[arg(long, env = "HUBSPAWNER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding one state file per server
    #[arg(long, env = "HUBSPAWNER_STATE_DIR", default_value = "./hubspawner-state")]
    state_dir: PathBuf,

    /// container, swarm or system-user
    #[arg(long, env = "HUBSPAWNER_VARIANT", default_value = "container")]
    variant: Variant,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct Target {
    /// Hub user name
    user: String,

    /// Named server; empty for the default server
    #[arg(long, default_value = "")]
    server: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start (or reattach to) the user's server and print its address
    Start {
        #[command(flatten)]
        target: Target,

        /// Image requested by the user; must be in allowed_images
        #[arg(long)]
        image: Option<String>,

        /// Extra environment as KEY=VALUE, may be repeated
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
    },
    /// Report whether the server is still running
    Poll {
        #[command(flatten)]
        target: Target,
    },
    /// Stop the server
    Stop {
        #[command(flatten)]
        target: Target,

        /// Skip the graceful stop period
        #[arg(long)]
        now: bool,
    },
    /// Stream the server's output
    Logs {
        #[command(flatten)]
        target: Target,
    },
    /// Print the stored state for the server
    State {
        #[command(flatten)]
        target: Target,
    },
}

/// On-disk record for one server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StateFile {
    variant: Variant,
    #[serde(default)]
    state: PersistedState,
}

fn parse_key_val(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn state_path(dir: &Path, target: &Target) -> PathBuf {
    let stem = if target.server.is_empty() {
        escape(&target.user)
    } else {
        format!("{}--{}", escape(&target.user), escape(&target.server))
    };
    dir.join(format!("{stem}.json"))
}

fn read_state(path: &Path) -> Result<Option<StateFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading state file {}", path.display()))?;
    let state = serde_json::from_str(&raw)
        .wrap_err_with(|| format!("parsing state file {}", path.display()))?;
    Ok(Some(state))
}

fn write_state(path: &Path, state: &StateFile) -> Result<()> {
    if state.state.is_empty() {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(state)?)?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SpawnerConfig> {
    let mut config = match path {
        Some(path) => SpawnerConfig::from_file(path)
            .wrap_err_with(|| format!("loading config {}", path.display()))?,
        None => SpawnerConfig::default(),
    };
    config.apply_process_env()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hubspawner_core=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(load_config(cli.config.as_deref())?);

    let target = match &cli.command {
        Command::Start { target, .. }
        | Command::Poll { target }
        | Command::Stop { target, .. }
        | Command::Logs { target }
        | Command::State { target } => target.clone(),
    };
    let path = state_path(&cli.state_dir, &target);
    let stored = read_state(&path)?;

    // an existing server keeps the variant it was created with
    let variant = match &stored {
        Some(file) if file.variant != cli.variant => {
            warn!(stored = %file.variant, requested = %cli.variant, "Using variant from state file");
            file.variant
        }
        _ => cli.variant,
    };

    if let Command::State { .. } = cli.command {
        let file = stored.unwrap_or(StateFile {
            variant,
            state: PersistedState::default(),
        });
        println!("{}", serde_json::to_string_pretty(&file)?);
        return Ok(());
    }

    let docker = DockerEngine::connect().map_err(|e| eyre!("connecting to Docker: {e}"))?;
    let engine = Arc::new(ResilientEngine::new(docker, config.engine.clone()));
    let spawner = Spawner::for_variant(
        variant,
        target.user.clone(),
        target.server.clone(),
        config.clone(),
        engine,
        Arc::new(Reconciler::new()),
    )?;
    // classify the stored object against the engine before acting on it
    let rebound = match &stored {
        Some(file) => Some(spawner.rebind(file.state.clone()).await?),
        None => None,
    };

    match cli.command {
        Command::Start { image, env, .. } => {
            spawner.set_user_options(UserOptions {
                image,
                environment: env.into_iter().collect::<BTreeMap<_, _>>(),
            });
            let started = spawner.start().await;
            save(&path, variant, &spawner)?;
            let endpoint = started?;
            info!(user = %target.user, %endpoint, "Server ready");
            println!("{endpoint}");
        }
        Command::Poll { .. } => {
            let status = match rebound {
                Some(status) => status,
                None => spawner.poll().await?,
            };
            save(&path, variant, &spawner)?;
            match status {
                None => match spawner.endpoint() {
                    Some(endpoint) => println!("running {endpoint}"),
                    None => println!("running"),
                },
                Some(exit) => {
                    println!("stopped {exit}");
                    std::process::exit(1);
                }
            }
        }
        Command::Stop { now, .. } => {
            spawner.stop(now).await?;
            save(&path, variant, &spawner)?;
            info!(user = %target.user, "Server stopped");
        }
        Command::Logs { .. } => {
            let mut logs = spawner.logs().await?;
            let mut stdout = tokio::io::stdout();
            loop {
                tokio::select! {
                    chunk = logs.next() => match chunk {
                        Some(chunk) => stdout.write_all(&chunk?).await?,
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            stdout.flush().await?;
        }
        Command::State { .. } => {}
    }
    Ok(())
}

fn save(path: &Path, variant: Variant, spawner: &Spawner) -> Result<()> {
    write_state(
        path,
        &StateFile {
            variant,
            state: spawner.get_state(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubspawner_common::ObjectKind;

    #[test]
    fn key_val_pairs() {
        assert_eq!(
            parse_key_val("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_key_val("EMPTY=").unwrap().1, "");
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn cli_parses_start() {
        let cli = Cli::try_parse_from([
            "hubspawner",
            "--variant",
            "swarm",
            "start",
            "alice",
            "--server",
            "gpu",
            "--env",
            "A=1",
        ])
        .unwrap();
        assert_eq!(cli.variant, Variant::Swarm);
        match cli.command {
            Command::Start { target, image, env } => {
                assert_eq!(target.user, "alice");
                assert_eq!(target.server, "gpu");
                assert!(image.is_none());
                assert_eq!(env, vec![("A".to_string(), "1".to_string())]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_variant_is_rejected() {
        assert!(Cli::try_parse_from(["hubspawner", "--variant", "k8s", "poll", "alice"]).is_err());
    }

    #[test]
    fn state_file_per_server() {
        let dir = Path::new("/var/lib/hubspawner");
        let default = Target {
            user: "alice".to_string(),
            server: String::new(),
        };
        let named = Target {
            user: "alice".to_string(),
            server: "gpu".to_string(),
        };
        assert_ne!(state_path(dir, &default), state_path(dir, &named));
        assert_eq!(
            state_path(dir, &default),
            PathBuf::from("/var/lib/hubspawner/alice.json")
        );
    }

    #[test]
    fn state_file_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("alice.json");
        let file = StateFile {
            variant: Variant::SystemUser,
            state: PersistedState {
                object_id: Some("abc".to_string()),
                object_name: Some("hub-alice".to_string()),
                kind: Some(ObjectKind::Container),
            },
        };
        write_state(&path, &file).unwrap();
        assert_eq!(read_state(&path).unwrap(), Some(file));

        write_state(&path, &StateFile::default()).unwrap();
        assert!(!path.exists());
        assert_eq!(read_state(&path).unwrap(), None);
    }
}
