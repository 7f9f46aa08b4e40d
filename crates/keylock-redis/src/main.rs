use std::io;
use std::process::{ExitCode, ExitStatus};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use keylock_core::{Guard, Invocation, SingleNodeLock, StoreLockProvider};
use keylock_redis::config::{Command, Config, RunArgs};
use keylock_redis::RedisStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr so stdout only carries the token
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let config = Config::parse();
    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);

    match &config.command {
        Command::Acquire {
            key,
            token,
            ttl_ms,
            retry_budget_ms,
        } => {
            let lock = SingleNodeLock::new(store);
            let token = token
                .clone()
                .unwrap_or_else(SingleNodeLock::<RedisStore>::new_token);
            let ttl = Duration::from_millis(*ttl_ms);

            let acquired = match retry_budget_ms {
                Some(budget) => {
                    lock.acquire_blocking(key, &token, ttl, Duration::from_millis(*budget))
                        .await?
                }
                None => lock.acquire(key, &token, ttl).await?,
            };
            if acquired {
                println!("{}", token);
                Ok(ExitCode::SUCCESS)
            } else {
                info!("{} is held by another owner", key);
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Release { key, token } => {
            let lock = SingleNodeLock::new(store);
            if lock.release(key, token).await? {
                info!("Released {}", key);
                Ok(ExitCode::SUCCESS)
            } else {
                info!("{} is not held by token {}", key, token);
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Run(run) => {
            let provider = StoreLockProvider::with_config(store, config.provider_config());
            run_guarded(Guard::new(provider), run).await
        }
    }
}

async fn run_guarded(
    guard: Guard<StoreLockProvider<RedisStore>>,
    run: &RunArgs,
) -> anyhow::Result<ExitCode> {
    let (names, values): (Vec<_>, Vec<_>) = run.args.iter().cloned().unzip();
    let invocation = Invocation::from_parts(names, values);

    let status = guard
        .around(&invocation, &run.lock_options(), || run_command(&run.command))
        .await??;

    info!("{} exited with {}", run.command.join(" "), status);
    Ok(match status.code() {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    })
}

async fn run_command(command: &[String]) -> io::Result<ExitStatus> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no command given"))?;
    tokio::process::Command::new(program).args(args).status().await
}
