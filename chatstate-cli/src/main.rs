mod checkpoints;
mod profile;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chatstate_core::config::{ENV_KEY_PREFIX, ENV_URL};
use chatstate_core::{
    ExpirySweep, Namespace, ProfileStore, ProfileValue, SearchQuery, StoreConfig, TtlSweeper,
};
use chatstate_redis::RedisDatabase;

#[derive(Parser)]
#[command(name = "chatstate", version, about = "Inspect and maintain chatstate data in Redis")]
struct Cli {
    /// Redis connection URL.
    #[arg(long, global = true, env = ENV_URL)]
    url: Option<String>,

    /// Prefix shared by every key the stores write.
    #[arg(long, global = true, env = ENV_KEY_PREFIX)]
    key_prefix: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Thread ids with stored checkpoints, most recently written first.
    Threads,
    #[command(subcommand)]
    Checkpoints(CheckpointCommand),
    /// Delete expired partitions and checkpoints.
    Sweep {
        /// Keep sweeping on an interval until interrupted.
        #[arg(long)]
        watch: bool,
        /// Seconds between sweeps with --watch; defaults to the configured interval.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    #[command(subcommand)]
    Profile(ProfileCommand),
}

#[derive(Subcommand)]
pub enum CheckpointCommand {
    /// Checkpoint history of one thread, newest first.
    List {
        thread_id: String,
        #[arg(long, default_value = "")]
        ns: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Report partitions and checkpoints missing or carrying bad timestamps.
    Verify {
        /// Checks every known thread when omitted.
        thread_id: Option<String>,
        /// Checks every namespace of each thread when omitted.
        #[arg(long)]
        ns: Option<String>,
    },
    /// Delete every checkpoint of one thread, across namespaces.
    Delete { thread_id: String },
    /// Delete the checkpoints of every known thread.
    Clear {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ProfileCommand {
    /// Remember a value; `facts` and `preferences` collect entries.
    Set {
        user_id: String,
        category: String,
        value: String,
        #[arg(long, default_value = "users")]
        namespace: String,
    },
    /// Show a profile, or one category of it.
    Get {
        user_id: String,
        category: Option<String>,
        #[arg(long, default_value = "users")]
        namespace: String,
    },
    /// Remove one category from a profile.
    Forget {
        user_id: String,
        category: String,
        #[arg(long, default_value = "users")]
        namespace: String,
    },
    Delete {
        user_id: String,
        #[arg(long, default_value = "users")]
        namespace: String,
    },
    /// Every profile under the namespace.
    List {
        #[arg(long, default_value = "users")]
        namespace: String,
    },
}

impl Cli {
    fn store_config(&self) -> anyhow::Result<StoreConfig> {
        let config = StoreConfig::from_lookup(|name| match name {
            ENV_URL => self.url.clone(),
            ENV_KEY_PREFIX => self.key_prefix.clone(),
            other => std::env::var(other).ok(),
        })?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.store_config().context("invalid store configuration")?;
    let sweep_interval = config.sweep_interval();
    let database = RedisDatabase::connect(config)
        .await
        .context("failed to connect to redis")?;

    let result = run(cli.command, &database, sweep_interval).await;
    if let Err(error) = database.quit().await {
        tracing::debug!(error = %error, "redis quit failed");
    }
    result
}

async fn run(
    command: Command,
    database: &RedisDatabase,
    sweep_interval: Duration,
) -> anyhow::Result<()> {
    match command {
        Command::Threads => {
            for thread_id in database.checkpoint_saver().thread_ids().await? {
                println!("{thread_id}");
            }
            Ok(())
        }
        Command::Checkpoints(command) => {
            checkpoints::run(command, &database.checkpoint_saver()).await
        }
        Command::Sweep {
            watch,
            interval_secs,
        } => {
            let saver = database.checkpoint_saver();
            if !watch {
                let report = saver.sweep_expired(chrono::Utc::now()).await?;
                println!(
                    "removed {} partition(s) and {} checkpoint(s)",
                    report.partitions, report.checkpoints
                );
                return Ok(());
            }

            let interval = interval_secs.map(Duration::from_secs).unwrap_or(sweep_interval);
            let handle = TtlSweeper::new(Arc::new(saver))
                .with_interval(interval)
                .spawn();
            println!("sweeping every {}s, press ctrl-c to stop", interval.as_secs());
            tokio::signal::ctrl_c().await?;
            handle.shutdown().await;
            Ok(())
        }
        Command::Profile(command) => run_profile(command, &database.profile_store()).await,
    }
}

async fn run_profile(command: ProfileCommand, store: &impl ProfileStore) -> anyhow::Result<()> {
    match command {
        ProfileCommand::Set {
            user_id,
            category,
            value,
            namespace,
        } => {
            let namespace = Namespace::from([namespace.as_str()]);
            let mut current = load_value(store, &namespace, &user_id).await?;
            if !profile::remember(&mut current, &category, &value) {
                println!("{user_id} already has {category}: {value}");
                return Ok(());
            }
            let item = store.put(&namespace, &user_id, current).await?;
            println!("set {category} = {value} for {user_id}");
            for line in profile::render(&item.value) {
                println!("  - {line}");
            }
        }
        ProfileCommand::Get {
            user_id,
            category,
            namespace,
        } => {
            let namespace = Namespace::from([namespace.as_str()]);
            let Some(item) = store.get(&namespace, &user_id).await? else {
                println!("no profile found for {user_id}");
                return Ok(());
            };
            match category {
                Some(category) => match item.value.get(&category) {
                    Some(value) => println!("{category}: {}", profile::render_value(value)),
                    None => println!("no {category} stored for {user_id}"),
                },
                None => {
                    println!("profile for {user_id}:");
                    for line in profile::render(&item.value) {
                        println!("  - {line}");
                    }
                    println!("created: {}", item.created_at.to_rfc3339());
                    println!("updated: {}", item.updated_at.to_rfc3339());
                }
            }
        }
        ProfileCommand::Forget {
            user_id,
            category,
            namespace,
        } => {
            let namespace = Namespace::from([namespace.as_str()]);
            let mut current = load_value(store, &namespace, &user_id).await?;
            if !profile::forget(&mut current, &category) {
                println!("no {category} stored for {user_id}");
                return Ok(());
            }
            store.put(&namespace, &user_id, current).await?;
            println!("forgot {category} for {user_id}");
        }
        ProfileCommand::Delete { user_id, namespace } => {
            store
                .delete(&Namespace::from([namespace.as_str()]), &user_id)
                .await?;
            println!("deleted profile for {user_id}");
        }
        ProfileCommand::List { namespace } => {
            use futures::TryStreamExt;

            let namespace = Namespace::from([namespace.as_str()]);
            let items: Vec<_> = store
                .search(&namespace, SearchQuery::new())
                .try_collect()
                .await?;
            if items.is_empty() {
                println!("no profiles under {namespace}");
            }
            for item in items {
                println!("{} {}", item.namespace, item.key);
                for line in profile::render(&item.value) {
                    println!("  - {line}");
                }
            }
        }
    }
    Ok(())
}

async fn load_value(
    store: &impl ProfileStore,
    namespace: &Namespace,
    user_id: &str,
) -> anyhow::Result<ProfileValue> {
    Ok(store
        .get(namespace, user_id)
        .await?
        .map(|item| item.value)
        .unwrap_or_default())
}
