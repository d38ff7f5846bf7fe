use std::io::{self, BufRead, Write};

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;

use chatstate_core::{CheckpointSaver, ListOptions, ThreadKey};
use chatstate_redis::RedisCheckpointSaver;

use crate::CheckpointCommand;

pub async fn run(command: CheckpointCommand, saver: &RedisCheckpointSaver) -> anyhow::Result<()> {
    match command {
        CheckpointCommand::List {
            thread_id,
            ns,
            limit,
        } => {
            let key = ThreadKey::new(thread_id).with_namespace(ns);
            let mut options = ListOptions::new();
            if let Some(limit) = limit {
                options = options.limit(limit);
            }
            let now = Utc::now();
            let mut history = saver.list(&key, options);
            while let Some(tuple) = history.try_next().await? {
                println!(
                    "{}  step={:<4} source={:<6} writes={:<3} created={} expires={}{}",
                    tuple.checkpoint_id(),
                    tuple.metadata.step,
                    tuple.metadata.source,
                    tuple.pending_writes.len(),
                    short(tuple.created_at),
                    short(tuple.expire_at),
                    if tuple.is_expired(now) { " (expired)" } else { "" },
                );
            }
            Ok(())
        }
        CheckpointCommand::Verify { thread_id, ns } => {
            let threads = match thread_id {
                Some(thread_id) => vec![thread_id],
                None => saver.thread_ids().await?,
            };
            let mut totals = Verification::default();
            for thread_id in threads {
                let namespaces = match &ns {
                    Some(ns) => vec![ns.clone()],
                    None => saver
                        .namespaces(&thread_id)
                        .await
                        .with_context(|| format!("failed to read namespaces of {thread_id}"))?,
                };
                for ns in namespaces {
                    let key = ThreadKey::new(thread_id.as_str()).with_namespace(ns);
                    totals += verify_partition(saver, &key).await;
                }
            }
            println!(
                "{} checkpoint(s) ok, {} expired, {} unreadable",
                totals.ok, totals.expired, totals.unreadable
            );
            if totals.unreadable > 0 {
                anyhow::bail!("{} checkpoint record(s) could not be read", totals.unreadable);
            }
            Ok(())
        }
        CheckpointCommand::Delete { thread_id } => {
            saver.delete_thread(&thread_id).await?;
            println!("deleted thread {thread_id}");
            Ok(())
        }
        CheckpointCommand::Clear { yes } => {
            let threads = saver.thread_ids().await?;
            if threads.is_empty() {
                println!("no checkpoints stored");
                return Ok(());
            }
            if !yes && !confirm(threads.len())? {
                println!("nothing deleted");
                return Ok(());
            }
            for thread_id in &threads {
                saver
                    .delete_thread(thread_id)
                    .await
                    .with_context(|| format!("failed to delete thread {thread_id}"))?;
            }
            println!("deleted {} thread(s)", threads.len());
            Ok(())
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Verification {
    ok: usize,
    expired: usize,
    unreadable: usize,
}

impl std::ops::AddAssign for Verification {
    fn add_assign(&mut self, other: Self) {
        self.ok += other.ok;
        self.expired += other.expired;
        self.unreadable += other.unreadable;
    }
}

async fn verify_partition(saver: &RedisCheckpointSaver, key: &ThreadKey) -> Verification {
    let now = Utc::now();
    let mut result = Verification::default();
    println!("thread {} ns {:?}", key.thread_id, key.checkpoint_ns);

    match saver.get_partition(key).await {
        Ok(Some(partition)) if partition.expire_at > partition.created_at => println!(
            "  partition created {} expires {}",
            short(partition.created_at),
            short(partition.expire_at)
        ),
        Ok(Some(partition)) => {
            println!(
                "  partition expires {} before it was created {}",
                short(partition.expire_at),
                short(partition.created_at)
            );
            result.unreadable += 1;
        }
        Ok(None) => println!("  no partition record"),
        Err(error) => {
            println!("  partition unreadable: {error}");
            result.unreadable += 1;
        }
    }

    let mut history = saver.list(key, ListOptions::new());
    loop {
        match history.try_next().await {
            Ok(Some(tuple)) if tuple.is_expired(now) => result.expired += 1,
            Ok(Some(_)) => result.ok += 1,
            Ok(None) => break,
            Err(error) => {
                println!("  checkpoint history unreadable: {error}");
                result.unreadable += 1;
                break;
            }
        }
    }
    result
}

fn confirm(threads: usize) -> anyhow::Result<bool> {
    print!("delete ALL checkpoints of {threads} thread(s)? this cannot be undone (yes/no): ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

fn short(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
