// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use durq_common_telemetry::{LoggingOptions, init_global_logging, set_panic_hook};
use durq_queue::{QueueConfig, QueueManagerConfig, TransactionalQueueManager};
use snafu::{ResultExt, Whatever};
use tracing::info;

mod build_info;

type Manager = TransactionalQueueManager<String>;

#[derive(Debug, Parser)]
#[clap(
name = "durq",
about = "Inspect and drive durq queues",
author = build_info::AUTHOR,
version = build_info::FULL_VERSION,
long_version = build_info::LONG_VERSION)]
struct Cli {
    /// Working directory holding queue stores and journals.
    #[arg(long, global = true, default_value = "./.durq")]
    dir: PathBuf,

    /// Log filter, e.g. `info` or `durq_queue=debug`.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Offer(OfferArgs),
    Poll(PollArgs),
    Peek(QueueArgs),
    Size(QueueArgs),
    Clear(QueueArgs),
    Recover,
    Consume(ConsumeArgs),
}

#[derive(Debug, Clone, Args)]
struct QueueArgs {
    /// Queue name.
    queue: String,

    /// Keep the queue in memory only.
    #[arg(long)]
    transient: bool,
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Appends payloads to a queue.
Examples:

durq offer jobs build test deploy
durq offer jobs build --transactional

")]
struct OfferArgs {
    #[command(flatten)]
    queue: QueueArgs,

    /// Payloads, appended in order.
    #[arg(required = true)]
    payloads: Vec<String>,

    /// Give up on a full queue after this many milliseconds.
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,

    /// Append every payload in one transaction.
    #[arg(long)]
    transactional: bool,
}

impl OfferArgs {
    fn run(&self, manager: &Manager) -> Result<(), Whatever> {
        let session = manager.get_queue_session().whatever_context("open session")?;
        let queue = session.get_queue(&self.queue.queue).whatever_context("open queue")?;
        if self.transactional {
            session.begin().whatever_context("begin transaction")?;
        }
        let timeout = Duration::from_millis(self.timeout_ms);
        for payload in &self.payloads {
            if !queue.offer(payload.clone(), timeout).whatever_context("offer")? {
                if self.transactional {
                    session.rollback().whatever_context("roll back")?;
                }
                snafu::whatever!("queue {} is full", self.queue.queue);
            }
        }
        if self.transactional {
            session.commit().whatever_context("commit")?;
        }
        println!("offered {} item(s), size {}", self.payloads.len(), queue.size());
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Removes items from the head of a queue and prints them.
Examples:

durq poll jobs --count 10
durq poll jobs --timeout-ms 5000 --transactional

")]
struct PollArgs {
    #[command(flatten)]
    queue: QueueArgs,

    /// Maximum number of items to remove.
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// How long to wait for each item in milliseconds.
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,

    /// Remove every item in one transaction.
    #[arg(long)]
    transactional: bool,
}

impl PollArgs {
    fn run(&self, manager: &Manager) -> Result<(), Whatever> {
        let session = manager.get_queue_session().whatever_context("open session")?;
        let queue = session.get_queue(&self.queue.queue).whatever_context("open queue")?;
        if self.transactional {
            session.begin().whatever_context("begin transaction")?;
        }
        let timeout = Duration::from_millis(self.timeout_ms);
        for _ in 0..self.count {
            match queue.poll(timeout).whatever_context("poll")? {
                Some(item) => println!("{item}"),
                None => break,
            }
        }
        if self.transactional {
            session.commit().whatever_context("commit")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Removes and prints items as they arrive until interrupted with Ctrl-C.
Examples:

durq consume jobs

")]
struct ConsumeArgs {
    #[command(flatten)]
    queue: QueueArgs,
}

impl ConsumeArgs {
    fn run(&self, manager: &Manager) -> Result<(), Whatever> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
            .whatever_context("install Ctrl-C handler")?;

        let queue = manager.get_queue(&self.queue.queue).whatever_context("open queue")?;
        let mut consumed = 0_u64;
        while running.load(Ordering::SeqCst) {
            if let Some(item) = queue.poll(Duration::from_millis(200)).whatever_context("poll")? {
                println!("{item}");
                consumed += 1;
            }
        }
        info!(queue = %self.queue.queue, consumed, "Consumer interrupted");
        Ok(())
    }
}

fn queue_command(command: &Commands) -> Option<&QueueArgs> {
    match command {
        Commands::Offer(args) => Some(&args.queue),
        Commands::Poll(args) => Some(&args.queue),
        Commands::Consume(args) => Some(&args.queue),
        Commands::Peek(args) | Commands::Size(args) | Commands::Clear(args) => Some(args),
        Commands::Recover => None,
    }
}

fn run(cli: &Cli, manager: &Manager) -> Result<(), Whatever> {
    match &cli.commands {
        Commands::Offer(args) => args.run(manager),
        Commands::Poll(args) => args.run(manager),
        Commands::Consume(args) => args.run(manager),
        Commands::Peek(args) => {
            let head = manager
                .get_queue(&args.queue)
                .and_then(|queue| queue.peek())
                .whatever_context("peek")?;
            match head {
                Some(item) => println!("{item}"),
                None => println!("(empty)"),
            }
            Ok(())
        }
        Commands::Size(args) => {
            let queue = manager.get_queue(&args.queue).whatever_context("open queue")?;
            println!("{}", queue.size());
            Ok(())
        }
        Commands::Clear(args) => {
            let queue = manager.get_queue(&args.queue).whatever_context("open queue")?;
            let size = queue.size();
            queue.clear().whatever_context("clear")?;
            println!("cleared {size} item(s)");
            Ok(())
        }
        // Recovery already ran in `start()`.
        Commands::Recover => Ok(()),
    }
}

fn main() -> Result<(), Whatever> {
    human_panic::setup_panic!();
    let cli = Cli::parse();

    let logging = LoggingOptions::builder().level(cli.log_level.clone()).build();
    let _guards = init_global_logging("durq", &logging);
    set_panic_hook();

    let manager = Manager::with_bincode(QueueManagerConfig::builder().working_directory(cli.dir.clone()).build());
    if let Some(args) = queue_command(&cli.commands).filter(|args| args.transient) {
        manager.set_queue_config(args.queue.clone(), QueueConfig::builder().persistent(false).build());
    }

    let report = manager.start().whatever_context("start queue manager")?;
    if matches!(cli.commands, Commands::Recover) {
        println!(
            "local: {} transaction(s), {} restored, {} removed",
            report.local.transactions, report.local.restored, report.local.removed
        );
        println!(
            "xa: {} transaction(s), {} restored, {} removed, {} in doubt",
            report.xa.transactions, report.xa.restored, report.xa.removed, report.xa.in_doubt
        );
    }

    let result = run(&cli, &manager);
    manager.dispose().whatever_context("dispose queue manager")?;
    result
}
