//! Run a few Paxos participants in one process and agree on some values.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use basic_paxos::{
    FjallLog, LocalNetwork, Log, Membership, MemoryLog, Paxos, ServerIdGenerator,
};
use bytes::Bytes;
use clap::Parser;
use error_stack::{Report, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "paxos-demo")]
#[command(about = "Agree on values between in-process Paxos participants")]
struct Args {
    /// Number of participants
    #[arg(short, long, env = "PAXOS_NODES", default_value_t = 3)]
    nodes: u8,

    /// Persist logs under this directory instead of in memory
    #[arg(short, long, env = "PAXOS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Seconds to wait for each value to be proposed and learned
    #[arg(short, long, default_value_t = 10)]
    timeout: u64,

    /// Values to propose, in order
    #[arg(default_values_t = [String::from("hello-world")])]
    values: Vec<String>,
}

#[derive(Debug)]
struct DemoError;

impl fmt::Display for DemoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("paxos demo failed")
    }
}

impl core::error::Error for DemoError {}

type Participant<L> = Paxos<L, ServerIdGenerator, LocalNetwork<L>, LocalNetwork<L>>;

#[tokio::main]
async fn main() -> Result<(), Report<DemoError>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.nodes == 0 {
        return Err(Report::new(DemoError).attach("at least one node is required"));
    }

    match &args.data_dir {
        Some(dir) => {
            info!(path = ?dir, "opening fjall logs");
            let logs = (0..args.nodes)
                .map(|node| FjallLog::open(dir.join(format!("node-{node}"))))
                .collect::<Result<Vec<_>, _>>()
                .change_context(DemoError)?;
            run(logs, &args).await
        }
        None => {
            let logs = (0..args.nodes).map(|_| MemoryLog::new()).collect::<Vec<_>>();
            run(logs, &args).await
        }
    }
}

async fn run<L: Log>(logs: Vec<L>, args: &Args) -> Result<(), Report<DemoError>> {
    let network = LocalNetwork::new();
    let members: Vec<String> = (0..logs.len()).map(|node| format!("node-{node}")).collect();
    let membership = Membership::with_members(members.iter().cloned());

    let mut participants: Vec<Arc<Participant<L>>> = Vec::new();
    for ((server_id, log), member) in (0u8..).zip(&logs).zip(&members) {
        let paxos = Paxos::builder()
            .id_generator(ServerIdGenerator::new(server_id))
            .logs(log)
            .dialer(network.clone())
            .build()
            .change_context(DemoError)?;
        network.register(member.clone(), paxos.acceptor().clone());
        participants.push(Arc::new(paxos));
    }

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    for paxos in &participants {
        let paxos = paxos.clone();
        let cancel = cancel.clone();
        let membership = membership.clone();
        tasks.push(tokio::spawn(async move {
            paxos.start(&cancel, &membership).await
        }));
    }

    let timeout = Duration::from_secs(args.timeout);
    for (i, value) in args.values.iter().enumerate() {
        let proposer = &participants[i % participants.len()];
        let accepted = tokio::time::timeout(
            timeout,
            proposer.propose(&cancel, Bytes::from(value.clone())),
        )
        .await
        .change_context(DemoError)
        .attach_with(|| format!("timed out proposing {value:?}"))?
        .change_context(DemoError)?;

        for (paxos, member) in participants.iter().zip(&members) {
            let mut learned = paxos.observer().subscribe();
            let proposal = tokio::time::timeout(timeout, learned.wait_for(|p| p.value == accepted))
                .await
                .change_context(DemoError)
                .attach_with(|| format!("{member} did not learn {value:?}"))?
                .change_context(DemoError)?
                .clone();
            println!(
                "{member} learned #{} = {}",
                proposal.id,
                String::from_utf8_lossy(&proposal.value)
            );
        }
    }

    cancel.cancel();
    for task in tasks {
        task.await
            .change_context(DemoError)?
            .change_context(DemoError)?;
    }
    Ok(())
}
