//! kith-demo: two clients talking over the in-memory relay and transport.

use anyhow::{bail, Context};
use bytes::Bytes;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kith_core::harness::{introduce, pump, Network};
use kith_core::{ClientConfig, ConnectionOutcome, Messenger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::load().context("loading configuration")?;
    let mode = std::env::args().nth(1).unwrap_or_else(|| "hello".to_string());
    match mode.as_str() {
        "hello" => run_hello(config).await,
        "outage" => run_outage(config).await,
        other => {
            eprintln!("Usage: kith-demo [hello|outage]");
            bail!("unknown mode: {}", other);
        }
    }
}

async fn meet(network: &Network, config: &ClientConfig) -> anyhow::Result<(Messenger, Messenger)> {
    let alice = network.join(config.clone()).await.context("alice joins")?;
    let bob = network.join(config.clone()).await.context("bob joins")?;

    let invite = alice.invite("alice")?.encode();
    println!("ALICE_INVITE={}", invite);
    introduce(&alice, "alice", &bob, "bob")?;
    Ok((alice, bob))
}

fn report(outcomes: &[ConnectionOutcome]) {
    for outcome in outcomes {
        if let ConnectionOutcome::Received { from, payload } = outcome {
            println!("received from {}: {}", from, String::from_utf8_lossy(payload));
        }
    }
}

async fn run_hello(config: ClientConfig) -> anyhow::Result<()> {
    let network = Network::new();
    let (mut alice, mut bob) = meet(&network, &config).await?;
    let (ak, bk) = (*alice.public_key(), *bob.public_key());

    alice.send(&bk, Bytes::from_static(b"hi")).await?;
    report(&pump(&mut [&mut alice, &mut bob]).await?);

    bob.send(&ak, Bytes::from_static(b"hello alice")).await?;
    report(&pump(&mut [&mut alice, &mut bob]).await?);

    info!(
        alice = %alice.connection_stage(&bk),
        bob = %bob.connection_stage(&ak),
        "conversation complete"
    );
    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

async fn run_outage(config: ClientConfig) -> anyhow::Result<()> {
    let network = Network::new();
    let (mut alice, mut bob) = meet(&network, &config).await?;
    let (ak, bk) = (*alice.public_key(), *bob.public_key());

    alice.send(&bk, Bytes::from_static(b"before the outage")).await?;
    report(&pump(&mut [&mut alice, &mut bob]).await?);

    network.transports.sever_all();
    pump(&mut [&mut alice, &mut bob]).await?;
    info!(stage = %alice.connection_stage(&bk), "direct channel lost");

    for text in ["queued one", "queued two"] {
        let outcome = alice.send(&bk, Bytes::from(text)).await?;
        info!(?outcome, "sent while disconnected");
    }

    bob.retry(&ak).await?;
    alice.retry(&bk).await?;
    report(&pump(&mut [&mut alice, &mut bob]).await?);

    let state = bob.state();
    let received = state.log(&ak).map(|log| log.receive_log().len()).unwrap_or(0);
    info!(received, "outage recovered");
    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}
