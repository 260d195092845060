//! Bastion Tunnel Smoke Test
//!
//! Exercises the tunnel and the gateway against a real bastion using the same
//! environment variables as `dbtunnel` (SSH_HOST, SSH_USER, SSH_KEY_PATH,
//! DB_HOST, DB_USER, DB_PASSWORD, DB_NAME, ...).
//!
//! Run with:
//!   cargo run --bin check_tunnel -- [concurrent-tunnels]

use anyhow::{Context, Result};
use dbtunnel::Config;
use dbtunnel::QueryGateway;
use dbtunnel::ssh::{SshConnector, SshTunnel, TunnelManager};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONCURRENT: usize = 4;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("check_tunnel=debug".parse()?)
                .add_directive("dbtunnel=debug".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let concurrent = match std::env::args().nth(1) {
        Some(n) => n.parse().context("concurrent tunnel count must be a number")?,
        None => DEFAULT_CONCURRENT,
    };
    let config = Config::from_env()?;

    println!("━━━ Bastion tunnel smoke test ━━━");
    println!(
        "  bastion {}@{}:{}, database {}:{}\n",
        config.bastion.user,
        config.bastion.host,
        config.bastion.port,
        config.database.host,
        config.database.port
    );

    smol::block_on(async {
        println!("━━━ Test 1: SSH login ━━━");
        test_ssh_login(&config).await?;

        println!("\n━━━ Test 2: Tunnel manager ━━━");
        test_tunnel_manager(&config).await?;

        println!("\n━━━ Test 3: Query through the gateway ━━━");
        test_gateway(&config).await?;

        println!("\n━━━ Test 4: {} concurrent tunnels ━━━", concurrent);
        test_concurrent_tunnels(&config, concurrent).await?;

        println!("\n━━━ All checks passed ━━━");
        Ok(())
    })
}

async fn test_ssh_login(config: &Config) -> Result<()> {
    SshTunnel::test_ssh_connection(&config.tunnel_config()).await?;
    println!("  ✓ Authenticated to {} as '{}'", config.bastion.host, config.bastion.user);
    Ok(())
}

async fn test_tunnel_manager(config: &Config) -> Result<()> {
    let connector = Arc::new(SshConnector::new(config.tunnel_config()));
    let mut tunnels = TunnelManager::new(connector, config.connect_timeout());

    let handle = tunnels.ensure_tunnel().await?;
    let (id, addr) = (handle.id(), handle.local_addr());
    println!("  ✓ Tunnel {} listening on {}", id, addr);

    let again = tunnels.ensure_tunnel().await?.id();
    anyhow::ensure!(again == id, "live tunnel was not reused");
    println!("  ✓ Live tunnel reused");

    tunnels.close().await;
    smol::Timer::after(Duration::from_millis(200)).await;
    anyhow::ensure!(
        smol::net::TcpStream::connect(addr).await.is_err(),
        "local port {} still accepting after close",
        addr.port()
    );
    println!("  ✓ Tunnel closed, port {} released", addr.port());
    Ok(())
}

async fn test_gateway(config: &Config) -> Result<()> {
    let gateway = QueryGateway::new(config);

    let rows = gateway.execute("SELECT 1 AS ok", ()).await?;
    let ok = rows
        .first()
        .and_then(|row| row.get_by_name("ok"))
        .and_then(|value| value.as_i64());
    anyhow::ensure!(ok == Some(1), "unexpected result {:?}", rows);
    println!("  ✓ SELECT 1 returned {}", serde_json::to_string(&rows[0])?);

    gateway.mark_broken().await;
    gateway.execute("SELECT 1", ()).await?;
    println!("  ✓ Reconnected after the connection was marked broken");

    if let Some(state) = gateway.state().await {
        println!("  → {}", serde_json::to_string(&state)?);
    }

    gateway.shutdown().await;
    println!("  ✓ Gateway shut down");
    Ok(())
}

async fn test_concurrent_tunnels(config: &Config, count: usize) -> Result<()> {
    let tasks: Vec<_> = (0..count)
        .map(|_| {
            let connector = Arc::new(SshConnector::new(config.tunnel_config()));
            let timeout = config.connect_timeout();
            smol::spawn(async move {
                let mut tunnels = TunnelManager::new(connector, timeout);
                let port = tunnels.ensure_tunnel().await.map(|h| h.local_port());
                (port, tunnels)
            })
        })
        .collect();

    let mut ports = HashSet::new();
    let mut managers = Vec::new();
    for task in tasks {
        let (port, tunnels) = task.await;
        managers.push(tunnels);
        let port = port?;
        println!("  → tunnel on local port {}", port);
        ports.insert(port);
    }

    for tunnels in managers.iter_mut() {
        tunnels.close().await;
    }

    anyhow::ensure!(ports.len() == count, "local ports collided: {:?}", ports);
    println!("  ✓ {} tunnels, {} distinct ports", count, ports.len());
    Ok(())
}
