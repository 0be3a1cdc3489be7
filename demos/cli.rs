use anyhow::{Context, Result, bail};
use gopi_rpc::{
    ClientConnection, ClientPool, Discovery, Driver, Module, Publisher, RpcConfig, Server,
    ServiceProxy, TransportFlags,
};
use serde::{Deserialize, Serialize};
use std::{env, process, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const PROTOCOL: &str = "gopi";

#[derive(Serialize, Deserialize)]
struct HelloRequest {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct HelloReply {
    message: String,
}

struct Greeter(ClientConnection);

impl ServiceProxy for Greeter {
    const SERVICE: &'static str = "helloworld";

    fn bind(conn: ClientConnection) -> Self {
        Greeter(conn)
    }
}

impl Greeter {
    async fn say_hello(&self, name: &str) -> gopi_rpc::Result<String> {
        let reply: HelloReply = self
            .0
            .call(
                Self::SERVICE,
                "say_hello",
                &HelloRequest {
                    name: name.to_string(),
                },
            )
            .await?;
        Ok(reply.message)
    }
}

fn load_config(path: Option<&String>) -> Result<RpcConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from '{}'", path);
            RpcConfig::load(path).with_context(|| format!("load {path}"))
        }
        None => Ok(RpcConfig::default()),
    }
}

/// Serves `helloworld` and advertises it until Ctrl+C.
async fn serve(config: RpcConfig) -> Result<()> {
    let discovery = Discovery::new(&config)?;
    let server = Arc::new(Server::new(config.server.clone(), config.events.capacity)?);
    server.register(Module::new("helloworld")?.method(
        "say_hello",
        |req: HelloRequest| async move {
            Ok(HelloReply {
                message: format!("Hello, {}", req.name),
            })
        },
    )?)?;

    let mut lifecycle = server.subscribe().context("server event bus closed")?;
    let serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.start().await }
    });

    // Advertise once the listener is bound.
    while let Some(event) = lifecycle.recv().await {
        info!("[SERVER] {}", event);
        if event.kind() == gopi_rpc::EventType::ServerStarted {
            break;
        }
    }
    let record = server.service(PROTOCOL, ["v=1"])?;
    discovery.register(&record).await?;
    info!("[SERVER] advertising {}", record);

    tokio::signal::ctrl_c().await?;
    info!("[SERVER] shutting down");
    discovery.withdraw(record.name(), record.service_type()).await?;
    server.stop(false).await?;
    serving.await??;
    discovery.close().await?;
    Ok(())
}

/// Prints every change to services of `service_type` until Ctrl+C.
async fn browse(config: RpcConfig, service_type: &str) -> Result<()> {
    let discovery = Arc::new(Discovery::new(&config)?);
    let mut changes = discovery.subscribe().context("discovery event bus closed")?;
    let cancel = CancellationToken::new();

    let browsing = tokio::spawn({
        let discovery = Arc::clone(&discovery);
        let cancel = cancel.clone();
        let service_type = service_type.to_string();
        async move { discovery.browse(cancel, &service_type).await }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = changes.recv() => match event.and_then(|e| e.into_record()) {
                Some(record) if record.is_withdrawal() => info!("[BROWSE] gone: {}", record),
                Some(record) => info!("[BROWSE] seen: {}", record),
                None => break,
            },
        }
    }

    cancel.cancel();
    browsing.await??;
    discovery.close().await?;
    Ok(())
}

/// Finds a `gopi` service, connects, and greets `name`.
async fn call(config: RpcConfig, name: &str) -> Result<()> {
    let discovery = Arc::new(Discovery::new(&config)?);
    let pool = ClientPool::new(Arc::clone(&discovery), PROTOCOL, config.client.clone()).await?;
    let cancel = CancellationToken::new();
    let browsing = tokio::spawn({
        let discovery = Arc::clone(&discovery);
        let cancel = cancel.clone();
        async move { discovery.browse(cancel, PROTOCOL).await }
    });

    // Give the network a moment to answer before picking a route.
    let mut attempts = 0;
    let conn = loop {
        match pool.connect(TransportFlags::NONE).await {
            Ok(conn) => break conn,
            Err(gopi_rpc::RpcError::NoRouteAvailable(_)) if attempts < 10 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(e) => return Err(e.into()),
        }
    };
    info!("[CLIENT] connected to {} ({:?})", conn.addr(), conn.services());

    let greeter: Greeter = conn.new_service()?;
    println!("{}", greeter.say_hello(name).await?);

    conn.close().await?;
    pool.close().await?;
    cancel.cancel();
    browsing.await??;
    discovery.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} serve <config> | browse <type> [config] | call <name> [config]", args[0]);
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "serve" => serve(load_config(args.get(2))?).await,
        "browse" => browse(load_config(args.get(3))?, &args[2]).await,
        "call" => call(load_config(args.get(3))?, &args[2]).await,
        other => bail!("unknown command '{}'", other),
    };
    if let Err(e) = &result {
        error!("[ERROR] {:#}", e);
    }
    result
}
