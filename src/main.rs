use anyhow::Context;
use sipflow::config::Config;
use sipflow::infrastructure::persistence::InMemoryLocationStore;
use sipflow::infrastructure::protocols::sip::{
    DigestAuth, OptionsHandler, Registrar, SipMethod, SipServer, TransactionLayer, TransportFacade, UdpTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// How often stale digest nonces are dropped
const NONCE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting sipflow");

    // Load configuration
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).context("loading configuration")?;
    info!("Configuration loaded: {:?}", config.sip);

    // Start UDP transport
    let mut udp = UdpTransport::new(config.bind_addr()?);
    udp.start().await?;
    let mut incoming = udp
        .take_receiver()
        .context("UDP receiver already taken")?;
    let transport: Arc<dyn TransportFacade> = Arc::new(udp);

    let transactions = Arc::new(
        TransactionLayer::new(transport, config.sip_timers()).with_timer_c(Some(config.timer_c())),
    );
    transactions.start();

    // Provision users
    let location = Arc::new(InMemoryLocationStore::new());
    let auth = Arc::new(DigestAuth::new(&config.sip.realm));
    for user in &config.users {
        location.add_static_user(&user.name, &user.contacts).await;
        if let Some(password) = &user.password {
            auth.add_user(&user.name, password).await;
        }
    }
    info!("Provisioned {} users", config.users.len());

    let cleanup_auth = auth.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(NONCE_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            cleanup_auth.cleanup_nonces().await;
        }
    });

    let mut registrar = Registrar::new(location.clone(), config.registrar_settings());
    if config.registrar.registrar_authentication {
        registrar = registrar.with_auth(auth.clone());
    }

    let mut server = SipServer::new(config.server_profile()?, transactions.clone(), location.clone())
        .with_routing(config.routing.clone())
        .open_proxy(config.proxy.open_proxy);
    if config.proxy.proxy_authentication {
        server = server.with_proxy_auth(auth.clone());
    }
    let server = Arc::new(server);
    server
        .register_handler(SipMethod::Register, Arc::new(registrar))
        .await;
    server
        .register_handler(SipMethod::Options, Arc::new(OptionsHandler))
        .await;

    info!("sipflow listening on {}", config.bind_addr()?);

    loop {
        tokio::select! {
            message = incoming.recv() => {
                let Some(message) = message else {
                    error!("UDP transport stopped");
                    break;
                };
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.handle_incoming(message).await {
                        error!("Error processing SIP message: {}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
