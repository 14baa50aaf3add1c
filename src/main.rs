use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use keyturn::config::Settings;
use keyturn::tenant::TenantManager;
use keyturn::wire;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    keyturn::observability::init(settings.metrics_port)?;
    let tls_acceptor = settings.tls.as_ref().map(|files| files.acceptor()).transpose()?;

    std::fs::create_dir_all(&settings.data_dir)?;
    let tenant_manager = Arc::new(TenantManager::new(
        settings.data_dir.clone(),
        settings.compact_threshold,
        settings.payment_grace,
    ));
    let max_connections = settings.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));
    let password = settings.password.clone();

    let listener = TcpListener::bind(settings.addr()).await?;
    settings.log_startup();

    // SIGTERM or ctrl-c stops the accept loop; open sessions get a drain window.
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!(%peer, max_connections, "connection limit reached; refusing");
                        metrics::counter!(keyturn::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!(%peer, "renter or owner client connected");
                metrics::counter!(keyturn::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(keyturn::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let tm = tenant_manager.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, tm, pw, tls).await {
                        tracing::error!(%peer, error = %e, "connection ended with an error");
                    }
                    metrics::gauge!(keyturn::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    drain(&semaphore, max_connections, Duration::from_secs(10)).await;
    info!("keyturn stopped");
    Ok(())
}

/// Wait until every connection permit is back, or give up after `within`.
async fn drain(semaphore: &Semaphore, max_connections: usize, within: Duration) {
    let open = || max_connections - semaphore.available_permits();
    info!(open = open(), "draining connections");
    let settled = tokio::time::timeout(within, async {
        while open() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    match settled {
        Ok(()) => info!("all connections drained"),
        Err(_) => tracing::warn!(open = open(), "drain timeout, closing with connections open"),
    }
}
