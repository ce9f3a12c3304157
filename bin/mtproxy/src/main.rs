// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI entry point: loads configuration, wires the shared state and
//! connection pool, starts the maintenance tasks and metrics server,
//! and runs the v4/v6 accept loops.

use std::error::Error;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mtproxy_config::Settings;
use mtproxy_core::maintenance;
use mtproxy_core::state::ProxyState;
use mtproxy_core::Orchestrator;
use mtproxy_metrics::{MetricsServer, StatsSink};
use mtproxy_net::{ConnectionPool, CoverHost, ResolvedIpCache};
use tokio::net::TcpListener;

/// Seed value for the cover-host ServerHello padding length, refined by
/// `maintenance::run_cover_cert_probe` once it has measured a real
/// response; picked to already sit inside the accepted range.
const INITIAL_COVER_CERT_LEN: usize = 2048;

#[derive(Parser)]
#[command(name = "mtproxy", version, about = "Obfuscated MTProto proxy server")]
struct Args {
    /// Path to the main TOML configuration file.
    #[arg(short = 'c', long, default_value = "mtproxy.toml")]
    config: PathBuf,

    /// Path to a secrets overlay TOML file; values here override `config`.
    #[arg(short = 's', long, default_value = "mtproxy-secret.toml")]
    secret_config: PathBuf,

    /// Log level: trace, debug, info, warn, error.
    #[arg(short = 'l', long, default_value = "info")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    simple_logger::SimpleLogger::new()
        .with_level(args.log_level)
        .init()
        .unwrap();

    let settings = Arc::new(Settings::load(&args.config, &args.secret_config)?);
    log::info!("loaded {} user(s) from configuration", settings.users.len());

    let http = reqwest::Client::new();
    let (public_ipv4, public_ipv6) = maintenance::discover_public_ips(&http).await;
    log::info!("public addresses: v4={public_ipv4:?} v6={public_ipv6:?}");

    let state = Arc::new(ProxyState::new(
        public_ipv4,
        public_ipv6,
        settings.replay_check_len,
        settings.client_ips_len,
        INITIAL_COVER_CERT_LEN,
    ));
    let stats = Arc::new(StatsSink::new());
    let pool = ConnectionPool::with_capacity(256, settings.tg_connect_timeout);
    let cover = if settings.mask {
        Some(CoverHost {
            host: settings.mask_host.clone(),
            port: settings.mask_port,
        })
    } else {
        None
    };
    let cover_cache = Arc::new(ResolvedIpCache::new());

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&settings),
        Arc::clone(&state),
        Arc::clone(&stats),
        pool,
        cover,
        cover_cache,
    ));

    spawn_maintenance_tasks(&settings, &state);

    if settings.metrics_enabled {
        spawn_metrics_server(&settings, Arc::clone(&stats)).await?;
    }

    if settings.metrics_export_links {
        print_links_once(&settings);
    }
    tokio::spawn(handle_signals(Arc::clone(&settings)));

    let mut listeners = Vec::new();
    listeners.push(tokio::spawn(accept_loop_v4(
        Arc::clone(&orchestrator),
        SocketAddrV4::new(settings.listen_addr_ipv4, settings.port),
    )));
    if let Some(v6) = settings.listen_addr_ipv6 {
        listeners.push(tokio::spawn(accept_loop_v6(
            Arc::clone(&orchestrator),
            SocketAddrV6::new(v6, settings.port, 0, 0),
        )));
    }
    if let Some(path) = &settings.listen_unix_sock {
        log::warn!("listenUnixSock={path} is configured but this build only serves TCP; ignoring");
    }

    for listener in listeners {
        let _ = listener.await;
    }
    Ok(())
}

async fn accept_loop_v4(orchestrator: Arc<Orchestrator>, addr: SocketAddrV4) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("could not bind {addr}: {err}");
            return;
        }
    };
    log::info!("listening on {addr}");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => spawn_connection(Arc::clone(&orchestrator), stream, peer),
            Err(err) => log::warn!("accept on {addr} failed: {err}"),
        }
    }
}

async fn accept_loop_v6(orchestrator: Arc<Orchestrator>, addr: SocketAddrV6) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("could not bind {addr}: {err}");
            return;
        }
    };
    log::info!("listening on {addr}");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => spawn_connection(Arc::clone(&orchestrator), stream, peer),
            Err(err) => log::warn!("accept on {addr} failed: {err}"),
        }
    }
}

fn spawn_connection(orchestrator: Arc<Orchestrator>, stream: tokio::net::TcpStream, peer: SocketAddr) {
    tokio::spawn(async move {
        orchestrator.serve(stream, peer).await;
    });
}

fn spawn_maintenance_tasks(settings: &Arc<Settings>, state: &Arc<ProxyState>) {
    let http = reqwest::Client::new();
    tokio::spawn(maintenance::run_time_sync(
        http.clone(),
        Arc::clone(state),
        settings.get_time_period,
    ));
    tokio::spawn(maintenance::run_proxy_list_refresh(
        http,
        Arc::clone(state),
        settings.proxy_info_update_period,
    ));
    if settings.mask {
        tokio::spawn(maintenance::run_cover_cert_probe(
            settings.mask_host.clone(),
            settings.mask_port,
            Arc::clone(state),
            settings.get_cert_len_period,
        ));
    }
}

async fn spawn_metrics_server(settings: &Settings, stats: Arc<StatsSink>) -> Result<(), Box<dyn Error>> {
    let server = Arc::new(MetricsServer::new(
        stats,
        settings.metrics_prefix.clone(),
        settings.metrics_whitelist.clone(),
    ));
    let addr = SocketAddrV4::new(settings.listen_addr_ipv4, settings.metrics_port);
    let listener = TcpListener::bind(addr).await?;
    log::info!("metrics listening on {addr}");
    tokio::spawn(server.serve(listener));
    Ok(())
}

fn print_links_once(settings: &Settings) {
    let host = settings.domain.clone().unwrap_or_else(|| "SERVER_IP".to_string());
    for user in &settings.users {
        log::info!("{}: {}", user.name, user.share_link(&host, settings.port, &settings.sni));
    }
}

/// SIGUSR1 traditionally drops the reference implementation into an
/// interactive debugger; there is no analogous facility here, so it
/// only logs a diagnostic snapshot. SIGUSR2 re-reads link info, which
/// is the one piece of startup-derived output that can usefully be
/// reprinted without restarting.
async fn handle_signals(settings: Arc<Settings>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut usr1 = signal(SignalKind::user_defined1()).expect("SIGUSR1 handler");
        let mut usr2 = signal(SignalKind::user_defined2()).expect("SIGUSR2 handler");
        loop {
            tokio::select! {
                _ = usr1.recv() => {
                    log::info!("SIGUSR1 received: active connections is the only live diagnostic exposed here");
                }
                _ = usr2.recv() => {
                    log::info!("SIGUSR2 received: reprinting share links");
                    print_links_once(&settings);
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = settings;
        std::future::pending::<()>().await;
    }
}
