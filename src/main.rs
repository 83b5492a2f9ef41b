mod address;
mod async_stream;
mod binder;
mod cipher_stream;
mod config;
mod copy_bidirectional;
mod country_ip;
mod doh;
mod gfw;
mod ingress;
mod line_reader;
mod prelude;
mod prepend_stream;
mod remote;
mod route_manager;
mod routing;
mod rules;
mod services;
mod system_proxy;
mod tls_util;
mod tun;
mod udp_stream;
mod util;
mod websocket;

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::runtime::Builder;

use crate::binder::InterfaceBinder;
use crate::config::{Config, InKind};
use crate::country_ip::CountryIpList;
use crate::doh::DohClient;
use crate::gfw::GfwList;
use crate::ingress::{HttpServer, IngressHandler, SocksServer, TlsServer, WssServer};
use crate::route_manager::{PeerIps, RouteManager};
use crate::services::Services;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = config::config_path_from_args(&args);

    let num_threads = std::cmp::max(
        2,
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    );

    let runtime = Builder::new_multi_thread()
        .worker_threads(num_threads)
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not build tokio runtime");

    let exit_code = runtime.block_on(run(&config_path));
    std::process::exit(exit_code);
}

async fn run(config_path: &Path) -> i32 {
    let config = match Config::load(config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return 1;
        }
    };

    init_logging(&config);
    info!("Config loaded from {}", config_path.display());

    let country_ips = if config.china_ip_file.is_empty() {
        CountryIpList::default()
    } else {
        match CountryIpList::load(Path::new(&config.china_ip_file)).await {
            Ok(list) => list,
            Err(e) => {
                error!("Failed to load country IP file {}: {}", config.china_ip_file, e);
                return 1;
            }
        }
    };

    let gfw = if config.gfw_list_file.is_empty() {
        GfwList::default()
    } else {
        match GfwList::load(Path::new(&config.gfw_list_file)).await {
            Ok(list) => list,
            Err(e) => {
                warn!("Failed to load GFW list {}: {}", config.gfw_list_file, e);
                GfwList::default()
            }
        }
    };

    let binder = Arc::new(InterfaceBinder::new());

    // When the TUN data plane will take over the default route, the original
    // gateway and interface must be captured before anything else touches
    // the routing table: DoH and all egress dials bind to that interface.
    let route_manager = if config.tun.enable {
        let device_name = if config.tun.name.is_empty() {
            tun::DEFAULT_DEVICE_NAME.to_string()
        } else {
            config.tun.name.clone()
        };
        let tun_gateway = if config.tun.address.is_empty() {
            tun::DEFAULT_ADDRESS.to_string()
        } else {
            config.tun.address.clone()
        };
        let manager = Arc::new(RouteManager::new(
            device_name,
            tun_gateway,
            Arc::new(PeerIps::default()),
        ));
        if let Err(e) = manager.backup_routes(&binder).await {
            error!("Failed to back up host routes: {}", e);
            return 1;
        }
        Some(manager)
    } else {
        None
    };

    let ecs_subnet = if config.ecs_subnet.is_empty() {
        None
    } else {
        Some(config.ecs_subnet.clone())
    };
    let doh = match DohClient::new(ecs_subnet, binder.original_ip().map(IpAddr::V4)) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to create DoH client: {}", e);
            return 1;
        }
    };
    let _sweeper = doh.spawn_sweeper();

    let in_config = config.inbound.clone();
    let system_proxy_enabled = config.system_proxy.enable;
    let tun_config = config.tun.clone();
    let services = Arc::new(Services::new(
        config,
        country_ips,
        gfw,
        doh,
        binder.clone(),
    ));

    let handler: Arc<dyn IngressHandler> = match in_config.in_kind().unwrap() {
        InKind::Socks5 => Arc::new(SocksServer::new()),
        InKind::Http => Arc::new(HttpServer::new()),
        InKind::Tls | InKind::Wss => {
            let acceptor = match tls_util::create_server_acceptor(
                &in_config.cert_file,
                &in_config.key_file,
            )
            .await
            {
                Ok(acceptor) => acceptor,
                Err(e) => {
                    error!("Failed to load TLS certificate: {}", e);
                    return 1;
                }
            };
            if in_config.in_kind() == Some(InKind::Tls) {
                Arc::new(TlsServer::new(services.clone(), acceptor))
            } else {
                Arc::new(WssServer::new(services.clone(), acceptor))
            }
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", in_config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Cannot listen on 0.0.0.0:{}: {}", in_config.port, e);
            return 1;
        }
    };
    info!("{} listening on 0.0.0.0:{}", handler.name(), in_config.port);

    let accept_task = tokio::spawn(ingress::serve(
        listener,
        handler,
        services.clone(),
    ));

    // The TUN device goes up after the listener so the loopback path it
    // forwards into is already live.
    let tun_service = if let Some(route_manager) = route_manager {
        match tun::create_device(&tun_config) {
            Ok(device) => {
                match tun::TunService::start(device, services.clone(), route_manager).await {
                    Ok(service) => Some(service),
                    Err(e) => {
                        error!("Failed to start TUN service: {}", e);
                        return 1;
                    }
                }
            }
            Err(e) => {
                error!("Failed to create TUN device: {}", e);
                return 1;
            }
        }
    } else {
        None
    };

    if system_proxy_enabled {
        system_proxy::apply(in_config.port).await;
    }

    let watcher_services = services.clone();
    let watcher_task = tokio::spawn(config::watch_config(
        config_path.to_path_buf(),
        move |new_config| {
            watcher_services.apply_config(new_config);
        },
    ));

    wait_for_shutdown_signal().await;
    info!("Received shutdown signal, gracefully shutting down...");

    let shutdown = async {
        accept_task.abort();
        watcher_task.abort();
        if let Some(service) = tun_service {
            service.stop().await;
        }
        if system_proxy_enabled {
            system_proxy::restore().await;
        }
    };

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await {
        Ok(()) => info!("Graceful shutdown completed"),
        Err(_) => warn!("Shutdown timeout, forcing exit"),
    }

    0
}

fn init_logging(config: &Config) {
    let default_level = if config.debug {
        "debug"
    } else if config.log.level.is_empty() {
        "info"
    } else {
        &config.log.level
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
