use clap::Parser;
use http_socks_gateway::common::config::Config;
use http_socks_gateway::common::logger;
use http_socks_gateway::{GatewayService, LogForwarder};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: String,

    #[arg(short = 'p', long, value_name = "PORT")]
    listen_port: Option<u16>,

    #[arg(long, value_name = "HOST")]
    upstream_host: Option<String>,

    #[arg(long, value_name = "PORT")]
    upstream_port: Option<u16>,

    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[arg(long, value_name = "SIZE")]
    buffer_size: Option<usize>,

    #[arg(long, value_name = "SECONDS")]
    connect_timeout: Option<u64>,

    #[arg(long, value_name = "SECONDS")]
    handshake_timeout: Option<u64>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    dump_config: bool,
}

fn main() {
    let args = Args::parse();

    let mut config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    if let Some(listen_port) = args.listen_port {
        config.listen_port = listen_port;
    }
    if let Some(upstream_host) = args.upstream_host {
        config.upstream_host = upstream_host;
    }
    if let Some(upstream_port) = args.upstream_port {
        config.upstream_port = upstream_port;
    }
    if let Some(log_level) = args.log_level {
        config.log.level = log_level;
    }
    if let Some(buffer_size) = args.buffer_size {
        config.buffer_size = buffer_size;
    }
    if let Some(connect_timeout) = args.connect_timeout {
        config.connect_timeout = connect_timeout;
    }
    if let Some(handshake_timeout) = args.handshake_timeout {
        config.handshake_timeout = handshake_timeout;
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if args.dump_config {
        match config.to_toml() {
            Ok(rendered) => print!("{}", rendered),
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = logger::setup_logger(config.log.clone()) {
        eprintln!("Failed to initialize logger: {}", e);
        logger::install_fallback_logger();
    }

    log::info!("Starting with config: {:?}", config);

    let mut gateway =
        GatewayService::with_options(Arc::new(LogForwarder), config.session_options());

    if !gateway.start(
        config.listen_port,
        &config.upstream_host,
        config.upstream_port,
    ) {
        log::error!("Failed to listen on 127.0.0.1:{}", config.listen_port);
        std::process::exit(1);
    }

    println!(
        "HTTP proxy listening on 127.0.0.1:{}",
        gateway.listen_port()
    );
    println!(
        "Forwarding through SOCKS5 {}:{}",
        config.upstream_host, config.upstream_port
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to create signal runtime: {}", e);
            gateway.stop();
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
        log::error!("Failed to wait for shutdown signal: {}", e);
    } else {
        log::info!("Received shutdown signal");
    }

    gateway.stop();
}
