//! Echlink - a local SOCKS5/HTTP proxy bridged over a TLS 1.3 + ECH WebSocket

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use echlink::config::ClientConfig;
use echlink::error::Result;
use echlink::ProxyClient;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    let Some(server) = args.server else {
        eprintln!("Missing required --server address (host:port[/path])");
        print_help();
        std::process::exit(1);
    };

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let mut config = ClientConfig::new(server, args.token.unwrap_or_default());
    if let Some(ip) = args.server_ip {
        let ip = ip.parse().unwrap_or_else(|_| {
            eprintln!("Invalid --server-ip: {}", ip);
            std::process::exit(1);
        });
        config = config.with_server_ip(ip);
    }
    if let Some(dns) = args.dns_server {
        config = config.with_dns_server(dns);
    }
    if let Some(domain) = args.ech_domain {
        config = config.with_ech_domain(domain);
    }

    info!("Echlink v{} starting...", echlink::version());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let client = ProxyClient::new(config)?;
        client.start(&args.listen).await?;

        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");
        client.stop()?;
        Ok::<(), echlink::Error>(())
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    listen: String,
    server: Option<String>,
    server_ip: Option<String>,
    token: Option<String>,
    dns_server: Option<String>,
    ech_domain: Option<String>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut listen = String::from("127.0.0.1:1080");
        let mut server = None;
        let mut server_ip = None;
        let mut token = None;
        let mut dns_server = None;
        let mut ech_domain = None;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-l" | "--listen" => {
                    if i + 1 < args.len() {
                        listen = args[i + 1].clone();
                        i += 1;
                    }
                }
                "-s" | "--server" => {
                    if i + 1 < args.len() {
                        server = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--server-ip" => {
                    if i + 1 < args.len() {
                        server_ip = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "-t" | "--token" => {
                    if i + 1 < args.len() {
                        token = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--dns" => {
                    if i + 1 < args.len() {
                        dns_server = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--ech-domain" => {
                    if i + 1 < args.len() {
                        ech_domain = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            listen,
            server,
            server_ip,
            token,
            dns_server,
            ech_domain,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Echlink - local SOCKS5/HTTP proxy over a TLS 1.3 + ECH WebSocket tunnel

USAGE:
    echlink --server <ADDR> [OPTIONS]

OPTIONS:
    -l, --listen <ADDR>     Local listen address [default: 127.0.0.1:1080]
    -s, --server <ADDR>     Gateway address, host:port[/path] (required)
    --server-ip <IP>        Pin the gateway TCP dial to a fixed IP
    -t, --token <TOKEN>     Auth token, sent as the WebSocket subprotocol
    --dns <SERVER>          DNS endpoint for the ECH bootstrap
                            (host:port = UDP, otherwise DoH)
                            [default: dns.alidns.com/dns-query]
    --ech-domain <DOMAIN>   Domain queried for the ECH config list
                            [default: cloudflare-ech.com]
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    echlink -s gateway.example.com:443 -t secret
    echlink -s gateway.example.com:443/ws -t secret -l 127.0.0.1:8081
    echlink -s gateway.example.com:443 --server-ip 203.0.113.7 --dns 8.8.8.8:53
"#
    );
}

fn print_version() {
    println!("Echlink v{}", echlink::version());
    println!("Local SOCKS5/HTTP proxy bridged over TLS 1.3 + ECH WebSocket");
}
