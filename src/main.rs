mod config;
mod handler;
#[cfg(test)]
mod mock;
mod query;
mod resolver;
mod server;
mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{RelayConfig, load_config, load_resolv_conf, normalize_nameservers};

#[derive(Parser, Debug)]
#[command(author, version, about = "DNS forwarding proxy racing ordered upstream nameservers", long_about = None)]
struct Args {
    /// 配置文件路径（JSON，可选）
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// 监听地址，覆盖配置文件
    #[arg(short = 'b', long = "bind")]
    bind: Option<String>,
    /// 上游DNS（host:port），可重复，顺序即优先级；覆盖配置文件
    #[arg(short = 'n', long = "nameserver")]
    nameservers: Vec<String>,
    /// 未配置上游时读取的 resolv.conf
    #[arg(long = "resolv-conf", default_value = "/etc/resolv.conf")]
    resolv_conf: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// 以 JSON 格式输出日志
    #[arg(long = "log-json", default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.log_json);

    let mut cfg = match args.config.as_deref() {
        Some(path) => load_config(path).context("load config")?,
        None => RelayConfig::default(),
    };
    if let Some(bind) = args.bind {
        cfg.settings.bind = bind;
    }
    if !args.nameservers.is_empty() {
        cfg.nameservers = normalize_nameservers(&args.nameservers).context("parse nameservers")?;
    }
    if cfg.nameservers.is_empty() {
        match load_resolv_conf(&args.resolv_conf) {
            Ok(nameservers) => cfg.nameservers = nameservers,
            Err(err) => {
                error!(path = %args.resolv_conf.display(), error = %err, "parse resolv config file failed");
            }
        }
    }

    let bind: SocketAddr = cfg.settings.bind.parse().context("parse bind addr")?;
    let listeners =
        server::start(bind, cfg.nameservers.clone(), &cfg.settings).context("start listeners")?;

    info!(
        bind = %bind,
        nameservers = cfg.nameservers.len(),
        stagger_ms = cfg.settings.stagger_ms,
        upstream_timeout_ms = cfg.settings.upstream_timeout_ms,
        "dns proxy started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("signal received, stopping");
    listeners.abort();
    info!("dnsresolv done");

    Ok(())
}

fn init_tracing(debug: bool, json: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(false)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_ansi(false))
            .init();
    }
}
