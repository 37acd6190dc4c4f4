//! mini-ss 主程序入口
//!
//! 提供命令行界面来启动本地端或服务端

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use mini_ss::config::{self, load_config_from_file, Config, Role};
use mini_ss::dns::{Resolver, ResolverOptions};
use mini_ss::{init_logger, Runtime};
use tracing::{error, info};

/// mini-ss 命令行工具
#[derive(Parser)]
#[command(name = "mini-ss")]
#[command(about = "A Shadowsocks-family proxy suite")]
#[command(version)]
struct Cli {
    /// 覆盖配置文件中的日志级别
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// 可用的命令
#[derive(Subcommand)]
enum Commands {
    /// 启动本地端
    Local {
        /// 配置文件路径
        #[arg(short, long, default_value = "local.toml")]
        config: String,
    },
    /// 启动服务端
    Server {
        /// 配置文件路径
        #[arg(short, long, default_value = "server.toml")]
        config: String,
    },
    /// 生成配置文件模板
    GenConfig {
        /// 配置类型 (local/server)
        #[arg(value_enum)]
        config_type: ConfigType,

        /// 输出文件路径，缺省时打印到标准输出
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 使用配置中的名字服务器解析域名
    Resolve {
        /// 要解析的域名
        domain: String,

        /// 本地端配置文件，缺省时使用系统名字服务器
        #[arg(short, long)]
        config: Option<String>,
    },
}

/// 配置类型
#[derive(clap::ValueEnum, Clone, Copy)]
enum ConfigType {
    Local,
    Server,
}

impl From<ConfigType> for Role {
    fn from(t: ConfigType) -> Self {
        match t {
            ConfigType::Local => Role::Local,
            ConfigType::Server => Role::Server,
        }
    }
}

async fn run(path: &str, role: Role, log_level: Option<String>) -> Result<()> {
    let config: Config = load_config_from_file(path)?;
    init_logger(log_level.as_deref().unwrap_or(&config.log_level));
    info!("Loading {:?} config from: {}", role, path);

    let runtime = Runtime::new(config, role)?;
    runtime.start().await?;
    info!("mini-ss started");

    tokio::signal::ctrl_c().await?;
    info!("mini-ss shutting down...");
    runtime.stop().await?;
    Ok(())
}

async fn resolve(domain: &str, path: Option<String>) -> Result<()> {
    let opts = match path {
        Some(path) => {
            let config: Config = load_config_from_file(&path)?;
            let mut opts = config.resolver_options(config.tcp_dialer())?;
            opts.fake_ip = None;
            opts
        }
        None => ResolverOptions::default(),
    };
    let resolver = Resolver::new(opts).await?;
    let ips = resolver.lookup_ip(domain).await?;
    if ips.is_empty() {
        return Err(anyhow!("No address found for {}", domain));
    }
    info!("Resolution successful! Found {} addresses:", ips.len());
    for (i, ip) in ips.iter().enumerate() {
        info!("  [{}] {}", i + 1, ip);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Local { config } => run(&config, Role::Local, cli.log_level).await,
        Commands::Server { config } => run(&config, Role::Server, cli.log_level).await,
        Commands::GenConfig { config_type, output } => {
            init_logger(cli.log_level.as_deref().unwrap_or("info"));
            let content = config::template(config_type.into());
            match output {
                Some(path) => {
                    std::fs::write(&path, content)?;
                    info!("Config template generated: {}", path);
                }
                None => print!("{}", content),
            }
            Ok(())
        }
        Commands::Resolve { domain, config } => {
            init_logger(cli.log_level.as_deref().unwrap_or("info"));
            resolve(&domain, config).await
        }
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_local_command_parsing() {
        let cli = Cli::try_parse_from(["mini-ss", "local", "-c", "my.toml", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Local { config } => assert_eq!(config, "my.toml"),
            _ => panic!("Expected local command"),
        }
    }

    #[test]
    fn test_server_default_config_path() {
        let cli = Cli::try_parse_from(["mini-ss", "server"]).unwrap();
        match cli.command {
            Commands::Server { config } => assert_eq!(config, "server.toml"),
            _ => panic!("Expected server command"),
        }
    }

    #[test]
    fn test_gen_config_parsing() {
        let cli = Cli::try_parse_from(["mini-ss", "gen-config", "local", "-o", "out.toml"]).unwrap();
        match cli.command {
            Commands::GenConfig { config_type, output } => {
                assert_eq!(Role::from(config_type), Role::Local);
                assert_eq!(output.as_deref(), Some("out.toml"));
            }
            _ => panic!("Expected gen-config command"),
        }
        assert!(Cli::try_parse_from(["mini-ss", "gen-config", "client"]).is_err());
    }

    #[test]
    fn test_resolve_parsing() {
        let cli = Cli::try_parse_from(["mini-ss", "resolve", "example.com"]).unwrap();
        match cli.command {
            Commands::Resolve { domain, config } => {
                assert_eq!(domain, "example.com");
                assert!(config.is_none());
            }
            _ => panic!("Expected resolve command"),
        }
    }
}
