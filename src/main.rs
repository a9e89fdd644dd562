use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crawler_config::AppConfig;
use crawler_platform::{app, logging};

#[derive(Parser)]
#[command(name = "crawler-platform", about = "分布式爬虫任务调度平台", version)]
struct Cli {
    /// 配置文件路径（TOML）
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动主节点（控制面 + 内嵌工作节点）
    Master,
    /// 启动工作节点
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Master => {
            config.node.is_master = true;
            app::run_master(config).await
        }
        Commands::Worker => {
            config.node.is_master = false;
            app::run_worker(config).await
        }
    }
}
