//! Chips Runtime 命令行入口
//!
//! # 命令概览
//!
//! - `start` - 安装描述目录中的模块，启动运行时，Ctrl+C 后有序关闭
//! - `check-config` - 验证配置文件
//! - `list-modules` - 安装并解析描述目录中的模块，列出结果
//! - `version` - 显示版本信息
//!
//! # 使用示例
//!
//! ```bash
//! # 使用默认配置启动
//! chips-runtime start
//!
//! # 使用自定义配置文件启动
//! chips-runtime -c my-config.yaml start
//!
//! # 检查配置文件
//! chips-runtime check-config -c config.yaml
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{info, warn};

use chips_runtime::module::discover_descriptors;
use chips_runtime::{
    LogGuard, Logger, LoggerConfig, ModuleRuntime, ModuleSnapshot, RuntimeConfig, StartOptions,
};

/// Chips Runtime - 薯片动态模块运行时
#[derive(Parser)]
#[command(name = "chips-runtime")]
#[command(version, about = "薯片动态模块运行时", long_about = None)]
#[command(author = "Chips Team")]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// 日志级别 (trace, debug, info, warn, error)，覆盖配置文件
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 开发模式
    #[arg(long, global = true)]
    dev: bool,

    /// 子命令
    #[command(subcommand)]
    command: Option<Commands>,
}

/// 可用的子命令
#[derive(Subcommand)]
enum Commands {
    /// 启动运行时
    ///
    /// 安装描述目录中的模块，升到起始级别并启动 auto_start 中的模块。
    /// 按 Ctrl+C 有序关闭。
    Start,

    /// 验证配置文件
    CheckConfig {
        /// 配置文件路径（不指定则使用全局 -c 选项）
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// 列出模块
    ///
    /// 安装并解析描述目录中的模块（以及持久化的模块记录），显示各模块状态。
    ListModules,

    /// 查看版本信息
    Version,
}

/// 加载配置：文件（不存在时用默认值）、环境变量、命令行
async fn load_config(path: &Path, cli: &Cli) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
    let mut config = if path.exists() {
        RuntimeConfig::from_file(path).await?
    } else {
        RuntimeConfig::default()
    };
    config.apply_env()?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.dev {
        config.dev_mode = true;
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &RuntimeConfig) -> LogGuard {
    let mut logger_config = LoggerConfig::from_log_config(&config.logging);
    if config.dev_mode {
        logger_config = logger_config.with_level("debug");
    }
    Logger::try_init(logger_config)
}

/// 安装描述目录中的所有模块
async fn install_discovered(runtime: &ModuleRuntime) -> usize {
    let dirs = runtime.config().modules.descriptor_dirs.clone();
    let mut installed = 0;
    for (location, descriptor) in discover_descriptors(&dirs).await {
        match runtime.install(&location, descriptor).await {
            Ok(id) => {
                info!(module_id = %id, location = location.as_str(), "已安装模块");
                installed += 1;
            }
            Err(e) => warn!(location = location.as_str(), error = %e, "安装模块失败"),
        }
    }
    installed
}

/// 启动运行时
async fn run_start(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = ModuleRuntime::new(config).await?;
    let installed = install_discovered(&runtime).await;
    runtime.launch().await?;

    for name in runtime.config().modules.auto_start.clone() {
        let candidates = runtime.find_by_symbolic_name(&name);
        if candidates.is_empty() {
            warn!(symbolic_name = name.as_str(), "auto_start 模块未安装");
        }
        for module in candidates {
            if let Err(e) = runtime.start(module.id, StartOptions::USE_ACTIVATION_POLICY).await {
                warn!(module_id = %module.id, error = %e, "自动启动模块失败");
            }
        }
    }

    println!();
    println!("薯片动态模块运行时已启动");
    println!("═══════════════════════════════════════");
    println!("  版本:       {}", chips_runtime::VERSION);
    println!("  活动级别:   {}", runtime.active_level());
    println!("  新安装模块: {}", installed);
    println!("  模块总数:   {}", runtime.modules().len());
    println!();
    println!("  按 Ctrl+C 有序关闭");
    println!("═══════════════════════════════════════");
    println!();

    signal::ctrl_c().await?;

    info!("收到关闭信号，正在关闭...");
    runtime.shutdown().await?;
    Ok(())
}

/// 检查配置文件
async fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("检查配置文件: {}", path.display());
    println!();

    if !path.exists() {
        println!("⚠️  配置文件不存在，将使用默认配置");
        println!();
        print_config(&RuntimeConfig::default());
        return Ok(());
    }

    let config = match RuntimeConfig::from_file(path).await {
        Ok(config) => config,
        Err(e) => {
            println!("❌ 配置文件无效: {}", e);
            return Err(Box::new(e));
        }
    };
    if let Err(e) = config.validate() {
        println!("❌ 配置值无效: {}", e);
        return Err(Box::new(e));
    }
    println!("✅ 配置文件有效！");
    println!();
    print_config(&config);
    Ok(())
}

fn print_config(config: &RuntimeConfig) {
    let modules = &config.modules;
    println!("────────────────────────────────────────");
    println!("  [模块配置]");
    println!("    初始模块级别:   {}", modules.initial_module_level);
    println!("    起始活动级别:   {}", modules.beginning_level);
    println!("    状态变更超时:   {} ms", modules.state_change_timeout_ms);
    println!("    允许重复标识:   {}", if modules.allow_duplicate_names { "是" } else { "否" });
    println!("    启动委派:       {:?}", modules.boot_delegation);
    println!("    系统包:         {}", modules.system_packages.len());
    println!("    描述目录:       {:?}", modules.descriptor_dirs);
    println!("    自动启动:       {:?}", modules.auto_start);
    println!();
    println!("  [日志配置]");
    println!("    日志级别:       {}", config.logging.level);
    println!("    文件输出:       {}", if config.logging.file_output { "是" } else { "否" });
    println!("    JSON 格式:      {}", if config.logging.json_format { "是" } else { "否" });
    println!();
    println!("  [其他]");
    println!("    事件排空超时:   {} ms", config.events.flush_timeout_ms);
    println!("    开发模式:       {}", if config.dev_mode { "是" } else { "否" });
    if let Some(data_dir) = &config.data_dir {
        println!("    数据目录:       {}", data_dir.display());
    }
    println!("────────────────────────────────────────");
}

/// 列出模块
async fn list_modules(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = ModuleRuntime::new(config).await?;
    install_discovered(&runtime).await;
    runtime.resolve(&[]).await?;

    println!();
    println!("{:>4}  {:<12} {:>5}  {:<32} {:<10} 位置", "ID", "状态", "级别", "符号名", "版本");
    println!("═══════════════════════════════════════════════════════════════════════════");
    for module in runtime.modules() {
        print_module(&module);
    }
    println!();

    runtime.shutdown().await?;
    Ok(())
}

fn print_module(module: &ModuleSnapshot) {
    println!(
        "{:>4}  {:<12} {:>5}  {:<32} {:<10} {}{}",
        module.id,
        module.state,
        module.start_level,
        module.symbolic_name.as_deref().unwrap_or("-"),
        module.version,
        module.location,
        if module.removal_pending { " (待移除)" } else { "" }
    );
}

fn print_version() {
    println!();
    println!("Chips Runtime - 薯片动态模块运行时");
    println!("═══════════════════════════════════════");
    println!("  版本:     {}", chips_runtime::VERSION);
    println!("  目标平台: {}", std::env::consts::ARCH);
    println!("  操作系统: {}", std::env::consts::OS);
    println!("═══════════════════════════════════════");
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Start) | None => {
            let config = load_config(&cli.config, &cli).await?;
            let _guard = init_logging(&config);
            run_start(config).await?;
        }
        Some(Commands::CheckConfig { config }) => {
            let path = config.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&path).await?;
        }
        Some(Commands::ListModules) => {
            let config = load_config(&cli.config, &cli).await?;
            let _guard = init_logging(&config);
            list_modules(config).await?;
        }
        Some(Commands::Version) => print_version(),
    }

    Ok(())
}
