//! Triage CLI
//!
//! 入口：初始化日志、加载配置并构建编排器，提交一条查询，把事件逐行以 JSON 输出到 stdout。
//!
//! 用法：triage [--config PATH] [--user ID] [--conversation ID] [--persona P] [--blocking] MESSAGE...

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use triage::config::load_config;
use triage::core::OrchestratorBuilder;
use triage::observability;
use triage::pipeline::Persona;

/// 提交一条客服查询，事件以 JSON 行输出
#[derive(Parser, Debug)]
#[command(name = "triage")]
#[command(version, about, long_about = None)]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long = "user", value_name = "ID", default_value = "cli-user")]
    user_id: String,

    /// 默认为 <user>-cli
    #[arg(long = "conversation", value_name = "ID")]
    conversation_id: Option<String>,

    #[arg(long, value_enum, default_value_t = Persona::Customer)]
    persona: Persona,

    /// 只输出最终裁决
    #[arg(long)]
    blocking: bool,

    /// 查询内容
    #[arg(required = true, num_args = 1.., value_name = "MESSAGE")]
    message: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();
    let message = cli.message.join(" ");
    let conversation_id = cli
        .conversation_id
        .clone()
        .unwrap_or_else(|| format!("{}-cli", cli.user_id));

    let config = load_config(cli.config.clone()).context("Failed to load config")?;
    let orchestrator = OrchestratorBuilder::new(config)
        .build()
        .context("Failed to build orchestrator")?;

    if cli.blocking {
        let result = orchestrator
            .submit_query_blocking(&cli.user_id, &conversation_id, &message, cli.persona)
            .await;
        match result {
            Ok(verdict) => println!("{}", serde_json::to_string_pretty(&verdict)?),
            Err(e) => {
                orchestrator.tasks().wait_idle(Duration::from_secs(2)).await;
                return Err(e).context("Run failed");
            }
        }
    } else {
        let mut handle =
            orchestrator.submit_query(&cli.user_id, &conversation_id, &message, cli.persona);
        tracing::info!(run_id = %handle.run_id(), "Streaming events");
        loop {
            tokio::select! {
                event = handle.next_event() => match event {
                    Some(event) => println!("{}", serde_json::to_string(&event)?),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, cancelling run");
                    handle.cancel();
                }
            }
        }
        if let Err(e) = handle.outcome().await {
            tracing::warn!(error = %e, "Run ended without a verdict");
        }
    }

    // 后台写回（上下文、记忆、摘要）在进程退出前尽量完成
    let settled = orchestrator.tasks().wait_idle(Duration::from_secs(2)).await;
    tracing::info!(settled, stats = ?orchestrator.tasks().stats(), "Detached tasks drained");
    Ok(())
}
