//! 进程型工具处理器：运行「程序 + 参数模板」
//!
//! 参数模板中 {{workspace}} 替换为工作目录，{{user_id}} / {{channel_id}} 取自调用上下文，
//! 其余 {{key}} 从模型传入的 args 中取 key；执行时无 shell，直接 exec program + 替换后的参数，带超时。

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use super::registry::{ToolContext, ToolHandler};

/// 进程型处理器
#[derive(Debug, Clone)]
pub struct CommandHandler {
    tool: String,
    program: String,
    args_template: Vec<String>,
    timeout: Duration,
}

impl CommandHandler {
    pub fn new(
        tool: impl Into<String>,
        program: impl Into<String>,
        args_template: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args_template,
            timeout,
        }
    }

    /// 替换模板占位符；args 非对象时只替换上下文占位符
    fn substitute(&self, args: &Value, ctx: &ToolContext) -> Vec<String> {
        let workspace = ctx.workspace.to_string_lossy();
        let empty = serde_json::Map::new();
        let obj = args.as_object().unwrap_or(&empty);
        self.args_template
            .iter()
            .map(|tpl| {
                let mut s = tpl
                    .replace("{{workspace}}", &workspace)
                    .replace("{{user_id}}", &ctx.user_id)
                    .replace("{{channel_id}}", &ctx.channel_id);
                for (k, v) in obj {
                    let placeholder = format!("{{{{{}}}}}", k);
                    let val = match v {
                        Value::String(x) => x.clone(),
                        _ => v.to_string(),
                    };
                    s = s.replace(&placeholder, &val);
                }
                s
            })
            .collect()
    }
}

/// 在 workspace 下运行程序，超时或非零退出视为失败，返回去除首尾空白的 stdout
pub async fn run_command(
    program: &str,
    args: &[String],
    workspace: &Path,
    timeout: Duration,
) -> anyhow::Result<String> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if workspace.is_dir() {
        command.current_dir(workspace);
    }

    let child = command
        .spawn()
        .with_context(|| format!("spawn {} failed", program))?;
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| anyhow!("timeout after {}s", timeout.as_secs()))?
        .with_context(|| format!("wait for {} failed", program))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "exit {:?}: stderr {}",
            output.status.code(),
            stderr.trim()
        ));
    }
    Ok(stdout.trim().to_string())
}

#[async_trait]
impl ToolHandler for CommandHandler {
    async fn call(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let argv = self.substitute(args, ctx);
        tracing::info!(tool = %self.tool, program = %self.program, "command tool invoke");
        run_command(&self.program, &argv, &ctx.workspace, self.timeout).await
    }
}
