//! 助手回复后端客户端
//!
//! 助手会话的远端追加不是直接写文档库，而是 POST 给回复后端：
//! 后端负责把来信和回复两条消息一并持久化到文档库，客户端只
//! 渲染后续快照推下来的内容（加上自己的乐观条目）。

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

use crate::error::{PairchatSDKError, Result};
use crate::sdk::HttpClientConfig;

#[derive(Debug, Serialize)]
struct AskRequest<'a> {
    identity: &'a str,
    message: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantReply {
    pub reply: String,
}

/// 助手后端 HTTP 客户端
pub struct AssistantClient {
    client: Client,
    endpoint: String,
}

impl AssistantClient {
    pub fn new(config: &HttpClientConfig, endpoint: impl Into<String>) -> Result<Self> {
        let mut builder = Client::builder();

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| PairchatSDKError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        let endpoint = endpoint.into();
        info!("✅ 助手客户端已创建 (endpoint: {})", endpoint);
        Ok(Self { client, endpoint })
    }

    /// 发送一条消息给助手后端，返回回复文本
    ///
    /// 传输错误原样上抛：调用方（OptimisticWriter）负责回滚乐观条目。
    pub async fn ask(&self, identity: &str, message: &str) -> Result<AssistantReply> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&AskRequest { identity, message })
            .send()
            .await
            .map_err(|e| PairchatSDKError::Transport(format!("请求助手后端失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误信息".to_string());
            error!("❌ 助手后端返回错误，HTTP 状态码: {}, 错误: {}", status, error_text);
            return Err(PairchatSDKError::Transport(format!(
                "助手后端错误，HTTP 状态码: {} ({})",
                status, error_text
            )));
        }

        let reply: AssistantReply = response
            .json()
            .await
            .map_err(|e| PairchatSDKError::Serialization(format!("解析助手回复失败: {}", e)))?;
        Ok(reply)
    }
}
