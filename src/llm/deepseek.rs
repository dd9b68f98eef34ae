//! DeepSeek API 客户端（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat（常规对话，SQL 生成足够）, deepseek-reasoner（思考模式，用于高复杂度阶段）

use std::sync::Arc;
use std::time::Duration;

use crate::llm::{ModelCapabilities, ModelRouter, OpenAiClient, RoutingLlmClient};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// 创建 DeepSeek 客户端
///
/// - 优先使用环境变量 `DEEPSEEK_API_KEY`，其次 `OPENAI_API_KEY`
/// - 模型可通过 `model` 参数或 `DEEPSEEK_MODEL` 环境变量指定
pub fn create_deepseek_client(model: Option<&str>, request_timeout: Duration) -> OpenAiClient {
    let api_key = std::env::var("DEEPSEEK_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .unwrap_or_else(|| "sk-placeholder".to_string());

    let model = model
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
        .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());

    OpenAiClient::new(Some(DEEPSEEK_BASE_URL), &model, Some(api_key.as_str()))
        .with_request_timeout(request_timeout)
}

/// deepseek-chat 承担常规阶段，高复杂度阶段路由到 deepseek-reasoner
pub fn create_deepseek_router(request_timeout: Duration) -> RoutingLlmClient {
    let mut router = ModelRouter::new();
    router.add_model(
        ModelCapabilities::new(DEEPSEEK_CHAT)
            .with_sql(80)
            .with_reasoning(70)
            .with_speed(85)
            .with_cost(90),
        Arc::new(create_deepseek_client(Some(DEEPSEEK_CHAT), request_timeout)),
    );
    router.add_model(
        ModelCapabilities::new(DEEPSEEK_REASONER)
            .with_sql(85)
            .with_reasoning(95)
            .with_speed(30)
            .with_cost(40),
        Arc::new(create_deepseek_client(Some(DEEPSEEK_REASONER), request_timeout)),
    );
    RoutingLlmClient::new(router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Complexity, LlmPolicy};

    #[test]
    fn test_router_sends_complex_drafts_to_reasoner() {
        let client = create_deepseek_router(Duration::from_secs(5));
        let router = client.router();
        let high = LlmPolicy::new("sql_draft").with_complexity(Complexity::High);
        let medium = LlmPolicy::new("plan:template").with_complexity(Complexity::Medium);
        assert_eq!(router.model_name(router.select_index(&high).unwrap()), Some(DEEPSEEK_REASONER));
        assert_eq!(router.model_name(router.select_index(&medium).unwrap()), Some(DEEPSEEK_CHAT));
    }
}
