//! Tipos de dados para requisições e respostas da API Anthropic Messages.
//!
//! Todas as structs derivam `Serialize` e `Deserialize` para conversão JSON
//! conforme o formato esperado pelo endpoint `v1/messages` da Anthropic.

use serde::{Deserialize, Serialize};

/// Corpo da requisição para o endpoint `/v1/messages` da API Anthropic.
///
/// Usado pelo roteador, pelo gerador de prompts e pelo revisor de triagem.
/// Campos opcionais são omitidos do JSON quando ausentes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    /// Identificador do modelo a ser usado (ex.: "claude-haiku-4-5-20251001").
    pub model: String,
    /// Número máximo de tokens na resposta gerada pelo modelo.
    pub max_tokens: u32,
    /// Prompt de sistema opcional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Temperatura de amostragem; classificações usam valores baixos.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Lista de mensagens compondo a conversa.
    pub messages: Vec<Message>,
}

impl MessagesRequest {
    /// Requisição de uma única mensagem de usuário.
    pub fn user(model: impl Into<String>, max_tokens: u32, content: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            system: None,
            temperature: None,
            messages: vec![Message {
                role: "user".into(),
                content: content.into(),
            }],
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Uma única mensagem em uma conversa com a API Anthropic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Papel do remetente: "user" ou "assistant".
    pub role: String,
    /// Conteúdo textual da mensagem.
    pub content: String,
}

/// Resposta retornada pelo endpoint `/v1/messages` da API Anthropic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Identificador único da resposta (gerado pela API).
    pub id: String,
    /// Blocos de conteúdo na resposta (normalmente texto).
    pub content: Vec<ContentBlock>,
    /// Modelo que gerou a resposta.
    pub model: String,
    /// Motivo da parada da geração (ex.: "end_turn", "max_tokens").
    pub stop_reason: Option<String>,
    /// Estatísticas de uso de tokens (entrada e saída).
    pub usage: Usage,
}

impl MessagesResponse {
    /// Concatena os blocos de texto da resposta, sem espaços nas bordas.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.content_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("")
            .trim()
            .to_string()
    }
}

/// Um bloco de conteúdo dentro da resposta.
///
/// O campo `content_type` é serializado como `"type"` no JSON via `serde(rename)`.
/// Blocos que não são texto chegam com `text` vazio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

/// Estatísticas de consumo de tokens para uma chamada à API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_skipped() {
        let req = MessagesRequest::user("claude-haiku-4-5-20251001", 256, "Hello");
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("system").is_none());
        assert!(json.get("temperature").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn builder_sets_system_and_temperature() {
        let req = MessagesRequest::user("m", 10, "hi")
            .with_system("be terse")
            .with_temperature(0.1);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["system"], "be terse");
        assert!((json["temperature"].as_f64().unwrap() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn content_block_type_field_renames_correctly() {
        let block = ContentBlock {
            content_type: "text".into(),
            text: "hello".into(),
        };
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains(r#""type""#));
        assert!(!json.contains("content_type"));
    }

    #[test]
    fn response_text_joins_text_blocks_only() {
        let api_json = r#"{
            "id": "msg_123",
            "content": [
                {"type": "text", "text": "  {\"specialist\":"},
                {"type": "tool_use"},
                {"type": "text", "text": " \"web\"}  "}
            ],
            "model": "claude-haiku-4-5-20251001",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 15}
        }"#;
        let resp: MessagesResponse = serde_json::from_str(api_json).unwrap();
        assert_eq!(resp.text(), r#"{"specialist": "web"}"#);
    }

    #[test]
    fn messages_response_null_stop_reason() {
        let json = r#"{
            "id": "msg_456",
            "content": [],
            "model": "test",
            "stop_reason": null,
            "usage": {"input_tokens": 0, "output_tokens": 0}
        }"#;
        let resp: MessagesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.stop_reason, None);
        assert_eq!(resp.text(), "");
    }
}
