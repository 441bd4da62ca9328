use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Translator returned status {0}")]
    Status(u16),

    #[error("Translator request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Machine-translation capability consumed by the router. `source` and
/// `target` are conferencing-side language codes; implementations own the
/// mapping to whatever the upstream service expects.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<String, TranslateError>;
}

/// Fixed mapping from conferencing language codes to the upstream
/// translator's short codes. Codes absent from this table are unsupported
/// and fail translation for that target only.
const LANGUAGE_TABLE: &[(&str, &str)] = &[
    ("ar", "ar"),
    ("az", "az"),
    ("bg-BG", "bg"),
    ("bn", "bn"),
    ("ca", "ca"),
    ("cs-CZ", "cs"),
    ("da", "da"),
    ("de", "de"),
    ("el-GR", "el"),
    ("en", "en"),
    ("eo", "eo"),
    ("es", "es"),
    ("es-419", "es"),
    ("es-ES", "es"),
    ("es-MX", "es"),
    ("et", "et"),
    ("fa-IR", "fa"),
    ("fi", "fi"),
    ("fr", "fr"),
    ("he", "he"),
    ("hi-IN", "hi"),
    ("hu-HU", "hu"),
    ("id", "id"),
    ("it-IT", "it"),
    ("ja", "ja"),
    ("ko-KR", "ko"),
    ("lt-LT", "lt"),
    ("lv", "lv"),
    ("nb-NO", "nb"),
    ("nl", "nl"),
    ("pl-PL", "pl"),
    ("pt", "pt"),
    ("pt-BR", "pt"),
    ("ro-RO", "ro"),
    ("ru", "ru"),
    ("sk-SK", "sk"),
    ("sl", "sl"),
    ("sv-SE", "sv"),
    ("th", "th"),
    ("tr-TR", "tr"),
    ("uk-UA", "uk"),
    ("zh-CN", "zh"),
];

/// Map a conferencing language code to the upstream translator's code.
pub fn to_translator_code(code: &str) -> Option<&'static str> {
    LANGUAGE_TABLE
        .iter()
        .find(|(bbb, _)| *bbb == code)
        .map(|(_, upstream)| *upstream)
}

/// All conferencing language codes the translator backend supports.
pub fn supported_languages() -> Vec<&'static str> {
    LANGUAGE_TABLE.iter().map(|(bbb, _)| *bbb).collect()
}

#[derive(Serialize)]
struct TranslationRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
}

#[derive(Deserialize)]
struct TranslationResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

/// HTTP client for a LibreTranslate-compatible service.
pub struct HttpTranslator {
    client: reqwest::Client,
    url: String,
}

impl HttpTranslator {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<String, TranslateError> {
        let upstream_target = to_translator_code(target)
            .ok_or_else(|| TranslateError::UnsupportedLanguage(target.to_string()))?;

        let request = TranslationRequest {
            q: text,
            source,
            target: upstream_target,
        };

        let response = self.client.post(&self.url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(TranslateError::Status(response.status().as_u16()));
        }

        let body: TranslationResponse = response.json().await?;
        Ok(body.translated_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_language_table_mapping() {
        assert_eq!(to_translator_code("de"), Some("de"));
        assert_eq!(to_translator_code("bg-BG"), Some("bg"));
        assert_eq!(to_translator_code("zh-CN"), Some("zh"));
        assert_eq!(to_translator_code("es-419"), Some("es"));
        assert_eq!(to_translator_code("pt-BR"), Some("pt"));
        assert_eq!(to_translator_code("tlh"), None);
    }

    #[test]
    fn test_supported_languages_snapshot() {
        let languages = supported_languages();
        assert_eq!(languages.len(), 42);
        assert!(languages.contains(&"en"));
        assert!(languages.contains(&"uk-UA"));
    }

    /// Serve exactly one HTTP response on an ephemeral port.
    async fn one_shot_http(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/translate")
    }

    #[tokio::test]
    async fn test_http_translator_success() {
        let url = one_shot_http("HTTP/1.1 200 OK", r#"{"translatedText":"hallo"}"#).await;
        let translator = HttpTranslator::new(url);
        let out = translator.translate("hello", "en", "de").await.unwrap();
        assert_eq!(out, "hallo");
    }

    #[tokio::test]
    async fn test_http_translator_non_200_is_failure() {
        let url = one_shot_http("HTTP/1.1 500 Internal Server Error", "{}").await;
        let translator = HttpTranslator::new(url);
        match translator.translate("hello", "en", "de").await {
            Err(TranslateError::Status(500)) => {}
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_translator_unsupported_language_skips_request() {
        // No server behind the URL: the mapping failure must short-circuit
        // before any HTTP is attempted.
        let translator = HttpTranslator::new("http://127.0.0.1:9/translate");
        match translator.translate("hello", "en", "xx-YY").await {
            Err(TranslateError::UnsupportedLanguage(code)) => assert_eq!(code, "xx-YY"),
            other => panic!("expected unsupported language, got {other:?}"),
        }
    }
}
