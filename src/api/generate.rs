//! Charged content generation.

use crate::{
    api::ApiContext,
    core::generation::{self, GenerationRequest, GenerationResult},
    errors::Result,
    providers::ContentProvider,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Body of a generation request.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateBody {
    /// What the posts should be about
    pub idea: String,
    /// Audience or industry
    pub niche: String,
    /// One post is generated per platform
    #[serde(alias = "platforms")]
    pub targets: Vec<String>,
}

impl From<GenerateBody> for GenerationRequest {
    fn from(body: GenerateBody) -> Self {
        Self {
            idea: body.idea,
            niche: body.niche,
            targets: body.targets,
        }
    }
}

/// Charges the caller once and returns a post per target.
pub async fn generate(
    ctx: &ApiContext,
    provider: &dyn ContentProvider,
    owner_id: &str,
    body: GenerateBody,
    now: DateTime<Utc>,
) -> Result<GenerationResult> {
    let request = GenerationRequest::from(body);
    generation::generate(&ctx.database, &ctx.config, provider, owner_id, &request, now).await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::api::{ErrorBody, status_code};
    use crate::providers::{GeneratedContent, MockContentProvider};
    use crate::test_utils::*;

    #[tokio::test]
    async fn test_generate_accepts_platforms_alias() -> Result<()> {
        let ctx = ApiContext::new(setup_test_db().await?, test_config());
        let body: GenerateBody = serde_json::from_str(
            r#"{"idea": "Weekly changelog", "niche": "devtools", "platforms": ["twitter", "linkedin"]}"#,
        )
        .unwrap();

        let mut provider = MockContentProvider::new();
        provider.expect_generate().times(2).returning(|req| {
            Ok(GeneratedContent {
                text: format!("{} for {} #changelog", req.idea, req.target),
                hashtags: Vec::new(),
                media_prompt: Some("a changelog scroll".to_string()),
            })
        });

        let result = generate(&ctx, &provider, "alice", body, fixed_now()).await?;
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["posts"][1]["target"], "linkedin");
        assert_eq!(json["posts"][0]["hashtags"][0], "changelog");
        assert_eq!(json["posts"][0]["mediaPrompt"], "a changelog scroll");
        assert!(json["transactionId"].as_i64().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_balance_maps_to_payment_required() -> Result<()> {
        let ctx = ApiContext::new(setup_test_db().await?, config_with_free_credits(0));
        let body = GenerateBody {
            idea: "x".to_string(),
            niche: "y".to_string(),
            targets: vec!["twitter".to_string()],
        };
        let provider = MockContentProvider::new();

        let err = generate(&ctx, &provider, "bob", body, fixed_now()).await.unwrap_err();
        assert_eq!(status_code(&err), 402);
        let error_body = ErrorBody::from(&err);
        assert_eq!(error_body.kind, "insufficient_credits");
        assert!(error_body.message.contains("balance is 0"));
        Ok(())
    }
}
