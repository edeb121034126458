//! Generation gate: one credit deduction per request, then content per target.
//!
//! The charge is taken before the content provider is called and stands even if
//! the provider fails; failed targets get placeholder content instead.

use crate::{
    config::AppConfig,
    core::ledger::{self, TransactionId},
    errors::{Error, Result},
    providers::{ContentProvider, ContentRequest},
};
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tracing::{info, instrument, warn};

const REASON_IDEA_CHARS: usize = 50;

/// A request to generate posts for several targets from one idea.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// What the posts should be about
    pub idea: String,
    /// Audience or industry
    pub niche: String,
    /// Platforms, one post each
    pub targets: Vec<String>,
}

/// Generated post for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedPost {
    /// Platform the post was written for
    pub target: String,
    /// Post text with hashtags stripped
    pub content: String,
    /// Provider hashtags merged with those found in the text
    pub hashtags: Vec<String>,
    /// Prompt for an accompanying image
    pub media_prompt: Option<String>,
    /// Set when the provider failed and this is fallback text
    pub placeholder: bool,
}

/// Outcome of a charged generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    /// Ledger row of the single deduction
    pub transaction_id: TransactionId,
    /// One post per requested target, in request order
    pub posts: Vec<GeneratedPost>,
}

/// Charges `ledger.generation_cost` once, then generates a post per target.
///
/// Fails with [`Error::InsufficientCredits`] before any provider call when the
/// balance is too low.
#[instrument(skip(db, config, provider, request), fields(targets = request.targets.len()))]
pub async fn generate(
    db: &DatabaseConnection,
    config: &AppConfig,
    provider: &dyn ContentProvider,
    owner_id: &str,
    request: &GenerationRequest,
    now: DateTime<Utc>,
) -> Result<GenerationResult> {
    let idea = request.idea.trim();
    let niche = request.niche.trim();
    if idea.is_empty() || niche.is_empty() {
        return Err(Error::InvalidRequest {
            message: "idea and niche are required".to_string(),
        });
    }
    let mut targets: Vec<&str> = Vec::new();
    for target in &request.targets {
        let target = target.trim();
        if !target.is_empty() && !targets.contains(&target) {
            targets.push(target);
        }
    }
    if targets.is_empty() {
        return Err(Error::InvalidRequest {
            message: "at least one target is required".to_string(),
        });
    }

    let reason = format!(
        "Generated content for: {}",
        idea.chars().take(REASON_IDEA_CHARS).collect::<String>()
    );
    let transaction_id =
        ledger::deduct(db, config, owner_id, config.ledger.generation_cost, &reason, now).await?;

    let mut posts = Vec::with_capacity(targets.len());
    for target in targets {
        let content_request = ContentRequest {
            idea: idea.to_string(),
            niche: niche.to_string(),
            target: target.to_string(),
        };
        let post = match provider.generate(&content_request).await {
            Ok(generated) => {
                let (content, mut hashtags) = split_hashtags(&generated.text);
                for tag in generated.hashtags {
                    let tag = tag.trim_start_matches('#').to_string();
                    if !tag.is_empty() && !hashtags.contains(&tag) {
                        hashtags.push(tag);
                    }
                }
                GeneratedPost {
                    target: target.to_string(),
                    content,
                    hashtags,
                    media_prompt: generated
                        .media_prompt
                        .map(|prompt| prompt.trim().to_string())
                        .or_else(|| Some(fallback_media_prompt(&content_request))),
                    placeholder: false,
                }
            }
            Err(err) => {
                warn!(owner_id, platform = target, error = %err, "Content provider failed, using placeholder");
                placeholder_post(&content_request)
            }
        };
        posts.push(post);
    }

    info!(owner_id, transaction_id, posts = posts.len(), "Generation request served");
    Ok(GenerationResult {
        transaction_id,
        posts,
    })
}

/// Splits `#tags` out of `text`, returning the remaining text and the tags
/// without their `#`.
pub fn split_hashtags(text: &str) -> (String, Vec<String>) {
    let mut content = String::with_capacity(text.len());
    let mut tags = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '#' {
            content.push(c);
            continue;
        }
        let mut tag = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_alphanumeric() || next == '_' {
                tag.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if tag.is_empty() {
            content.push('#');
        } else if !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    let content = content
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    (content, tags)
}

fn fallback_media_prompt(request: &ContentRequest) -> String {
    format!(
        "Eye-catching {} image about {}: {}",
        request.target, request.niche, request.idea
    )
}

fn placeholder_post(request: &ContentRequest) -> GeneratedPost {
    let niche_tag: String = request
        .niche
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect();
    GeneratedPost {
        target: request.target.clone(),
        content: format!("{}\n\nMore on {} coming soon.", request.idea, request.niche),
        hashtags: if niche_tag.is_empty() {
            Vec::new()
        } else {
            vec![niche_tag.to_lowercase()]
        },
        media_prompt: Some(fallback_media_prompt(request)),
        placeholder: true,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::core::ledger::{get_account, transactions_for_owner};
    use crate::providers::{GeneratedContent, MockContentProvider};
    use crate::test_utils::*;

    fn request(targets: &[&str]) -> GenerationRequest {
        GenerationRequest {
            idea: "Ship faster with small PRs".to_string(),
            niche: "software teams".to_string(),
            targets: targets.iter().map(|t| (*t).to_string()).collect(),
        }
    }

    #[test]
    fn test_split_hashtags() {
        let (content, tags) = split_hashtags("Small PRs win. #devops #rust_lang\n#devops # not a tag");
        assert_eq!(content, "Small PRs win.\n# not a tag");
        assert_eq!(tags, vec!["devops", "rust_lang"]);
    }

    #[tokio::test]
    async fn test_one_deduction_covers_all_targets() -> Result<()> {
        let db = setup_test_db().await?;
        let config = test_config();

        let mut provider = MockContentProvider::new();
        provider.expect_generate().times(3).returning(|req| {
            Ok(GeneratedContent {
                text: format!("Post for {} #teams", req.target),
                hashtags: vec!["#shipping".to_string()],
                media_prompt: None,
            })
        });

        let result = generate(&db, &config, &provider, "alice", &request(&["twitter", "instagram", "facebook"]), fixed_now()).await?;

        assert_eq!(result.posts.len(), 3);
        assert_eq!(result.posts[0].content, "Post for twitter");
        assert_eq!(result.posts[0].hashtags, vec!["teams", "shipping"]);
        assert!(result.posts.iter().all(|p| !p.placeholder));
        assert_eq!(get_account(&db, "alice").await?.unwrap().balance, 499);

        let spends: Vec<_> = transactions_for_owner(&db, "alice", None)
            .await?
            .into_iter()
            .filter(|t| t.kind == "generation_spend")
            .collect();
        assert_eq!(spends.len(), 1);
        assert_eq!(spends[0].id, result.transaction_id);
        Ok(())
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back_without_refund() -> Result<()> {
        let db = setup_test_db().await?;
        let config = test_config();

        let mut provider = MockContentProvider::new();
        provider.expect_generate().returning(|req| {
            if req.target == "youtube" {
                Err(Error::ProviderUnavailable {
                    message: "rate limited".to_string(),
                })
            } else {
                Ok(GeneratedContent {
                    text: "Fine".to_string(),
                    ..Default::default()
                })
            }
        });

        let result = generate(&db, &config, &provider, "bob", &request(&["twitter", "youtube"]), fixed_now()).await?;

        assert!(!result.posts[0].placeholder);
        assert!(result.posts[1].placeholder);
        assert_eq!(result.posts[1].hashtags, vec!["softwareteams"]);
        assert_eq!(get_account(&db, "bob").await?.unwrap().balance, 499);
        Ok(())
    }

    #[tokio::test]
    async fn test_insufficient_credits_skips_provider() -> Result<()> {
        let db = setup_test_db().await?;
        let config = config_with_free_credits(0);

        let mut provider = MockContentProvider::new();
        provider.expect_generate().never();

        let result = generate(&db, &config, &provider, "carl", &request(&["twitter"]), fixed_now()).await;
        assert!(matches!(
            result,
            Err(Error::InsufficientCredits {
                balance: 0,
                required: 1
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_charged() -> Result<()> {
        let db = setup_test_db().await?;
        let config = test_config();
        let provider = MockContentProvider::new();

        let result = generate(&db, &config, &provider, "dina", &request(&[" ", ""]), fixed_now()).await;
        assert!(matches!(result, Err(Error::InvalidRequest { .. })));
        assert!(get_account(&db, "dina").await?.is_none());
        Ok(())
    }
}
