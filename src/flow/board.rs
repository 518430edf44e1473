//! Focalboard REST client.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use super::ingress::BoardCard;
use super::ingress::sync::BoardClient;
use crate::config::FocalboardSection;
use crate::errors::FlowError;

const PER_PAGE: usize = 100;

/// Card as listed by the v2 API. Cards without a column are skipped.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCard {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    board_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "type", default)]
    card_type: Option<String>,
    #[serde(default)]
    create_at: i64,
    #[serde(default)]
    update_at: i64,
}

impl ApiCard {
    fn into_card(self, board_id: &str) -> Option<BoardCard> {
        let status = self.status.filter(|s| !s.trim().is_empty())?;
        Some(BoardCard {
            id: self.id,
            title: self.title,
            board_id: if self.board_id.is_empty() {
                board_id.to_string()
            } else {
                self.board_id
            },
            status,
            card_type: self.card_type,
            create_at: self.create_at,
            update_at: self.update_at,
        })
    }
}

pub struct FocalboardClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl FocalboardClient {
    pub fn new(api_url: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// `None` when no token is configured.
    pub fn from_config(section: &FocalboardSection) -> Option<Self> {
        section
            .token()
            .map(|token| Self::new(&section.api_url, &token))
    }

    async fn fetch_page(&self, board_id: &str, page: u32) -> anyhow::Result<Vec<ApiCard>> {
        let url = format!("{}/boards/{}/cards", self.api_url, board_id);
        self.client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("X-Requested-With", "XMLHttpRequest")
            .header("User-Agent", "fawkes-flow")
            .query(&[
                ("page", page.to_string()),
                ("per_page", PER_PAGE.to_string()),
            ])
            .send()
            .await
            .context("Failed to send cards request to Focalboard")?
            .error_for_status()
            .context("Focalboard cards API returned error status")?
            .json::<Vec<ApiCard>>()
            .await
            .context("Failed to parse cards response from Focalboard")
    }
}

#[async_trait]
impl BoardClient for FocalboardClient {
    async fn list_cards(&self, board_id: &str) -> Result<Vec<BoardCard>, FlowError> {
        let mut cards = Vec::new();
        let mut page = 0u32;
        loop {
            let batch = self
                .fetch_page(board_id, page)
                .await
                .map_err(|e| FlowError::Upstream(format!("{:#}", e)))?;
            let count = batch.len();
            let before = cards.len();
            cards.extend(batch.into_iter().filter_map(|c| c.into_card(board_id)));
            if cards.len() - before < count {
                tracing::debug!(
                    board_id = %board_id,
                    skipped = count - (cards.len() - before),
                    "Skipped cards without a column"
                );
            }
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(cards)
    }
}
