//! Cursor-paginated relationship lists.

use std::collections::VecDeque;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{status_error, transport_error};
use crate::error::SourceError;
use crate::source::{thumbnail_avatar, Entity, ItemSource};

#[derive(Debug, Deserialize)]
struct UserRecord {
    username: String,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    profile_pic_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnavailableRecord {
    username: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default)]
    users: Vec<UserRecord>,
    #[serde(default)]
    unavailable: Vec<UnavailableRecord>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Item source over one paginated list endpoint.
///
/// A failed page request leaves the cursor untouched, so the next call
/// requests the same page again.
pub struct HttpItemSource {
    http: Client,
    url: String,
    bearer: Option<String>,
    page_size: u32,
    expected_total: Option<u64>,
    fetch_avatars: bool,
    buffer: VecDeque<Result<Entity, SourceError>>,
    cursor: Option<String>,
    exhausted: bool,
    pages: u32,
}

impl HttpItemSource {
    pub(crate) fn new(
        http: Client,
        url: String,
        bearer: Option<String>,
        page_size: u32,
        expected_total: Option<u64>,
        fetch_avatars: bool,
    ) -> Self {
        Self {
            http,
            url,
            bearer,
            page_size,
            expected_total,
            fetch_avatars,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
            pages: 0,
        }
    }

    async fn fetch_page(&self) -> Result<PageResponse, SourceError> {
        let mut request = self
            .http
            .get(&self.url)
            .query(&[("count", self.page_size.to_string())]);
        if let Some(cursor) = &self.cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        if let Some(bearer) = &self.bearer {
            request = request.header(reqwest::header::AUTHORIZATION, bearer);
        }

        let response = request.send().await.map_err(|e| transport_error(&e))?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .json::<PageResponse>()
            .await
            .map_err(|e| SourceError::Request(format!("invalid page: {e}")))
    }

    fn fill(&mut self, page: PageResponse) {
        for user in page.users {
            let avatar = if self.fetch_avatars {
                user.profile_pic_url.as_deref().map(thumbnail_avatar)
            } else {
                None
            };
            self.buffer.push_back(Ok(Entity {
                id: user.username,
                display_name: user.full_name.unwrap_or_default(),
                avatar_ref: avatar,
            }));
        }
        for gone in page.unavailable {
            self.buffer.push_back(Err(SourceError::ItemUnavailable {
                id: gone.username,
                reason: gone.reason,
            }));
        }
        self.cursor = page.next_cursor.filter(|c| !c.is_empty());
        self.exhausted = self.cursor.is_none();
    }
}

#[async_trait]
impl ItemSource for HttpItemSource {
    fn expected_total(&self) -> Option<u64> {
        self.expected_total
    }

    async fn next_item(&mut self) -> Option<Result<Entity, SourceError>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            if self.exhausted {
                return None;
            }
            match self.fetch_page().await {
                Ok(page) => {
                    self.pages += 1;
                    debug!(url = %self.url, page = self.pages, users = page.users.len(), "Fetched page");
                    self.fill(page);
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
