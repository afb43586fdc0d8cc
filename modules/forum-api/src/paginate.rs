//! Limit/skip pagination until a short page signals end of data.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ForumError, Result};
use crate::types::{ApiQuery, PageRequest, RawRecord};
use crate::ForumClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paginator {
    pub page_size: u32,
    /// Awaited after every page except the last. Rate limit, keep exact.
    pub delay_between_requests: Duration,
    /// Safety valve against endpoints that never return a short page.
    pub max_pages: u32,
}

impl Default for Paginator {
    fn default() -> Self {
        Self {
            page_size: 100,
            delay_between_requests: Duration::from_millis(200),
            max_pages: 200,
        }
    }
}

impl Paginator {
    pub fn new(page_size: u32, delay_between_requests: Duration, max_pages: u32) -> Self {
        Self {
            page_size,
            delay_between_requests,
            max_pages,
        }
    }

    /// Fetch every page of `query`, returning rows in arrival order.
    ///
    /// A page fetch that exhausts its retries aborts the whole walk: a
    /// partial record set would silently under-count.
    pub async fn fetch_all_pages(
        &self,
        client: &ForumClient,
        query: &ApiQuery,
    ) -> Result<Vec<RawRecord>> {
        let cancel = client.cancel_flag();
        let mut rows = Vec::new();
        let mut skip: u64 = 0;
        let mut pages: u32 = 0;

        loop {
            cancel.check()?;

            let request = PageRequest {
                query: query.clone(),
                limit: self.page_size,
                skip,
            };
            let page = client.fetch_page(&request).await?;
            pages += 1;

            let fetched = page.rows.len();
            rows.extend(page.rows);

            if page.is_last_page {
                info!(
                    method = %query.method,
                    pages,
                    rows = rows.len(),
                    "Pagination complete"
                );
                return Ok(rows);
            }

            if pages >= self.max_pages {
                warn!(
                    method = %query.method,
                    max_pages = self.max_pages,
                    rows = rows.len(),
                    "Endpoint never returned a short page, giving up"
                );
                return Err(ForumError::PaginationOverrun {
                    max_pages: self.max_pages,
                });
            }

            debug!(method = %query.method, page = pages, fetched, "Full page, continuing");
            skip += fetched as u64;
            cancel.sleep(self.delay_between_requests).await?;
        }
    }
}
