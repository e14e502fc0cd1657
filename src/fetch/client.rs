use async_trait::async_trait;
use reqwest::{Request, Response};

/// Transport seam for every upstream request, so authentication layers and
/// test doubles can wrap or replace the real client.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
