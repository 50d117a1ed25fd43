use async_trait::async_trait;
use tracing::debug;
use wm_infra::types::{MachineConfig, Recipe};

use crate::context;
use crate::error::{Error, Result};

/// Resolves the recipe a machine config points at.
#[async_trait]
pub trait RecipeLoader: Send + Sync {
    async fn load(&self, config: &MachineConfig) -> Result<Recipe>;
}

/// Downloads recipe scripts over HTTP.
///
/// Locations under our own API get the caller's token attached, so
/// private recipes resolve on behalf of the current subject.
pub struct HttpRecipeLoader {
    http: reqwest::Client,
    api_endpoint: String,
}

impl HttpRecipeLoader {
    pub fn new(api_endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_endpoint: api_endpoint.into(),
        }
    }

    async fn download(&self, url: reqwest::Url) -> std::result::Result<String, String> {
        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| e.to_string())?
            .bytes()
            .await
            .map_err(|e| e.to_string())?;

        // Scratch file is removed when `file` drops.
        let file = tempfile::Builder::new()
            .prefix("recipe")
            .suffix(".script")
            .tempfile()
            .map_err(|e| e.to_string())?;
        tokio::fs::write(file.path(), &bytes)
            .await
            .map_err(|e| e.to_string())?;
        tokio::fs::read_to_string(file.path())
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl RecipeLoader for HttpRecipeLoader {
    async fn load(&self, config: &MachineConfig) -> Result<Recipe> {
        let token = context::current().token;
        let fail = |e: String| Error::Machine(format!("Can't start machine {}. {e}", config.name));

        let url = recipe_url(&config.source.location, &self.api_endpoint, token.as_deref())
            .map_err(|e| fail(e.to_string()))?;
        debug!(machine = %config.name, %url, "downloading recipe");

        let script = self.download(url).await.map_err(fail)?;
        Ok(Recipe::dockerfile(script))
    }
}

/// URL to fetch a recipe from, with `token` added for our own API.
pub fn recipe_url(location: &str, api_endpoint: &str, token: Option<&str>) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(location)
        .map_err(|e| Error::BadRequest(format!("Invalid recipe location {location}: {e}")))?;
    if let Some(token) = token
        && !api_endpoint.is_empty()
        && location.starts_with(api_endpoint)
    {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}
