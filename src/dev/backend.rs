use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use super::manifest::Service;

/// Container operations the dev orchestrator drives, one service at a time.
///
/// The orchestrator owns ordering, concurrency and error aggregation;
/// implementations only perform the single step asked of them.
#[async_trait]
pub trait DevBackend: Send + Sync {
    /// Build the service's image, or pull it for image-only services.
    /// `cache = false` forces a fresh pull and a no-cache build.
    async fn build_service(&self, app: &str, dir: &Path, service: &Service, cache: bool) -> Result<()>;

    /// Run the service in the foreground until its container exits.
    async fn run_service(&self, app: &str, dir: &Path, service: &Service) -> Result<()>;

    /// Copy one local file into the running service at `remote`, creating
    /// missing parent directories.
    async fn sync_file(&self, app: &str, service: &str, local: &Path, remote: &str) -> Result<()>;

    /// Delete `remote` (file or directory) inside the running service.
    async fn remove_file(&self, app: &str, service: &str, remote: &str) -> Result<()>;
}

/// Container name for a service of an app.
pub fn container_name(app: &str, service: &str) -> String {
    format!("{}-{}", app, service)
}

/// Image tag for a built service.
pub fn image_name(app: &str, service: &str) -> String {
    format!("{}/{}", app, service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_combine_app_and_service() {
        assert_eq!(container_name("shop", "web"), "shop-web");
        assert_eq!(image_name("shop", "web"), "shop/web");
    }
}
