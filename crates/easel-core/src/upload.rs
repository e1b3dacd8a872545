// Upload sub-protocol.
// Caller images arrive as http(s) links or base64 data URLs; both are
// resolved to URLs the backend command can reference in a prompt.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use easel_types::{generate_task_id, BackendFamily};

use crate::config::CoreConfig;
use crate::error::{EaselError, Result};
use crate::transport::{GatewaySender, ImageHost, SendContext};

/// Resolve caller-supplied image references to backend-usable URLs, in
/// input order.
pub async fn resolve_image_refs(
    sender: &dyn GatewaySender,
    host: &dyn ImageHost,
    config: &CoreConfig,
    ctx: &SendContext,
    inputs: &[String],
) -> Result<Vec<String>> {
    let mut urls = Vec::with_capacity(inputs.len());
    for input in inputs {
        let url = if input.starts_with("http://") || input.starts_with("https://") {
            resolve_link(sender, host, config, ctx, input).await?
        } else {
            resolve_data_url(sender, config, ctx, input, true).await?
        };
        urls.push(url);
    }
    Ok(urls)
}

/// Links pass through unless the config asks for re-hosting for this
/// backend family. A host may resolve straight to a storage URL or hand
/// back refetched bytes as a data URL for the upload primitive.
async fn resolve_link(
    sender: &dyn GatewaySender,
    host: &dyn ImageHost,
    config: &CoreConfig,
    ctx: &SendContext,
    url: &str,
) -> Result<String> {
    let rehost = match ctx.backend_family {
        BackendFamily::Partner => config.enable_you_chuan_prompt_link,
        BackendFamily::Chat => config.enable_save_user_upload_link,
        BackendFamily::Official => false,
    };
    if !rehost {
        return Ok(url.to_string());
    }
    let hosted = host.rehost(url).await?;
    if hosted.starts_with("data:") {
        resolve_data_url(sender, config, ctx, &hosted, false).await
    } else {
        Ok(hosted)
    }
}

/// Decode a base64 data URL and push it through the backend upload
/// primitive; non-URL upload handles are posted via send-image and the
/// message URL is used instead.
async fn resolve_data_url(
    sender: &dyn GatewaySender,
    config: &CoreConfig,
    ctx: &SendContext,
    data_url: &str,
    caller_supplied: bool,
) -> Result<String> {
    if caller_supplied && !config.enable_user_custom_upload_base64 {
        return Err(EaselError::Validation(
            "base64 uploads are disabled".to_string(),
        ));
    }
    let (mime, body) = split_data_url(data_url)
        .ok_or_else(|| EaselError::Validation("malformed data url".to_string()))?;
    let bytes = BASE64
        .decode(body)
        .map_err(|e| EaselError::Validation(format!("invalid base64 payload: {e}")))?;

    let filename = format!("{}.{}", generate_task_id(), suffix_for_mime(mime));
    let uploaded = sender.upload(ctx, &filename, &bytes).await?;
    if !uploaded.is_success() {
        return Err(EaselError::UploadFailed(uploaded.description));
    }
    let handle = uploaded
        .result
        .ok_or_else(|| EaselError::UploadFailed("upload returned no handle".to_string()))?;
    if handle.starts_with("http://") || handle.starts_with("https://") {
        return Ok(handle);
    }

    let posted = sender.send_image(ctx, &ctx.channel_id, &handle).await?;
    if !posted.is_success() {
        return Err(EaselError::UploadFailed(posted.description));
    }
    posted
        .result
        .ok_or_else(|| EaselError::UploadFailed("send-image returned no url".to_string()))
}

fn split_data_url(data_url: &str) -> Option<(&str, &str)> {
    let rest = data_url.strip_prefix("data:")?;
    let (meta, body) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    Some((mime, body))
}

fn suffix_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "png",
    }
}

/// Re-hosts by refetching the remote bytes and handing them back as a
/// data URL, routing the image through the backend upload primitive.
pub struct HttpFetchHost {
    client: reqwest::Client,
}

impl HttpFetchHost {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpFetchHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ImageHost for HttpFetchHost {
    async fn rehost(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EaselError::UploadFailed(format!("fetch {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(EaselError::UploadFailed(format!(
                "fetch {url}: status {}",
                response.status()
            )));
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EaselError::UploadFailed(format!("fetch {url}: {e}")))?;
        Ok(format!("data:{};base64,{}", mime, BASE64.encode(&bytes)))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests_support::StubGateway;
    use crate::transport::Message;
    use easel_types::BotFamily;

    fn ctx(backend: BackendFamily) -> SendContext {
        SendContext {
            channel_id: "chan-1".to_string(),
            guild_id: "guild-1".to_string(),
            bot_family: BotFamily::Mj,
            backend_family: backend,
        }
    }

    #[test]
    fn data_url_split() {
        let (mime, body) = split_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(body, "aGVsbG8=");
        assert!(split_data_url("data:image/png,aGVsbG8=").is_none());
        assert!(split_data_url("image/png;base64,x").is_none());
    }

    #[tokio::test]
    async fn links_pass_through_for_chat() {
        let gateway = StubGateway::default();
        let urls = resolve_image_refs(
            &gateway,
            &crate::transport::PassthroughHost,
            &CoreConfig::default(),
            &ctx(BackendFamily::Chat),
            &["https://example.com/cat.png".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(urls, vec!["https://example.com/cat.png".to_string()]);
        assert!(gateway.ops().is_empty());
    }

    #[tokio::test]
    async fn base64_uploads_then_posts_non_url_handle() {
        let gateway = StubGateway::default();
        // upload returns a bare attachment handle, so send-image runs.
        gateway.script(Message::success_with("attachment-1.png"));
        let urls = resolve_image_refs(
            &gateway,
            &crate::transport::PassthroughHost,
            &CoreConfig::default(),
            &ctx(BackendFamily::Chat),
            &["data:image/png;base64,aGVsbG8=".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(gateway.ops(), vec!["upload", "send_image"]);
        assert!(urls[0].starts_with("https://cdn.example/"));
    }

    #[tokio::test]
    async fn base64_gate_rejects_when_disabled() {
        let gateway = StubGateway::default();
        let config = CoreConfig {
            enable_user_custom_upload_base64: false,
            ..CoreConfig::default()
        };
        let err = resolve_image_refs(
            &gateway,
            &crate::transport::PassthroughHost,
            &config,
            &ctx(BackendFamily::Chat),
            &["data:image/png;base64,aGVsbG8=".to_string()],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EaselError::Validation(_)));
    }

    struct DataUrlHost;

    #[async_trait::async_trait]
    impl ImageHost for DataUrlHost {
        async fn rehost(&self, _url: &str) -> Result<String> {
            Ok("data:image/png;base64,aGVsbG8=".to_string())
        }
    }

    #[tokio::test]
    async fn partner_link_rehosts_through_upload() {
        let gateway = StubGateway::default();
        gateway.script(Message::success_with("https://storage.example/b.png"));
        let urls = resolve_image_refs(
            &gateway,
            &DataUrlHost,
            &CoreConfig::default(),
            &ctx(BackendFamily::Partner),
            &["https://example.com/cat.png".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(gateway.ops(), vec!["upload"]);
        assert_eq!(urls[0], "https://storage.example/b.png");
    }

    #[tokio::test]
    async fn upload_returning_url_skips_send_image() {
        let gateway = StubGateway::default();
        gateway.script(Message::success_with("https://storage.example/a.png"));
        let urls = resolve_image_refs(
            &gateway,
            &crate::transport::PassthroughHost,
            &CoreConfig::default(),
            &ctx(BackendFamily::Partner),
            &["data:image/jpeg;base64,aGVsbG8=".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(gateway.ops(), vec!["upload"]);
        assert_eq!(urls[0], "https://storage.example/a.png");
    }
}
