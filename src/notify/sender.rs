//! Push delivery.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use web_push::{
    ContentEncoding, IsahcWebPushClient, SubscriptionInfo, VapidSignatureBuilder, WebPushClient,
    WebPushMessageBuilder,
};

use super::PushSubscription;
use crate::config::PushConfig;

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<()>;
}

/// VAPID-signed, `aes128gcm`-encrypted Web Push.
pub struct WebPushSender {
    client: IsahcWebPushClient,
    private_key: String,
    subject: String,
}

impl WebPushSender {
    pub fn new(config: &PushConfig) -> Result<Self> {
        anyhow::ensure!(
            !config.vapid_private_key.is_empty(),
            "VAPID private key is not configured (set VAPID_PRIVATE_KEY)"
        );
        let client = IsahcWebPushClient::new().context("failed to create push client")?;
        Ok(Self {
            client,
            private_key: config.vapid_private_key.clone(),
            subject: config.subject.clone(),
        })
    }
}

#[async_trait]
impl PushSender for WebPushSender {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<()> {
        let info = SubscriptionInfo::new(
            subscription.endpoint.as_str(),
            subscription.p256dh.as_str(),
            subscription.auth.as_str(),
        );

        let mut signature = VapidSignatureBuilder::from_base64(&self.private_key, web_push::URL_SAFE_NO_PAD, &info)
            .map_err(|e| anyhow!("invalid VAPID private key: {e}"))?;
        signature.add_claim("sub", self.subject.as_str());
        let signature = signature
            .build()
            .map_err(|e| anyhow!("failed to sign push message: {e}"))?;

        let mut message = WebPushMessageBuilder::new(&info);
        message.set_payload(ContentEncoding::Aes128Gcm, payload);
        message.set_vapid_signature(signature);
        let message = message
            .build()
            .map_err(|e| anyhow!("failed to build push message: {e}"))?;

        self.client
            .send(message)
            .await
            .map_err(|e| anyhow!("push delivery failed: {e}"))
    }
}
