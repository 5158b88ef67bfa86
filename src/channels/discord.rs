use super::traits::{DirectMessenger, HistoryLimit, InboundHandler, InboundMessage, MessengerError};
use crate::relay::types::{CorrespondentId, MessageRecord};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
const GATEWAY_QUERY: &str = "?v=10&encoding=json";
/// DIRECT_MESSAGES | MESSAGE_CONTENT
const GATEWAY_INTENTS: u64 = (1 << 12) | (1 << 15);
const PAGE_SIZE: usize = 100;

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;

/// Discord bot account: REST for sends and history, gateway WebSocket for
/// inbound direct messages.
pub struct DiscordMessenger {
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
    /// Correspondent -> DM channel id, filled from events and channel opens.
    dm_channels: Mutex<HashMap<CorrespondentId, String>>,
    self_id: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordUser {
    id: String,
    username: String,
    #[serde(default)]
    discriminator: Option<String>,
    #[serde(default)]
    bot: bool,
}

impl DiscordUser {
    fn label(&self) -> String {
        match self.discriminator.as_deref() {
            Some(d) if !d.is_empty() && d != "0" => format!("{}#{d}", self.username),
            _ => self.username.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordMessage {
    id: String,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    author: DiscordUser,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct DmChannel {
    id: String,
}

#[derive(Deserialize)]
struct GatewayInfo {
    url: String,
}

#[derive(Deserialize)]
struct GatewayFrame {
    op: u8,
    #[serde(default)]
    d: serde_json::Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Deserialize)]
struct ReadyEvent {
    user: DiscordUser,
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

impl DiscordMessenger {
    pub fn new(bot_token: String) -> Self {
        Self::with_api_base(bot_token, DEFAULT_API_BASE.to_string())
    }

    pub fn with_api_base(bot_token: String, api_base: String) -> Self {
        Self {
            bot_token,
            api_base: api_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            dm_channels: Mutex::new(HashMap::new()),
            self_id: Mutex::new(None),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    /// The DM channel with `who`, opening it through the API on first use.
    async fn dm_channel(&self, who: CorrespondentId) -> Result<String, MessengerError> {
        if let Some(id) = self.dm_channels.lock().get(&who) {
            return Ok(id.clone());
        }

        let resp = self
            .client
            .post(format!("{}/users/@me/channels", self.api_base))
            .header("Authorization", self.auth_header())
            .json(&serde_json::json!({ "recipient_id": who.to_string() }))
            .send()
            .await
            .map_err(transport)?;
        let channel: DmChannel = check(resp).await?.json().await.map_err(transport)?;

        self.dm_channels.lock().insert(who, channel.id.clone());
        Ok(channel.id)
    }

    async fn fetch_page(
        &self,
        channel_id: &str,
        cursor: Option<(&str, &str)>,
        page_size: usize,
    ) -> Result<Vec<DiscordMessage>, MessengerError> {
        let mut query = vec![("limit", page_size.to_string())];
        if let Some((key, id)) = cursor {
            query.push((key, id.to_string()));
        }

        let resp = self
            .client
            .get(format!("{}/channels/{channel_id}/messages", self.api_base))
            .header("Authorization", self.auth_header())
            .query(&query)
            .send()
            .await
            .map_err(transport)?;
        let mut page: Vec<DiscordMessage> =
            check(resp).await?.json().await.map_err(transport)?;
        page.sort_by_key(|m| snowflake(&m.id));
        Ok(page)
    }

    /// Walk forward from the start of the channel.
    async fn fetch_all(&self, channel_id: &str) -> Result<Vec<DiscordMessage>, MessengerError> {
        let mut messages = Vec::new();
        let mut after = "0".to_string();
        loop {
            let page = self
                .fetch_page(channel_id, Some(("after", after.as_str())), PAGE_SIZE)
                .await?;
            let full = page.len() == PAGE_SIZE;
            let Some(last) = page.last() else { break };
            after = last.id.clone();
            messages.extend(page);
            if !full {
                break;
            }
        }
        Ok(messages)
    }

    /// Walk backward from the newest message until `wanted` are collected.
    async fn fetch_latest(
        &self,
        channel_id: &str,
        wanted: usize,
    ) -> Result<Vec<DiscordMessage>, MessengerError> {
        let mut newest_first: Vec<DiscordMessage> = Vec::new();
        let mut before: Option<String> = None;
        while newest_first.len() < wanted {
            let page_size = (wanted - newest_first.len()).min(PAGE_SIZE);
            let cursor = before.as_deref().map(|id| ("before", id));
            let page = self.fetch_page(channel_id, cursor, page_size).await?;
            let full = page.len() == page_size;
            let Some(oldest) = page.first() else { break };
            before = Some(oldest.id.clone());
            newest_first.extend(page.into_iter().rev());
            if !full {
                break;
            }
        }
        newest_first.truncate(wanted);
        newest_first.reverse();
        Ok(newest_first)
    }

    async fn gateway_url(&self) -> anyhow::Result<String> {
        let resp = self
            .client
            .get(format!("{}/gateway/bot", self.api_base))
            .header("Authorization", self.auth_header())
            .send()
            .await?;
        let info: GatewayInfo = check(resp).await?.json().await?;
        Ok(format!("{}/{GATEWAY_QUERY}", info.url.trim_end_matches('/')))
    }

    fn identify_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "op": OP_IDENTIFY,
            "d": {
                "token": self.bot_token,
                "intents": GATEWAY_INTENTS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "dmrelay",
                    "device": "dmrelay",
                }
            }
        })
    }

    fn handle_dispatch(&self, event: &str, data: serde_json::Value, handler: &dyn InboundHandler) {
        match event {
            "READY" => match serde_json::from_value::<ReadyEvent>(data) {
                Ok(ready) => {
                    *self.self_id.lock() = Some(ready.user.id.clone());
                    let label = ready.user.label();
                    tracing::info!("Discord: connected as {label}");
                    handler.on_ready(&label);
                }
                Err(e) => tracing::warn!("Discord: malformed READY payload: {e}"),
            },
            "MESSAGE_CREATE" => {
                let message: DiscordMessage = match serde_json::from_value(data) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::debug!("Discord: skipping unparsable message: {e}");
                        return;
                    }
                };
                let self_id = self.self_id.lock().clone();
                let Some(inbound) = to_inbound(&message, self_id.as_deref()) else {
                    return;
                };
                if inbound.direct && !inbound.from_self {
                    self.dm_channels
                        .lock()
                        .insert(inbound.author_id, message.channel_id.clone());
                }
                handler.on_inbound(inbound);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl DirectMessenger for DiscordMessenger {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send_message(&self, to: CorrespondentId, text: &str) -> Result<(), MessengerError> {
        let channel_id = self.dm_channel(to).await?;
        let resp = self
            .client
            .post(format!("{}/channels/{channel_id}/messages", self.api_base))
            .header("Authorization", self.auth_header())
            .json(&serde_json::json!({ "content": text }))
            .send()
            .await
            .map_err(transport)?;
        check(resp).await?;
        Ok(())
    }

    async fn fetch_history(
        &self,
        with: CorrespondentId,
        limit: HistoryLimit,
    ) -> Result<Vec<MessageRecord>, MessengerError> {
        let channel_id = self.dm_channel(with).await?;
        let messages = match limit {
            HistoryLimit::Unbounded => self.fetch_all(&channel_id).await?,
            HistoryLimit::Latest(0) => Vec::new(),
            HistoryLimit::Latest(n) => self.fetch_latest(&channel_id, n).await?,
        };
        Ok(messages
            .into_iter()
            .map(|m| MessageRecord::new(m.author.label(), m.content))
            .collect())
    }

    async fn list_open_direct_channels(&self) -> BTreeSet<CorrespondentId> {
        self.dm_channels.lock().keys().copied().collect()
    }

    async fn listen(&self, handler: Arc<dyn InboundHandler>) -> anyhow::Result<()> {
        let url = self.gateway_url().await?;
        tracing::info!("Discord: connecting to gateway...");
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let heartbeat_ms = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: GatewayFrame = serde_json::from_str(text.as_str())?;
                    if frame.op == OP_HELLO {
                        break frame
                            .d
                            .get("heartbeat_interval")
                            .and_then(serde_json::Value::as_u64)
                            .unwrap_or(41_250);
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    anyhow::bail!("Discord gateway closed before HELLO")
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => {}
            }
        };

        write
            .send(Message::Text(self.identify_payload().to_string().into()))
            .await?;

        let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_ms));
        heartbeat.tick().await;
        let mut sequence: Option<u64> = None;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let beat = serde_json::json!({ "op": OP_HEARTBEAT, "d": sequence });
                    write.send(Message::Text(beat.to_string().into())).await?;
                }
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Close(frame))) => {
                            anyhow::bail!("Discord gateway closed: {frame:?}")
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => anyhow::bail!("Discord gateway stream ended"),
                        Some(Ok(_)) => continue,
                    };

                    let frame: GatewayFrame = match serde_json::from_str(text.as_str()) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::debug!("Discord: ignoring malformed frame: {e}");
                            continue;
                        }
                    };
                    if frame.s.is_some() {
                        sequence = frame.s;
                    }

                    match frame.op {
                        OP_DISPATCH => {
                            if let Some(event) = frame.t.as_deref() {
                                self.handle_dispatch(event, frame.d, handler.as_ref());
                            }
                        }
                        OP_HEARTBEAT => {
                            let beat = serde_json::json!({ "op": OP_HEARTBEAT, "d": sequence });
                            write.send(Message::Text(beat.to_string().into())).await?;
                        }
                        OP_RECONNECT => anyhow::bail!("Discord requested reconnect"),
                        OP_INVALID_SESSION => anyhow::bail!("Discord invalidated the session"),
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Map a gateway message to an inbound event. Returns `None` for our own
/// messages.
fn to_inbound(message: &DiscordMessage, self_id: Option<&str>) -> Option<InboundMessage> {
    let from_self = self_id == Some(message.author.id.as_str());
    if from_self {
        return None;
    }
    let author_id = message.author.id.parse().ok()?;
    Some(InboundMessage {
        author_id,
        author_label: message.author.label(),
        text: message.content.clone(),
        author_is_bot: message.author.bot,
        from_self,
        // Bot accounts cannot join group DMs, so a message without a guild
        // is always a one-to-one DM.
        direct: message.guild_id.is_none(),
    })
}

fn snowflake(id: &str) -> u64 {
    id.parse().unwrap_or(0)
}

fn transport(e: reqwest::Error) -> MessengerError {
    MessengerError::Transport(e.to_string())
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, MessengerError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp
        .text()
        .await
        .unwrap_or_else(|e| format!("<failed to read response: {e}>"));
    Err(error_for_status(status, &body))
}

fn error_for_status(status: StatusCode, body: &str) -> MessengerError {
    match status {
        StatusCode::UNAUTHORIZED => MessengerError::Auth(body.to_string()),
        StatusCode::FORBIDDEN => MessengerError::Permission(body.to_string()),
        StatusCode::NOT_FOUND => MessengerError::NotFound(body.to_string()),
        StatusCode::TOO_MANY_REQUESTS => MessengerError::RateLimit {
            retry_after: serde_json::from_str::<RateLimitBody>(body)
                .ok()
                .filter(|b| b.retry_after.is_finite() && b.retry_after >= 0.0)
                .map(|b| Duration::from_secs_f64(b.retry_after)),
        },
        _ => MessengerError::Transport(format!("Discord API error ({status}): {body}")),
    }
}
