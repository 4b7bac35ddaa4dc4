//! Slack transport: Socket Mode inbound, Web API outbound.

use crate::chat::{ChatTransport, MessageHandle};
use crate::error::ChatError;
use crate::{ChannelId, ChannelMessage, InboundAttachment, Trigger};
use anyhow::Context as _;
use async_trait::async_trait;
use slack_morphism::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

/// State shared with socket mode callbacks via `SlackClientEventsUserState`.
struct SlackInboundState {
    inbound_tx: mpsc::Sender<ChannelMessage>,
    bot_user_id: String,
    bot_token: String,
    client: Arc<SlackHyperClient>,
    /// user id → display name, filled lazily from `users.info`.
    names: RwLock<HashMap<String, String>>,
}

/// Slack chat adapter.
///
/// One shared HTTP client for REST calls (it holds a hyper connection pool);
/// the socket mode listener gets its own client because it owns a persistent
/// WebSocket connection.
pub struct SlackChat {
    bot_token: String,
    app_token: String,
    client: Arc<SlackHyperClient>,
    token: SlackApiToken,
}

impl SlackChat {
    pub fn new(bot_token: impl Into<String>, app_token: impl Into<String>) -> anyhow::Result<Self> {
        let bot_token = bot_token.into();
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack HTTP connector")?,
        ));
        let token = SlackApiToken::new(SlackApiTokenValue(bot_token.clone()));
        Ok(Self {
            bot_token,
            app_token: app_token.into(),
            client,
            token,
        })
    }

    pub fn bot_token(&self) -> &str {
        &self.bot_token
    }

    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.token)
    }

    /// Connect Socket Mode and forward channel messages to `inbound_tx`.
    /// Resolves once the listener is up; the listener runs until the
    /// process exits.
    pub async fn start_inbound(&self, inbound_tx: mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        let auth = self
            .session()
            .auth_test()
            .await
            .context("failed to call auth.test for bot user id")?;
        let bot_user_id = auth.user_id.0.clone();
        tracing::info!(bot_user_id = %bot_user_id, "slack bot user id resolved");

        let state = Arc::new(SlackInboundState {
            inbound_tx,
            bot_user_id,
            bot_token: self.bot_token.clone(),
            client: self.client.clone(),
            names: RwLock::new(HashMap::new()),
        });

        let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);

        let listener_client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new()
                .context("failed to create slack socket mode connector")?,
        ));
        let listener_environment = Arc::new(
            SlackClientEventsListenerEnvironment::new(listener_client)
                .with_error_handler(slack_error_handler)
                .with_user_state(state),
        );
        let listener = SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            listener_environment,
            callbacks,
        );

        let app_token = SlackApiToken::new(SlackApiTokenValue(self.app_token.clone()));
        listener
            .listen_for(&app_token)
            .await
            .context("failed to start slack socket mode listener")?;
        tracing::info!("slack socket mode connected");

        tokio::spawn(async move {
            let exit_code = listener.serve().await;
            tracing::info!(exit_code, "slack socket mode listener stopped");
        });

        Ok(())
    }
}

fn slack_error_handler(
    error: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> HttpStatusCode {
    tracing::warn!(%error, "slack event handler error");
    HttpStatusCode::OK
}

async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let SlackEventCallbackBody::Message(message) = event.event else {
        return Ok(());
    };

    // Skip edits / deletes / bot_message subtypes.
    if message.subtype.is_some() {
        return Ok(());
    }

    let state_guard = states.read().await;
    let state = state_guard
        .get_user_state::<Arc<SlackInboundState>>()
        .expect("SlackInboundState must be in user_state")
        .clone();
    drop(state_guard);

    let Some(user_id) = message.sender.user.as_ref().map(|u| u.0.clone()) else {
        return Ok(()); // system message
    };
    if user_id == state.bot_user_id {
        return Ok(()); // ignore self
    }
    let Some(channel_id) = message.origin.channel.as_ref().map(|c| c.0.clone()) else {
        return Ok(());
    };
    let ts = message.origin.ts.0.clone();

    let text = message
        .content
        .as_ref()
        .and_then(|content| content.text.clone())
        .unwrap_or_default();
    let attachments: Vec<InboundAttachment> = message
        .content
        .as_ref()
        .and_then(|content| content.files.as_ref())
        .map(|files| {
            files
                .iter()
                .filter_map(|file| {
                    let url = file.url_private.as_ref()?.to_string();
                    Some(InboundAttachment {
                        file_id: file.id.0.clone(),
                        filename: file.name.clone().unwrap_or_else(|| file.id.0.clone()),
                        url,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    if text.is_empty() && attachments.is_empty() {
        return Ok(());
    }

    let user_name = resolve_display_name(&state, &user_id).await;

    let inbound = ChannelMessage {
        channel_id: ChannelId::from(channel_id.as_str()),
        ts,
        user: user_id,
        user_name,
        text,
        attachments,
        trigger: Trigger::User,
    };

    if state.inbound_tx.send(inbound).await.is_err() {
        tracing::warn!("inbound channel closed, dropping slack message");
    }
    Ok(())
}

/// `users.info` with a per-process cache; identity failures degrade to None.
async fn resolve_display_name(state: &SlackInboundState, user_id: &str) -> Option<String> {
    if let Some(name) = state.names.read().await.get(user_id) {
        return Some(name.clone());
    }

    let token = SlackApiToken::new(SlackApiTokenValue(state.bot_token.clone()));
    let session = state.client.open_session(&token);
    let response = session
        .users_info(&SlackApiUsersInfoRequest::new(SlackUserId(
            user_id.to_string(),
        )))
        .await
        .ok()?;

    let profile = response.user.profile.as_ref();
    let name = profile
        .and_then(|p| p.display_name.clone())
        .filter(|n| !n.is_empty())
        .or_else(|| profile.and_then(|p| p.real_name.clone()))
        .or(response.user.name)?;

    state
        .names
        .write()
        .await
        .insert(user_id.to_string(), name.clone());
    Some(name)
}

#[async_trait]
impl ChatTransport for SlackChat {
    async fn post_message(
        &self,
        channel_id: &str,
        text: &str,
    ) -> Result<MessageHandle, ChatError> {
        let request = SlackApiChatPostMessageRequest::new(
            SlackChannelId(channel_id.to_string()),
            SlackMessageContent::new().with_text(text.to_string()),
        );
        let response = self
            .session()
            .chat_post_message(&request)
            .await
            .map_err(|error| ChatError::Api(error.to_string()))?;
        Ok(response.ts.0)
    }

    async fn update_message(
        &self,
        channel_id: &str,
        handle: &MessageHandle,
        text: &str,
    ) -> Result<(), ChatError> {
        let request = SlackApiChatUpdateRequest::new(
            SlackChannelId(channel_id.to_string()),
            SlackMessageContent::new().with_text(text.to_string()),
            SlackTs(handle.clone()),
        );
        self.session()
            .chat_update(&request)
            .await
            .map_err(|error| ChatError::Api(error.to_string()))?;
        Ok(())
    }

    async fn delete_message(
        &self,
        channel_id: &str,
        handle: &MessageHandle,
    ) -> Result<(), ChatError> {
        let request = SlackApiChatDeleteRequest::new(
            SlackChannelId(channel_id.to_string()),
            SlackTs(handle.clone()),
        );
        self.session()
            .chat_delete(&request)
            .await
            .map_err(|error| ChatError::Api(error.to_string()))?;
        Ok(())
    }

    async fn post_in_thread(
        &self,
        channel_id: &str,
        main: &MessageHandle,
        text: &str,
    ) -> Result<MessageHandle, ChatError> {
        let request = SlackApiChatPostMessageRequest::new(
            SlackChannelId(channel_id.to_string()),
            SlackMessageContent::new().with_text(text.to_string()),
        )
        .with_thread_ts(SlackTs(main.clone()));
        let response = self
            .session()
            .chat_post_message(&request)
            .await
            .map_err(|error| ChatError::Api(error.to_string()))?;
        Ok(response.ts.0)
    }

    /// Slack external-upload v2 flow: get URL, PUT bytes, complete.
    async fn upload_file(
        &self,
        channel_id: &str,
        host_path: &Path,
        title: Option<&str>,
    ) -> Result<(), ChatError> {
        let data = tokio::fs::read(host_path)
            .await
            .map_err(|error| ChatError::Upload {
                path: host_path.display().to_string(),
                reason: error.to_string(),
            })?;
        let filename = host_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let session = self.session();
        let upload_url = session
            .get_upload_url_external(&SlackApiFilesGetUploadUrlExternalRequest::new(
                filename.clone(),
                data.len(),
            ))
            .await
            .map_err(|error| ChatError::Upload {
                path: host_path.display().to_string(),
                reason: format!("get upload url: {error}"),
            })?;

        session
            .files_upload_via_url(&SlackApiFilesUploadViaUrlRequest::new(
                upload_url.upload_url,
                data,
                guess_mime(host_path).to_string(),
            ))
            .await
            .map_err(|error| ChatError::Upload {
                path: host_path.display().to_string(),
                reason: format!("upload: {error}"),
            })?;

        let complete = SlackApiFilesComplete::new(upload_url.file_id)
            .with_title(title.map(str::to_string).unwrap_or(filename));
        let request = SlackApiFilesCompleteUploadExternalRequest::new(vec![complete])
            .with_channel_id(SlackChannelId(channel_id.to_string()));
        session
            .files_complete_upload_external(&request)
            .await
            .map_err(|error| ChatError::Upload {
                path: host_path.display().to_string(),
                reason: format!("complete: {error}"),
            })?;
        Ok(())
    }
}

fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("txt") | Some("log") | Some("md") => "text/plain",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("html") => "text/html",
        _ => "application/octet-stream",
    }
}
