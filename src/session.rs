use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    config::BridgeConfig,
    error::{BridgeError, Result},
    events::{EventHub, SessionEvent},
    layout::Margins,
    protocol::{
        coerce_int, decode, encode_request, extract_receipt_payload, post_message_script,
        Envelope, InboundMessage, PurchasePayload, UserData, CLIENT_INITIALIZED, SURFACE_ERROR,
    },
    registry::PendingRequestRegistry,
    server::{page_url, StaticFileServer, INDEX_PAGE},
    surface::{BrowserSurface, KeyValueStore},
};

pub const HOME_ROUTE: &str = "/";
pub const INBOX_ROUTE_PREFIX: &str = "/InboxScreen";
pub const CATALOG_ROUTE_PREFIX: &str = "/RedeemScreen";
pub const AUTH_ROUTE_PREFIX: &str = "/AuthScreen";

const TEXT_ZOOM_PERCENT: u32 = 100;

const BOOTSTRAP_SCRIPT: &str = r#"
(function () {
  var post;
  if (window.Unity) {
    post = function (msg) { window.Unity.call(msg); };
  } else if (window.parent && window.parent.unityWebView) {
    post = function (msg) { window.parent.unityWebView.sendMessage('WebViewObject', msg); };
  } else if (window.webkit && window.webkit.messageHandlers && window.webkit.messageHandlers.unityControl) {
    post = function (msg) { window.webkit.messageHandlers.unityControl.postMessage(msg); };
  } else {
    post = function (msg) { window.location = 'unity:' + msg; };
  }
  window.ReactNativeWebView = { postMessage: post };
  window.redemptionSdk.initializeUnityClient();
})();
"#;

const DISABLE_TRANSITIONS_SCRIPT: &str = "window.redemptionSdk.disableTransitions();";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Initializing,
    Ready,
}

/// Overlay operations hosts usually trigger from buttons without awaiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiOperation {
    ShowInbox,
    HideInbox,
    ShowRewardsCatalog,
    HideRewardsCatalog,
    ToggleInbox,
    ToggleRewardsCatalog,
    HideOverlays,
}

impl UiOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShowInbox => "showInbox",
            Self::HideInbox => "hideInbox",
            Self::ShowRewardsCatalog => "showRewardsCatalog",
            Self::HideRewardsCatalog => "hideRewardsCatalog",
            Self::ToggleInbox => "toggleInbox",
            Self::ToggleRewardsCatalog => "toggleRewardsCatalog",
            Self::HideOverlays => "hideOverlays",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub current_path: String,
    pub is_full_screen_forced: bool,
    pub margins: Margins,
    pub user: Option<UserData>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            current_path: HOME_ROUTE.to_string(),
            is_full_screen_forced: false,
            margins: Margins::default(),
            user: None,
        }
    }
}

pub struct BridgeSession {
    config: Arc<BridgeConfig>,
    surface: Arc<dyn BrowserSurface>,
    storage: Arc<dyn KeyValueStore>,
    server: StaticFileServer,
    registry: PendingRequestRegistry,
    hub: EventHub,
    phase: Mutex<SessionPhase>,
    state: Mutex<SessionState>,
    start_url: Mutex<Option<String>>,
    next_request_id: AtomicI64,
    surface_prepared: AtomicBool,
}

impl BridgeSession {
    pub fn new(
        config: BridgeConfig,
        surface: Arc<dyn BrowserSurface>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Arc<Self> {
        let server = StaticFileServer::new(config.asset_root.clone(), config.bind_host.clone());
        Arc::new(Self {
            config: Arc::new(config),
            surface,
            storage,
            server,
            registry: PendingRequestRegistry::new(),
            hub: EventHub::new(),
            phase: Mutex::new(SessionPhase::Uninitialized),
            state: Mutex::new(SessionState::default()),
            start_url: Mutex::new(None),
            next_request_id: AtomicI64::new(0),
            surface_prepared: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn server(&self) -> &StaticFileServer {
        &self.server
    }

    pub async fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<SessionEvent>) {
        self.hub.subscribe().await
    }

    pub async fn unsubscribe(&self, subscriber_id: u64) {
        self.hub.unsubscribe(subscriber_id).await;
    }

    /// Starts the asset server, loads the web client and runs the
    /// two-step handshake. On failure the session is left uninitialized.
    pub async fn initialize(&self) -> Result<()> {
        self.config.validate()?;

        let guard = {
            let mut phase = lock(&self.phase);
            match *phase {
                SessionPhase::Ready => return Err(BridgeError::AlreadyInitialized),
                SessionPhase::Initializing => return Err(BridgeError::AlreadyInitializing),
                SessionPhase::Uninitialized => *phase = SessionPhase::Initializing,
            }
            InitializingGuard {
                phase: &self.phase,
                committed: false,
            }
        };

        match self.run_handshake().await {
            Ok(()) => {
                guard.commit();
                tracing::info!(app_id = %self.config.app_id, "rewards bridge ready");
                Ok(())
            }
            Err(error) => {
                tracing::error!(%error, "rewards bridge initialization failed");
                Err(error)
            }
        }
    }

    async fn run_handshake(&self) -> Result<()> {
        let addr = self.server.start().await?;
        let url = page_url(addr, INDEX_PAGE);
        *lock(&self.start_url) = Some(url.clone());

        self.prepare_surface();

        let client_ready = self.registry.register(
            |envelope| envelope.kind == CLIENT_INITIALIZED || envelope.kind == SURFACE_ERROR,
            Some(self.config.network_timeout),
        );

        tracing::info!(%url, "loading web client");
        self.surface.load_url(&url);
        client_ready.wait().await.into_result()?;

        let init = json!({
            "vendorId": self.config.vendor_id,
            "appId": self.config.app_id,
            "isTestMode": self.config.is_test_mode,
        });
        self.request("initialize", init, self.config.network_timeout)
            .await?;
        Ok(())
    }

    fn prepare_surface(&self) {
        if !self.surface_prepared.swap(true, Ordering::SeqCst) {
            self.surface.set_text_zoom(TEXT_ZOOM_PERCENT);
        }
    }

    /// Stops serving assets and releases every pending request.
    pub async fn shutdown(&self) {
        self.server.stop().await;
        let cancelled = self.registry.cancel_all("session shut down");
        *lock(&self.start_url) = None;
        *lock(&self.phase) = SessionPhase::Uninitialized;
        tracing::info!(cancelled, "rewards bridge shut down");
    }

    async fn request(&self, kind: &str, data: Value, limit: Duration) -> Result<Envelope> {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let pending = self.registry.register_reply(id, Some(limit));

        let wire = encode_request(kind, data, id);
        tracing::debug!(id, kind, "sending request");
        self.surface.evaluate_script(&post_message_script(&wire));

        pending.wait().await.into_result()
    }

    pub async fn show_inbox(&self) -> Result<()> {
        if self.is_inbox_open() {
            return Ok(());
        }
        self.request("showInbox", Value::Null, self.config.network_timeout)
            .await
            .map(|_| ())
    }

    pub async fn hide_inbox(&self) -> Result<()> {
        if !self.is_inbox_open() {
            return Ok(());
        }
        self.request("hideInbox", Value::Null, self.config.network_timeout)
            .await
            .map(|_| ())
    }

    pub async fn show_rewards_catalog(&self) -> Result<()> {
        if self.is_rewards_catalog_open() {
            return Ok(());
        }
        self.request("showRewardsCatalog", Value::Null, self.config.network_timeout)
            .await
            .map(|_| ())
    }

    pub async fn hide_rewards_catalog(&self) -> Result<()> {
        if !self.is_rewards_catalog_open() {
            return Ok(());
        }
        self.request("hideRewardsCatalog", Value::Null, self.config.network_timeout)
            .await
            .map(|_| ())
    }

    pub async fn run_operation(&self, operation: UiOperation) -> Result<()> {
        match operation {
            UiOperation::ShowInbox => self.show_inbox().await,
            UiOperation::HideInbox => self.hide_inbox().await,
            UiOperation::ShowRewardsCatalog => self.show_rewards_catalog().await,
            UiOperation::HideRewardsCatalog => self.hide_rewards_catalog().await,
            UiOperation::ToggleInbox => {
                if self.is_inbox_open() {
                    self.hide_inbox().await
                } else {
                    self.show_inbox().await
                }
            }
            UiOperation::ToggleRewardsCatalog => {
                if self.is_rewards_catalog_open() {
                    self.hide_rewards_catalog().await
                } else {
                    self.show_rewards_catalog().await
                }
            }
            UiOperation::HideOverlays => {
                self.hide_rewards_catalog().await?;
                self.hide_inbox().await
            }
        }
    }

    /// Runs `operation` as its own task. Failures are published as
    /// [`SessionEvent::OperationFailed`]; aborting the handle withdraws the
    /// pending request.
    pub fn spawn_operation(self: &Arc<Self>, operation: UiOperation) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = session.run_operation(operation).await {
                tracing::warn!(operation = operation.as_str(), %error, "ui operation failed");
                session
                    .hub
                    .emit(SessionEvent::OperationFailed {
                        operation,
                        message: error.to_string(),
                    })
                    .await;
            }
        })
    }

    /// Records a store purchase. `receipt_json` is the store receipt wrapper;
    /// its `Payload` field is forwarded. Returns whether the backend accepted
    /// the purchase.
    pub async fn confirm_iap(
        &self,
        product_id: &str,
        transaction_id: &str,
        receipt_json: &str,
    ) -> Result<bool> {
        let payload = PurchasePayload {
            product_id: product_id.to_string(),
            transaction_id: transaction_id.to_string(),
            receipt_data: extract_receipt_payload(receipt_json)?,
            purchase_type: self.config.platform.purchase_type().to_string(),
        };

        match self
            .request("savePurchase", json!(payload), self.config.network_timeout)
            .await
        {
            Ok(_) => Ok(true),
            Err(error @ (BridgeError::Remote(_) | BridgeError::TimedOut)) => {
                tracing::warn!(%error, product_id, "purchase was not saved");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    pub async fn start_game_with_tokens(&self, token_count: u32) -> Result<()> {
        self.request(
            "startGameWithTokens",
            json!(token_count),
            self.config.network_timeout,
        )
        .await
        .map(|_| ())
    }

    pub async fn collect_game_tickets(&self, score_percent: u32) -> Result<i64> {
        let reply = self
            .request(
                "collectGameTickets",
                json!(score_percent),
                self.config.network_timeout,
            )
            .await?;

        coerce_int(&reply.data).ok_or_else(|| {
            BridgeError::UnexpectedPayload(format!("ticket count was {}", reply.data))
        })
    }

    pub async fn verify_user(&self) -> Result<bool> {
        let reply = self
            .request("verifyUser", Value::Null, self.config.verify_timeout())
            .await?;

        reply.data.as_bool().ok_or_else(|| {
            BridgeError::UnexpectedPayload(format!("verification result was {}", reply.data))
        })
    }

    /// Stores host-reported margins and applies them unless a full-screen
    /// route currently overrides them.
    pub fn set_margins(&self, margins: Margins) {
        let forced = {
            let mut state = lock(&self.state);
            state.margins = margins;
            state.is_full_screen_forced
        };

        if !forced {
            // The surface ignores a resize to its current frame; nudge it first.
            self.surface.set_margins(margins.with_bottom_offset(-1));
            self.surface.set_margins(margins);
        }
    }

    /// Entry point for raw strings the surface receives from the page.
    /// Returns the reply sent back to the peer, if any.
    pub async fn handle_message(&self, raw: &str) -> Option<String> {
        let envelope = decode(raw)?;
        tracing::debug!(id = envelope.id, kind = %envelope.kind, "received message");

        self.hub
            .emit(SessionEvent::MessageReceived(envelope.clone()))
            .await;

        let message = InboundMessage::from_envelope(&envelope);
        let (data, error) = self.apply_side_effects(message).await;
        self.registry.dispatch(&envelope);

        if envelope.is_response() {
            return None;
        }

        let reply = Envelope::response_to(&envelope, data, error).to_wire();
        self.surface.evaluate_script(&post_message_script(&reply));
        Some(reply)
    }

    async fn apply_side_effects(&self, message: InboundMessage) -> (Value, Option<String>) {
        match message {
            InboundMessage::NavigationRouteUpdated(path) => {
                self.apply_route(&path);
                (Value::Null, None)
            }
            InboundMessage::StorageGetItem(key) => match self.storage.get(&key) {
                Some(value) => (Value::String(value), None),
                None => (Value::Null, None),
            },
            InboundMessage::StorageSetItem { key, value } => {
                match self.storage.set(&key, &value) {
                    Ok(()) => (Value::String(value), None),
                    Err(error) => {
                        tracing::warn!(%error, key = %key, "failed to persist peer storage item");
                        (Value::Null, Some(error.to_string()))
                    }
                }
            }
            InboundMessage::UserUpdated(user) => {
                lock(&self.state).user = Some(user.clone());
                self.hub.emit(SessionEvent::UserUpdated(user)).await;
                (Value::Null, None)
            }
            InboundMessage::ClientInitialized | InboundMessage::Unknown(_) => (Value::Null, None),
        }
    }

    fn apply_route(&self, path: &str) {
        let forced = path.starts_with(AUTH_ROUTE_PREFIX);
        let margins_change = {
            let mut state = lock(&self.state);
            state.current_path = path.to_string();
            if state.is_full_screen_forced == forced {
                None
            } else {
                state.is_full_screen_forced = forced;
                Some(if forced { Margins::ZERO } else { state.margins })
            }
        };

        self.surface.set_visibility(path != HOME_ROUTE);
        if let Some(margins) = margins_change {
            self.surface.set_margins(margins);
        }
    }

    /// Called by the surface integration once a page has finished loading.
    pub fn on_page_loaded(&self, url: &str) {
        tracing::debug!(url, "page loaded");

        let mut script = BOOTSTRAP_SCRIPT.to_string();
        if self.config.disable_transitions {
            script.push_str(DISABLE_TRANSITIONS_SCRIPT);
        }
        self.surface.evaluate_script(&script);

        if let Some(start_url) = self.start_url() {
            self.surface
                .set_url_pattern("", "", &external_url_pattern(&start_url));
        }
    }

    /// Called for navigations the surface intercepted.
    pub async fn on_url_hooked(&self, url: &str) {
        if url == "about:blank" {
            return;
        }
        self.hub
            .emit(SessionEvent::OpenExternalUrl(url.to_string()))
            .await;
    }

    /// Called for load, script or HTTP failures inside the surface.
    pub async fn report_surface_error(&self, message: &str) {
        tracing::warn!(message, "browser surface error");
        self.hub
            .emit(SessionEvent::SurfaceError(message.to_string()))
            .await;

        let envelope = Envelope::surface_error(message);
        self.hub
            .emit(SessionEvent::MessageReceived(envelope.clone()))
            .await;
        self.registry.dispatch(&envelope);
    }

    pub fn phase(&self) -> SessionPhase {
        *lock(&self.phase)
    }

    pub fn is_initialized(&self) -> bool {
        self.phase() == SessionPhase::Ready
    }

    pub fn start_url(&self) -> Option<String> {
        lock(&self.start_url).clone()
    }

    pub fn state(&self) -> SessionState {
        lock(&self.state).clone()
    }

    pub fn current_path(&self) -> String {
        lock(&self.state).current_path.clone()
    }

    pub fn is_inbox_open(&self) -> bool {
        lock(&self.state).current_path.starts_with(INBOX_ROUTE_PREFIX)
    }

    pub fn is_rewards_catalog_open(&self) -> bool {
        lock(&self.state)
            .current_path
            .starts_with(CATALOG_ROUTE_PREFIX)
    }

    pub fn is_full_screen_forced(&self) -> bool {
        lock(&self.state).is_full_screen_forced
    }

    pub fn margins(&self) -> Margins {
        lock(&self.state).margins
    }

    pub fn user(&self) -> Option<UserData> {
        lock(&self.state).user.clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.registry.pending_count()
    }
}

struct InitializingGuard<'a> {
    phase: &'a Mutex<SessionPhase>,
    committed: bool,
}

impl InitializingGuard<'_> {
    fn commit(mut self) {
        *lock(self.phase) = SessionPhase::Ready;
        self.committed = true;
    }
}

impl Drop for InitializingGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            *lock(self.phase) = SessionPhase::Uninitialized;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hook pattern matching every URL except the local client and captcha
/// frames.
fn external_url_pattern(start_url: &str) -> String {
    format!("^(?:(?!recaptcha|{}).)*$", regex::escape(start_url))
}
