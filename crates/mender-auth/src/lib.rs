//! The authorization manager (§4.4, C4).
//!
//! A single long-running cooperative task owning the device key, the
//! identity source, the tenant token, the cached bearer token, and the
//! configured server list, serving concurrent consumers over a
//! request/broadcast channel pair. Grounded on the teacher's key-management
//! style in `shipper-encrypt` (explicit `Config` + `Result`-returning
//! primitives, no process-wide singleton) and generalized here into an owned
//! background task per SPEC_FULL.md §9 ("Global auth manager": an owned task
//! whose handle is passed explicitly, never a process singleton).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use ed25519_dalek::{Signer, SigningKey, pkcs8::EncodePublicKey};
use mender_store::{KvOps, StoreError};
use mender_types::token::{AUTH_TOKEN_KEY, AuthToken};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const DEVICE_KEY_STORE_KEY: &str = "device-private-key";

/// The device's persisted Ed25519 keypair (§6 "the device key pair under a
/// configured path"), abstracted behind a trait because the cryptographic
/// key store is an out-of-scope external collaborator (§1); this crate only
/// needs a place to load and save 32 raw signing-key bytes.
pub trait KeyStore: Send + Sync {
    fn load(&self) -> Result<Option<SigningKey>>;
    fn save(&self, key: &SigningKey) -> Result<()>;
    /// Whether a static (externally provisioned) key is in effect; if so the
    /// manager must never silently regenerate one (§4.4 step 1).
    fn has_static_key_marker(&self) -> bool;
}

/// A `KeyStore` backed by the persistent store facade (C1), used when no
/// static key is provisioned out-of-band.
pub struct StoreKeyStore<S> {
    store: S,
    static_marker: bool,
}

impl<S: KvOps> StoreKeyStore<S> {
    pub fn new(store: S, static_marker: bool) -> Self {
        Self { store, static_marker }
    }
}

impl<S: KvOps + Send + Sync> KeyStore for StoreKeyStore<S> {
    fn load(&self) -> Result<Option<SigningKey>> {
        match self.store.read_all(DEVICE_KEY_STORE_KEY) {
            Ok(bytes) => {
                let arr: [u8; 32] =
                    bytes.as_slice().try_into().context("device key has wrong length")?;
                Ok(Some(SigningKey::from_bytes(&arr)))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &SigningKey) -> Result<()> {
        self.store.write_all(DEVICE_KEY_STORE_KEY, key.to_bytes().as_slice())?;
        Ok(())
    }

    fn has_static_key_marker(&self) -> bool {
        self.static_marker
    }
}

/// The identity source: an external command that prints `key=value` pairs
/// (§4.4, §6 "identity source"). Out-of-scope external collaborator — the
/// manager only consumes this interface.
pub trait IdentitySource: Send + Sync {
    fn get_identity_data(&self) -> Result<BTreeMap<String, String>>;
}

/// A fixed identity, useful for tests and for devices whose identity never
/// changes at runtime.
pub struct StaticIdentitySource(pub BTreeMap<String, String>);

impl IdentitySource for StaticIdentitySource {
    fn get_identity_data(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.0.clone())
    }
}

/// Runs a single configured identity script and parses its `key=value`
/// stdout lines, the same collection convention the inventory gatherer uses
/// for its scripts, reduced here to one script because the identity data is
/// a single opaque blob from the manager's point of view.
///
/// `get_identity_data` is synchronous (the trait is called from inside the
/// manager's own async task, where blocking on another `tokio` runtime would
/// deadlock), so this spawns and waits with `std::process` directly, polling
/// `try_wait` against the timeout rather than reusing the hook executor's
/// `tokio::process` primitive.
pub struct ScriptIdentitySource {
    pub script: PathBuf,
    pub timeout: Duration,
}

impl ScriptIdentitySource {
    pub fn new(script: PathBuf, timeout: Duration) -> Self {
        Self { script, timeout }
    }
}

impl IdentitySource for ScriptIdentitySource {
    fn get_identity_data(&self) -> Result<BTreeMap<String, String>> {
        use std::io::Read;
        use std::process::{Command, Stdio};

        let mut child = Command::new(&self.script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning identity script {}", self.script.display()))?;

        let deadline = std::time::Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait().context("polling identity script")? {
                break status;
            }
            if std::time::Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!("identity script {} timed out after {:?}", self.script.display(), self.timeout);
            }
            std::thread::sleep(Duration::from_millis(20));
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut p) = child.stdout.take() {
            let _ = p.read_to_string(&mut stdout);
        }
        if let Some(mut p) = child.stderr.take() {
            let _ = p.read_to_string(&mut stderr);
        }
        if !status.success() {
            anyhow::bail!("identity script {} exited {:?}: {}", self.script.display(), status.code(), stderr.trim());
        }

        let mut identity = BTreeMap::new();
        for line in stdout.lines() {
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();
                if !key.is_empty() {
                    identity.insert(key.to_string(), value.to_string());
                }
            }
        }
        Ok(identity)
    }
}

/// One server's response to a signed auth request.
#[derive(Debug, Clone)]
pub enum AuthResponse {
    Ok { token: Vec<u8> },
    Unauthorized,
    ClientError(u16),
}

/// The request body signed and sent to each server in turn (§4.4 step 2):
/// `identity_json || tenant_token || public_key_der`, signed as a whole.
#[derive(Debug, Clone)]
pub struct SignedAuthRequest {
    pub identity_json: String,
    pub tenant_token: String,
    pub public_key_der: Vec<u8>,
    pub signature_b64: String,
}

impl SignedAuthRequest {
    fn build(identity: &BTreeMap<String, String>, tenant_token: &str, key: &SigningKey) -> Result<Self> {
        let identity_json = serde_json::to_string(identity).context("serialize identity")?;
        let public_key_der = key
            .verifying_key()
            .to_public_key_der()
            .context("encode device public key as DER")?
            .into_vec();

        let mut body = Vec::with_capacity(identity_json.len() + tenant_token.len() + public_key_der.len());
        body.extend_from_slice(identity_json.as_bytes());
        body.extend_from_slice(tenant_token.as_bytes());
        body.extend_from_slice(&public_key_der);

        let signature = key.sign(&body);
        let signature_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, signature.to_bytes());

        Ok(Self { identity_json, tenant_token: tenant_token.to_string(), public_key_der, signature_b64 })
    }
}

/// The HTTP transport abstraction (§1: transport/TLS is an out-of-scope
/// external collaborator; §5 names `reqwest`/`rustls` as the production
/// substrate). [`ReqwestTransport`] is the real implementation; tests supply
/// a fake.
#[async_trait::async_trait]
pub trait AuthTransport: Send + Sync {
    async fn send_auth_request(&self, server: &str, request: &SignedAuthRequest) -> Result<AuthResponse>;
}

/// The production transport: POSTs the signed request to `<server>/api/devices/v1/authentication/auth_requests`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl AuthTransport for ReqwestTransport {
    async fn send_auth_request(&self, server: &str, request: &SignedAuthRequest) -> Result<AuthResponse> {
        let url = format!("{}/api/devices/v1/authentication/auth_requests", server.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("X-MEN-Signature", &request.signature_b64)
            .body(request.identity_json.clone())
            .send()
            .await
            .with_context(|| format!("auth request to {server} failed"))?;

        match response.status().as_u16() {
            200 => {
                let token = response.bytes().await.context("read auth response body")?.to_vec();
                Ok(AuthResponse::Ok { token })
            }
            401 => Ok(AuthResponse::Unauthorized),
            code => Ok(AuthResponse::ClientError(code)),
        }
    }
}

/// Index-based cursor over the configured server list (§9 "Iterator closure
/// over servers": expressed as an explicit cursor so restart semantics are
/// inspectable in tests, rather than a closure capturing hidden state).
pub struct ServerCursor<'a> {
    servers: &'a [String],
    idx: usize,
}

impl<'a> ServerCursor<'a> {
    pub fn new(servers: &'a [String]) -> Self {
        Self { servers, idx: 0 }
    }

    pub fn position(&self) -> usize {
        self.idx
    }
}

impl<'a> Iterator for ServerCursor<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let server = self.servers.get(self.idx)?;
        self.idx += 1;
        Some(server.as_str())
    }
}

/// Bootstrap (or load) the device key (§4.4 step 1).
fn bootstrap_key(key_store: &dyn KeyStore, force_bootstrap: &AtomicBool) -> Result<SigningKey> {
    let forced = force_bootstrap.swap(false, Ordering::SeqCst);

    if key_store.has_static_key_marker() {
        return key_store
            .load()?
            .context("static key marker set but no device key is present");
    }

    if forced {
        let key = SigningKey::generate(&mut rand_core::OsRng);
        key_store.save(&key)?;
        info!("device key regenerated via ForceBootstrap");
        return Ok(key);
    }

    match key_store.load()? {
        Some(key) => Ok(key),
        None => {
            let key = SigningKey::generate(&mut rand_core::OsRng);
            key_store.save(&key)?;
            info!("device key generated");
            Ok(key)
        }
    }
}

/// Outcome of one fetch attempt, reported back to the manager's main loop.
struct FetchOutcome {
    token: AuthToken,
    server_url: Option<String>,
    error: Option<String>,
    clear_cached: bool,
}

async fn run_fetch(
    servers: Vec<String>,
    tenant_token: String,
    key_store: Arc<dyn KeyStore>,
    identity_source: Arc<dyn IdentitySource>,
    transport: Arc<dyn AuthTransport>,
    force_bootstrap: Arc<AtomicBool>,
) -> FetchOutcome {
    let key = match bootstrap_key(key_store.as_ref(), &force_bootstrap) {
        Ok(k) => k,
        Err(e) => {
            return FetchOutcome { token: AuthToken::none(), server_url: None, error: Some(e.to_string()), clear_cached: false };
        }
    };

    let identity = match identity_source.get_identity_data() {
        Ok(id) => id,
        Err(e) => {
            return FetchOutcome { token: AuthToken::none(), server_url: None, error: Some(e.to_string()), clear_cached: false };
        }
    };

    let mut last_error = None;
    let mut clear_cached = false;

    for server in ServerCursor::new(&servers) {
        let request = match SignedAuthRequest::build(&identity, &tenant_token, &key) {
            Ok(r) => r,
            Err(e) => {
                last_error = Some(e.to_string());
                continue;
            }
        };

        match transport.send_auth_request(server, &request).await {
            Ok(AuthResponse::Ok { token }) => {
                return FetchOutcome {
                    token: AuthToken::from_bytes(token),
                    server_url: Some(server.to_string()),
                    error: None,
                    clear_cached: false,
                };
            }
            Ok(AuthResponse::Unauthorized) => {
                clear_cached = true;
                last_error = Some(format!("{server}: unauthorized"));
                warn!(server, "auth server rejected cached credential");
            }
            Ok(AuthResponse::ClientError(code)) => {
                last_error = Some(format!("{server}: HTTP {code}"));
                debug!(server, code, "auth server returned client error, trying next");
            }
            Err(e) => {
                last_error = Some(format!("{server}: {e}"));
                debug!(server, error = %e, "auth request failed, trying next");
            }
        }
    }

    FetchOutcome { token: AuthToken::none(), server_url: None, error: last_error, clear_cached }
}

/// Event broadcast to every subscriber. The wire name chosen per the
/// resolved open question in SPEC_FULL.md §9/§6 is the parameterized
/// `JwtTokenStateChange(token, serverURL)` form.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// `JwtTokenStateChange(token, serverURL)`: the cached token appeared,
    /// changed, or was removed (in which case `token.is_none()`).
    TokenStateChange { token: AuthToken, server_url: Option<String> },
    /// A `fetch()` request concluded, successfully or not.
    FetchCompleted { success: bool, error: Option<String> },
}

enum AuthRequest {
    Get { reply: oneshot::Sender<AuthToken> },
    Fetch { reply: oneshot::Sender<()> },
}

/// The manager's public handle. All interaction is message-passing; there is
/// no shared mutable state visible to callers (§4.4).
pub struct AuthManagerHandle {
    request_tx: mpsc::Sender<AuthRequest>,
    events_tx: broadcast::Sender<AuthEvent>,
    force_bootstrap: Arc<AtomicBool>,
    stop_tx: Option<watch::Sender<bool>>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl AuthManagerHandle {
    /// Return the cached token, or `AuthToken::none()`, without a network
    /// call (§4.4 "get").
    pub async fn get(&self) -> AuthToken {
        let (reply, rx) = oneshot::channel();
        if self.request_tx.send(AuthRequest::Get { reply }).await.is_err() {
            return AuthToken::none();
        }
        rx.await.unwrap_or_else(|_| AuthToken::none())
    }

    /// Trigger a fetch; returns once the manager has acknowledged receipt,
    /// not once the fetch completes. Subscribe to [`AuthManagerHandle::subscribe`]
    /// for the result (§4.4 "fetch").
    pub async fn fetch(&self) {
        let (reply, rx) = oneshot::channel();
        if self.request_tx.send(AuthRequest::Fetch { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events_tx.subscribe()
    }

    /// Make the next fetch regenerate the device key even if one is present
    /// (§4.4 step 4), unless a static key marker is in effect.
    pub fn force_bootstrap(&self) {
        self.force_bootstrap.store(true, Ordering::SeqCst);
    }

    /// Stop the background task, waiting up to 1s for a clean shutdown
    /// before forcing it (§4.4 "Finalizer guarantee").
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(join) = self.join.take() {
            if tokio::time::timeout(Duration::from_secs(1), join).await.is_err() {
                warn!("auth manager task did not stop within 1s; it will be aborted on drop");
            }
        }
    }
}

/// Dropping the handle must stop the task within a bounded time (§4.4
/// "Finalizer guarantee"). `abort()` is immediate rather than cooperative,
/// but it is the only bound `Drop` (which cannot `.await`) can offer.
impl Drop for AuthManagerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

/// Spawn the authorization manager as a background task (§4.4, §9 "Global
/// auth manager": an owned task whose handle is passed explicitly).
pub fn spawn(
    servers: Vec<String>,
    tenant_token: String,
    key_store: Arc<dyn KeyStore>,
    identity_source: Arc<dyn IdentitySource>,
    transport: Arc<dyn AuthTransport>,
) -> AuthManagerHandle {
    let (request_tx, mut request_rx) = mpsc::channel::<AuthRequest>(1024);
    let (events_tx, _events_rx) = broadcast::channel(256);
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let force_bootstrap = Arc::new(AtomicBool::new(false));
    let force_bootstrap_task = force_bootstrap.clone();
    let events_tx_task = events_tx.clone();

    let join = tokio::spawn(async move {
        let mut cached_token = AuthToken::none();
        let (fetch_done_tx, mut fetch_done_rx) = mpsc::channel::<FetchOutcome>(16);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                Some(request) = request_rx.recv() => {
                    match request {
                        AuthRequest::Get { reply } => {
                            let _ = reply.send(cached_token.clone());
                        }
                        AuthRequest::Fetch { reply } => {
                            let _ = reply.send(());
                            let servers = servers.clone();
                            let tenant_token = tenant_token.clone();
                            let key_store = key_store.clone();
                            let identity_source = identity_source.clone();
                            let transport = transport.clone();
                            let force_bootstrap = force_bootstrap_task.clone();
                            let done_tx = fetch_done_tx.clone();
                            tokio::spawn(async move {
                                let outcome = run_fetch(servers, tenant_token, key_store, identity_source, transport, force_bootstrap).await;
                                let _ = done_tx.send(outcome).await;
                            });
                        }
                    }
                }
                Some(outcome) = fetch_done_rx.recv() => {
                    if outcome.clear_cached {
                        cached_token = AuthToken::none();
                    }
                    if !outcome.token.is_none() {
                        cached_token = outcome.token.clone();
                    } else if outcome.error.is_some() && outcome.clear_cached {
                        cached_token = AuthToken::none();
                    }
                    let _ = events_tx_task.send(AuthEvent::TokenStateChange {
                        token: cached_token.clone(),
                        server_url: outcome.server_url,
                    });
                    let _ = events_tx_task.send(AuthEvent::FetchCompleted {
                        success: outcome.error.is_none(),
                        error: outcome.error,
                    });
                }
                else => break,
            }
        }
    });

    AuthManagerHandle {
        request_tx,
        events_tx,
        force_bootstrap,
        stop_tx: Some(stop_tx),
        join: Some(join),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct MemoryKeyStore {
        key: StdMutex<Option<SigningKey>>,
        static_marker: bool,
    }

    impl KeyStore for MemoryKeyStore {
        fn load(&self) -> Result<Option<SigningKey>> {
            Ok(self.key.lock().unwrap().clone())
        }
        fn save(&self, key: &SigningKey) -> Result<()> {
            *self.key.lock().unwrap() = Some(key.clone());
            Ok(())
        }
        fn has_static_key_marker(&self) -> bool {
            self.static_marker
        }
    }

    struct FakeTransport {
        responses: StdMutex<Vec<(String, AuthResponse)>>,
    }

    #[async_trait::async_trait]
    impl AuthTransport for FakeTransport {
        async fn send_auth_request(&self, server: &str, _request: &SignedAuthRequest) -> Result<AuthResponse> {
            let mut responses = self.responses.lock().unwrap();
            if let Some(pos) = responses.iter().position(|(s, _)| s == server) {
                Ok(responses.remove(pos).1)
            } else {
                anyhow::bail!("no fake response configured for {server}")
            }
        }
    }

    #[test]
    fn server_cursor_advances_in_order() {
        let servers = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut cursor = ServerCursor::new(&servers);
        assert_eq!(cursor.next(), Some("a"));
        assert_eq!(cursor.position(), 1);
        assert_eq!(cursor.next(), Some("b"));
        assert_eq!(cursor.next(), Some("c"));
        assert_eq!(cursor.next(), None);
    }

    #[test]
    fn bootstrap_generates_key_when_absent() {
        let key_store = MemoryKeyStore { key: StdMutex::new(None), static_marker: false };
        let force = AtomicBool::new(false);
        let key = bootstrap_key(&key_store, &force).unwrap();
        assert_eq!(key_store.load().unwrap().unwrap().to_bytes(), key.to_bytes());
    }

    #[test]
    fn static_marker_without_key_is_an_error_not_a_panic() {
        let key_store = MemoryKeyStore { key: StdMutex::new(None), static_marker: true };
        let force = AtomicBool::new(false);
        assert!(bootstrap_key(&key_store, &force).is_err());
    }

    #[test]
    fn static_marker_with_key_never_regenerates() {
        let existing = SigningKey::generate(&mut rand_core::OsRng);
        let key_store = MemoryKeyStore { key: StdMutex::new(Some(existing.clone())), static_marker: true };
        let force = AtomicBool::new(true);
        let key = bootstrap_key(&key_store, &force).unwrap();
        assert_eq!(key.to_bytes(), existing.to_bytes());
    }

    #[test]
    fn force_bootstrap_regenerates_existing_key() {
        let existing = SigningKey::generate(&mut rand_core::OsRng);
        let key_store = MemoryKeyStore { key: StdMutex::new(Some(existing.clone())), static_marker: false };
        let force = AtomicBool::new(true);
        let key = bootstrap_key(&key_store, &force).unwrap();
        assert_ne!(key.to_bytes(), existing.to_bytes());
        assert!(!force.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn fetch_tries_next_server_on_client_error() {
        let identity = Arc::new(StaticIdentitySource(BTreeMap::from([("mac".to_string(), "aa:bb".to_string())])));
        let key_store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore { key: StdMutex::new(None), static_marker: false });
        let transport = Arc::new(FakeTransport {
            responses: StdMutex::new(vec![
                ("https://a".to_string(), AuthResponse::ClientError(400)),
                ("https://b".to_string(), AuthResponse::Ok { token: b"tok".to_vec() }),
            ]),
        });

        let outcome = run_fetch(
            vec!["https://a".to_string(), "https://b".to_string()],
            "tenant".to_string(),
            key_store,
            identity,
            transport,
            Arc::new(AtomicBool::new(false)),
        )
        .await;

        assert_eq!(outcome.token, AuthToken::from_bytes(b"tok".to_vec()));
        assert_eq!(outcome.server_url.as_deref(), Some("https://b"));
    }

    #[tokio::test]
    async fn handle_get_without_fetch_returns_no_auth_token() {
        let identity: Arc<dyn IdentitySource> = Arc::new(StaticIdentitySource(BTreeMap::new()));
        let key_store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore { key: StdMutex::new(None), static_marker: false });
        let transport: Arc<dyn AuthTransport> = Arc::new(FakeTransport { responses: StdMutex::new(vec![]) });

        let handle = spawn(vec![], "tenant".to_string(), key_store, identity, transport);
        let token = handle.get().await;
        assert!(token.is_none());
        handle.stop().await;
    }

    #[tokio::test]
    async fn fetch_broadcasts_token_state_change() {
        let identity: Arc<dyn IdentitySource> = Arc::new(StaticIdentitySource(BTreeMap::new()));
        let key_store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore { key: StdMutex::new(None), static_marker: false });
        let transport: Arc<dyn AuthTransport> = Arc::new(FakeTransport {
            responses: StdMutex::new(vec![("https://a".to_string(), AuthResponse::Ok { token: b"tok".to_vec() })]),
        });

        let handle = spawn(vec!["https://a".to_string()], "tenant".to_string(), key_store, identity, transport);
        let mut events = handle.subscribe();
        handle.fetch().await;

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        match event {
            AuthEvent::TokenStateChange { token, .. } => assert_eq!(token, AuthToken::from_bytes(b"tok".to_vec())),
            other => panic!("unexpected event: {other:?}"),
        }
        handle.stop().await;
    }
}
