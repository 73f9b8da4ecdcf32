//! Authentication engine
//!
//! Decides, for every inbound request, whether its sender is authenticated
//! before the request moves on through the module chain. In order:
//! test-account creation (opt-in), trusted peer bypass, TLS client
//! certificate identity, then digest challenge/response against the
//! realm of the request.
//!
//! The credential lookup is the only await point. When the backend answers
//! asynchronously the request is suspended for the duration of the lookup,
//! and the result is dropped if the pipeline terminated the request meanwhile.

use crate::config::{declared_option, AuthConfig, Config, ConfigError, ConfigOption, AUTHENTICATION_OPTIONS};
use crate::domain::certificate::{CertificateMatcher, CertificateTrustConfig, ClaimedIdentity};
use crate::domain::credential::{
    CredentialBackend, CredentialLookup, CredentialMaterial, PasswordLookup, TestAccount,
};
use crate::domain::trusted_peers::TrustedPeerRegistry;
use crate::infrastructure::metrics::{AuthStats, AuthStatsSnapshot, DecisionOutcome};
use crate::infrastructure::protocols::sip::auth_module::{AuthModule, DigestVerdict, RealmSettings};
use crate::infrastructure::protocols::sip::builder::ResponseBuilder;
use crate::infrastructure::protocols::sip::digest::{AuthorizationHeader, DigestAlgorithm};
use crate::infrastructure::protocols::sip::event::{RequestEvent, ResponseEvent};
use crate::infrastructure::protocols::sip::handler::{ModuleAction, SipModule};
use crate::infrastructure::protocols::sip::message::SipRequest;
use crate::infrastructure::protocols::sip::transaction::TransactionLayer;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Name under which the engine suspends requests
pub const MODULE_NAME: &str = "Authentication";

/// Transaction property holding the realm that authenticated the request
pub const THIS_PROXY_REALM: &str = "this_proxy_realm";

/// Transaction property holding the `nonce:nc` pair accepted for the request
const ACCEPTED_NONCE_COUNT: &str = "auth_accepted_nonce_count";

/// How the request was authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    TrustedHost,
    TlsCertificate,
    Digest,
}

/// Result of [`AuthenticationEngine::validate_request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Authenticated; the request continues downstream
    Allowed(AuthMethod),
    /// Answered here with this status; the event holds the response
    Replied(u16),
    /// The request was terminated by the pipeline while being processed
    Terminated,
}

/// Settings snapshot, replaced as a whole on configuration commit
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
    pub realm: RealmSettings,
    pub certificates: CertificateMatcher,
    pub reject_wrong_client_certificates: bool,
    pub new_auth_on_407: bool,
    pub enable_test_accounts_creation: bool,
    pub no_403: bool,
}

impl AuthSettings {
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let algorithms = config
            .available_algorithms
            .iter()
            .map(|name| {
                name.parse::<DigestAlgorithm>()
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "available-algorithms",
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if algorithms.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "available-algorithms",
                reason: "at least one algorithm is required".to_string(),
            });
        }

        let certificates = CertificateTrustConfig::new(
            &config.tls_client_certificate_required_subject,
            config.trusted_client_certificates.clone(),
            config.trust_domain_certificates,
        )
        .map_err(|e| ConfigError::InvalidValue {
            key: "tls-client-certificate-required-subject",
            reason: e.to_string(),
        })?;

        if config.hashed_passwords {
            warn!("'hashed-passwords' is deprecated and ignored");
        }
        if !config.trusted_client_certificates.is_empty() {
            warn!("'trusted-client-certificates' is deprecated, use 'tls-client-certificate-required-subject'");
        }

        Ok(Self {
            realm: RealmSettings {
                algorithms,
                qop_auth: !config.disable_qop_auth,
                nonce_expire: config.nonce_lifetime()?,
            },
            certificates: CertificateMatcher::new(certificates),
            reject_wrong_client_certificates: config.reject_wrong_client_certificates,
            new_auth_on_407: config.new_auth_on_407,
            enable_test_accounts_creation: config.enable_test_accounts_creation,
            no_403: config.no_403,
        })
    }
}

/// Status code and header names of a digest exchange
#[derive(Debug, Clone, Copy)]
struct ChallengeKind {
    status: u16,
    challenge_header: &'static str,
    credentials_header: &'static str,
}

impl ChallengeKind {
    fn for_request(request: &SipRequest) -> Self {
        if request.is_register() {
            Self {
                status: 401,
                challenge_header: "WWW-Authenticate",
                credentials_header: "Authorization",
            }
        } else {
            Self {
                status: 407,
                challenge_header: "Proxy-Authenticate",
                credentials_header: "Proxy-Authorization",
            }
        }
    }
}

/// Credentials accepted in a transaction, with the request that carried them.
/// A later request of the transaction is a retransmission only when all of
/// it matches.
#[derive(Debug, PartialEq, Eq)]
struct AcceptedCredentials {
    nonce: String,
    nc: Option<String>,
    call_id: Option<String>,
    cseq: Option<String>,
    from_tag: Option<String>,
    contacts: Vec<String>,
}

impl AcceptedCredentials {
    fn of(credentials: &AuthorizationHeader, request: &SipRequest) -> Self {
        Self {
            nonce: credentials.nonce.clone(),
            nc: credentials.nc.clone(),
            call_id: request.call_id(),
            cseq: request.cseq(),
            from_tag: request.from_tag(),
            contacts: request.header_all("Contact"),
        }
    }
}

/// The request was terminated while a lookup was outstanding
struct Terminated;

pub struct AuthenticationEngine {
    settings: ArcSwap<AuthSettings>,
    realms: RwLock<HashMap<String, Arc<AuthModule>>>,
    trusted_peers: TrustedPeerRegistry,
    backend: Arc<dyn CredentialBackend>,
    transactions: Arc<TransactionLayer>,
    stats: Arc<AuthStats>,
}

impl AuthenticationEngine {
    /// Build the engine from a loaded configuration.
    pub fn new(
        config: &Config,
        backend: Arc<dyn CredentialBackend>,
        transactions: Arc<TransactionLayer>,
    ) -> Result<Self, ConfigError> {
        let settings = AuthSettings::from_config(&config.authentication)?;
        let trusted_peers = TrustedPeerRegistry::from_sources(&config.trusted_sources());
        info!(
            "Authentication engine ready: {} trusted hosts, algorithms {:?}",
            trusted_peers.len(),
            settings.realm.algorithms
        );

        Ok(Self {
            settings: ArcSwap::from_pointee(settings),
            realms: RwLock::new(HashMap::new()),
            trusted_peers,
            backend,
            transactions,
            stats: Arc::new(AuthStats::new()),
        })
    }

    pub fn settings(&self) -> Arc<AuthSettings> {
        self.settings.load_full()
    }

    pub fn trusted_peers(&self) -> &TrustedPeerRegistry {
        &self.trusted_peers
    }

    pub fn stats(&self) -> AuthStatsSnapshot {
        self.stats.snapshot()
    }

    /// Realm module for `realm`, if one was created
    pub fn realm(&self, realm: &str) -> Option<Arc<AuthModule>> {
        self.realms.read().get(realm).cloned()
    }

    pub fn realm_count(&self) -> usize {
        self.realms.read().len()
    }

    fn find_or_create_realm(&self, realm: &str, settings: &AuthSettings) -> Arc<AuthModule> {
        if let Some(module) = self.realms.read().get(realm) {
            return Arc::clone(module);
        }

        let mut realms = self.realms.write();
        let module = realms.entry(realm.to_string()).or_insert_with(|| {
            info!("Found auth domain: {}", realm);
            let stats = Arc::clone(&self.stats);
            Arc::new(AuthModule::new(
                realm,
                settings.realm.clone(),
                Arc::new(move |found| stats.record_password_fetch(found)),
            ))
        });
        Arc::clone(module)
    }

    /// Run the decision procedure on an inbound request.
    pub async fn validate_request(&self, event: &mut RequestEvent) -> AuthOutcome {
        if event.is_terminated() {
            return AuthOutcome::Terminated;
        }

        let settings = self.settings.load_full();
        let (outcome, counted) = self.decide(event, &settings).await;
        self.stats.record_decision(counted);
        outcome
    }

    async fn decide(&self, event: &mut RequestEvent, settings: &AuthSettings) -> (AuthOutcome, DecisionOutcome) {
        if settings.enable_test_accounts_creation {
            if let Some(outcome) = self.handle_test_account_creation(event) {
                return (outcome, DecisionOutcome::TestAccount);
            }
        }

        if self.is_trusted_peer(event.request()) {
            return (
                AuthOutcome::Allowed(AuthMethod::TrustedHost),
                DecisionOutcome::TrustedHost,
            );
        }

        if let Some(outcome) = self.handle_tls_client_authentication(event, settings) {
            let counted = match outcome {
                AuthOutcome::Allowed(_) => DecisionOutcome::TlsCertificate,
                _ => DecisionOutcome::Rejected,
            };
            return (outcome, counted);
        }

        let outcome = self.digest_authentication(event, settings).await;
        let counted = match outcome {
            AuthOutcome::Allowed(_) => DecisionOutcome::Digest,
            AuthOutcome::Replied(401) | AuthOutcome::Replied(407) => DecisionOutcome::Challenged,
            AuthOutcome::Replied(_) => DecisionOutcome::Rejected,
            AuthOutcome::Terminated => DecisionOutcome::Terminated,
        };
        (outcome, counted)
    }

    /// REGISTER carrying `X-Create-Account: yes` creates a temporary account
    /// from the From URI and is answered directly.
    fn handle_test_account_creation(&self, event: &mut RequestEvent) -> Option<AuthOutcome> {
        let request = event.request();
        if !request.is_register() {
            return None;
        }
        let marker = request.header("X-Create-Account")?;
        if !marker.trim().eq_ignore_ascii_case("yes") {
            return None;
        }

        let account = match test_account_from(request) {
            Some(account) => account,
            None => {
                debug!("Account creation request without user, password or expires, ignored");
                return None;
            }
        };

        if let Err(e) = self.backend.create_account(&account) {
            warn!("Could not create account {}@{}: {}", account.user, account.domain, e);
            return None;
        }
        debug!(
            "Account created for {}@{} with password {} and expires {} with phone alias {}",
            account.user, account.domain, account.password, account.expires, account.phone_alias
        );

        let mut builder = ResponseBuilder::ok()
            .reason("Test account created")
            .raw_header("Expires", "0");
        if let Some(contact) = request.header("Contact") {
            builder = builder.raw_header("Contact", contact);
        }
        Some(self.reply(event, builder))
    }

    fn is_trusted_peer(&self, request: &SipRequest) -> bool {
        let via = match request.top_via() {
            Some(via) => via,
            None => return false,
        };
        let host = via.effective_host();
        let trusted = self.trusted_peers.is_trusted_host(host);
        if trusted {
            debug!("Allowing message from trusted host {}", host);
        }
        trusted
    }

    /// `Some` when the TLS path decided (allowed or rejected), `None` to
    /// fall back to digest authentication.
    fn handle_tls_client_authentication(
        &self,
        event: &mut RequestEvent,
        settings: &AuthSettings,
    ) -> Option<AuthOutcome> {
        let transport = event.transport();
        if !(transport.requires_peer_certificate && transport.is_server) {
            return None;
        }

        if transport.peer_verified {
            if let Some(certificate) = &transport.peer_certificate {
                let request = event.request();
                let from = request.from_uri();
                let request_uri = request.request_uri_parsed();

                if let Some(from) = &from {
                    let identity = ClaimedIdentity {
                        from_user: from.user(),
                        from_domain: from.host(),
                        request_uri_domain: request_uri.as_ref().map(|u| u.host()).unwrap_or_default(),
                        is_register: request.is_register(),
                    };

                    match settings.certificates.authenticate(certificate, &identity) {
                        Ok(matched) => {
                            debug!("TLS client certificate accepted: {:?}", matched);
                            return Some(AuthOutcome::Allowed(AuthMethod::TlsCertificate));
                        }
                        Err(rejection) => {
                            error!(
                                "Client is presenting a TLS certificate not matching its identity ({:?})",
                                rejection
                            );
                            warn!("Registration failure for {}, TLS certificate doesn't match its identity", from);
                        }
                    }
                }
            }
        } else {
            debug!("TLS client certificate not verified");
        }

        if settings.reject_wrong_client_certificates {
            let builder = ResponseBuilder::forbidden().reason("Bad tls client certificate");
            return Some(self.reply(event, builder));
        }
        None
    }

    async fn digest_authentication(&self, event: &mut RequestEvent, settings: &AuthSettings) -> AuthOutcome {
        // Retransmissions must share one nonce-count sequence
        let transaction = event.create_incoming_transaction(&self.transactions).await;

        let kind = ChallengeKind::for_request(event.request());
        let realm = match realm_of(event.request()) {
            Some(realm) => realm,
            None => {
                warn!("Request without From or request-URI host, cannot select a realm");
                return self.reply(event, ResponseBuilder::new(400).reason("Missing realm"));
            }
        };
        let module = self.find_or_create_realm(&realm, settings);

        let presented: Vec<AuthorizationHeader> = event
            .request()
            .header_all(kind.credentials_header)
            .iter()
            .filter_map(|value| AuthorizationHeader::parse(value).ok())
            .collect();

        let credentials = match module.select_credentials(&presented) {
            Some(credentials) => credentials.clone(),
            None => return self.challenge(event, &module, kind, false),
        };

        let algorithm = match credentials.digest_algorithm() {
            Ok(algorithm) if module.supports(algorithm) => algorithm,
            _ => {
                debug!("Unsupported digest algorithm {:?}", credentials.algorithm);
                return self.challenge(event, &module, kind, false);
            }
        };

        if !module.nonce_store().contains(&credentials.nonce) {
            debug!("Unknown nonce from {}@{}, challenging again", credentials.username, realm);
            return self.challenge(event, &module, kind, true);
        }

        // The digest username must be the From identity or its phone alias
        let from_user = event
            .request()
            .from_uri()
            .and_then(|uri| uri.user().map(str::to_string))
            .unwrap_or_default();

        let material = match self
            .fetch_credentials(event, &module, &credentials.username, &from_user, algorithm)
            .await
        {
            Ok(material) => material,
            Err(Terminated) => return AuthOutcome::Terminated,
        };

        let accepted = AcceptedCredentials::of(&credentials, event.request());
        let retransmission = transaction
            .property::<AcceptedCredentials>(ACCEPTED_NONCE_COUNT)
            .map(|seen| *seen == accepted)
            .unwrap_or(false);

        let method = event.request().method_name();
        match module.verify(&credentials, &method, material.as_ref(), retransmission) {
            DigestVerdict::Valid => {
                transaction.set_property(ACCEPTED_NONCE_COUNT, accepted);
                info!("{}@{} authenticated with digest {}", credentials.username, realm, algorithm);

                if !event.request().is_register() {
                    remove_consumed_credentials(event, kind.credentials_header, &realm);
                }
                if settings.new_auth_on_407 {
                    transaction.set_property(THIS_PROXY_REALM, realm);
                }
                AuthOutcome::Allowed(AuthMethod::Digest)
            }
            DigestVerdict::StaleNonce | DigestVerdict::Replayed => self.challenge(event, &module, kind, true),
            verdict @ (DigestVerdict::NoCredential | DigestVerdict::WrongResponse) => {
                warn!(
                    "Digest authentication failed for {}@{} (From user '{}'): {:?}",
                    credentials.username, realm, from_user, verdict
                );
                if settings.no_403 {
                    self.challenge(event, &module, kind, false)
                } else {
                    self.reply(event, ResponseBuilder::forbidden())
                }
            }
        }
    }

    /// Look up the secret of `user` in the realm, suspending the request
    /// when the backend answers asynchronously. The outcome is counted even
    /// when the request was terminated meanwhile.
    async fn fetch_credentials(
        &self,
        event: &RequestEvent,
        module: &AuthModule,
        user: &str,
        from_user: &str,
        algorithm: DigestAlgorithm,
    ) -> Result<Option<CredentialMaterial>, Terminated> {
        let (result, suspended) = match self.backend.lookup(user, from_user, module.realm(), algorithm) {
            CredentialLookup::Ready(result) => {
                self.stats.record_sync_retrieve();
                (result, false)
            }
            CredentialLookup::Pending(receiver) => {
                self.stats.record_async_retrieve();
                event.lifecycle().suspend(MODULE_NAME);

                let result = receiver.await.unwrap_or_else(|_| {
                    PasswordLookup::BackendError("lookup abandoned by the backend".to_string())
                });
                (result, true)
            }
        };

        module.password_fetched(result.is_found());
        if let PasswordLookup::BackendError(e) = &result {
            self.stats.record_backend_error();
            warn!("Credential backend error for {}@{}: {}", user, module.realm(), e);
        }

        if suspended && !event.lifecycle().resume() {
            debug!("Request {} terminated during credential lookup, result dropped", event.id());
            return Err(Terminated);
        }

        match result {
            PasswordLookup::Found(material) => Ok(Some(material)),
            PasswordLookup::NotFound | PasswordLookup::BackendError(_) => Ok(None),
        }
    }

    fn challenge(
        &self,
        event: &mut RequestEvent,
        module: &AuthModule,
        kind: ChallengeKind,
        stale: bool,
    ) -> AuthOutcome {
        let mut builder = ResponseBuilder::new(kind.status);
        for challenge in module.challenges(stale) {
            builder = builder.raw_header(kind.challenge_header, challenge.to_header_value());
        }
        debug!("Challenging {} for realm {}", event.request().method_name(), module.realm());
        self.reply(event, builder)
    }

    fn reply(&self, event: &mut RequestEvent, builder: ResponseBuilder) -> AuthOutcome {
        match builder.build_for_request(event.request()) {
            Ok(response) => {
                let status = response.status_code();
                event.reply(response);
                AuthOutcome::Replied(status)
            }
            Err(e) => {
                error!("Could not build response: {}", e);
                event.lifecycle().terminate();
                AuthOutcome::Terminated
            }
        }
    }

    /// Add this proxy's challenge to a 407 coming back from downstream, so
    /// the client answers both challenges in one round trip.
    pub fn on_response(&self, event: &mut ResponseEvent) {
        if !self.settings.load().new_auth_on_407 {
            return;
        }

        let realm = match event
            .transaction()
            .and_then(|txn| txn.property::<String>(THIS_PROXY_REALM))
        {
            Some(realm) => realm,
            None => return,
        };

        let response = event.response();
        if response.status_code() != 407 || response.header_all("Proxy-Authenticate").is_empty() {
            debug!("Response not handled by new-auth-on-407");
            return;
        }

        match self.realm(&realm) {
            Some(module) => {
                let challenge = module.challenge();
                event
                    .response_mut()
                    .push_header("Proxy-Authenticate", challenge.to_header_value());
                debug!("Added proxy challenge for realm {} to 407", realm);
            }
            None => debug!("Authentication module for {} not found", realm),
        }
    }

    /// Periodic maintenance: sweep expired nonces of every realm.
    pub fn on_idle(&self) -> usize {
        self.on_idle_at(Utc::now())
    }

    pub fn on_idle_at(&self, now: DateTime<Utc>) -> usize {
        let modules: Vec<Arc<AuthModule>> = self.realms.read().values().cloned().collect();
        modules
            .iter()
            .map(|module| module.nonce_store().clean_expired_at(now))
            .sum()
    }

    /// Run [`on_idle`](Self::on_idle) every `period`.
    pub fn spawn_idle_task(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                SipModule::on_idle(engine.as_ref());
            }
        })
    }

    /// Apply every option of `config`, as done at load time.
    pub fn apply_config(&self, config: &Config) -> Result<(), ConfigError> {
        self.commit_settings(&config.authentication)?;
        self.trusted_peers.rebuild(&config.trusted_sources());
        Ok(())
    }

    /// Apply the committed value of `key`. Keys of the trusted peer sources
    /// rebuild the registry; other keys replace the settings snapshot.
    pub fn on_config_commit(&self, key: &str, config: &Config) -> Result<(), ConfigError> {
        match key {
            "trusted-hosts"
            | "authentication.trusted-hosts"
            | "cluster.enabled"
            | "cluster.nodes"
            | "presence.enabled"
            | "presence.presence-server" => {
                let count = self.trusted_peers.rebuild(&config.trusted_sources());
                debug!("Trusted hosts updated ({} entries)", count);
                Ok(())
            }
            _ => {
                let name = key.strip_prefix("authentication.").unwrap_or(key);
                if declared_option(name).is_none() {
                    return Err(ConfigError::UnknownOption(key.to_string()));
                }
                self.commit_settings(&config.authentication)
            }
        }
    }

    fn commit_settings(&self, config: &AuthConfig) -> Result<(), ConfigError> {
        let settings = AuthSettings::from_config(config)?;
        let realm_changed = self.settings.load().realm != settings.realm;
        self.settings.store(Arc::new(settings));

        if realm_changed {
            let mut realms = self.realms.write();
            info!("Digest settings changed, dropping {} realms", realms.len());
            realms.clear();
        }
        Ok(())
    }
}

#[async_trait]
impl SipModule for AuthenticationEngine {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn declare_config(&self) -> &'static [ConfigOption] {
        AUTHENTICATION_OPTIONS
    }

    async fn on_request(&self, event: &mut RequestEvent) -> ModuleAction {
        match self.validate_request(event).await {
            AuthOutcome::Allowed(_) => ModuleAction::Continue,
            AuthOutcome::Replied(_) | AuthOutcome::Terminated => ModuleAction::Stop,
        }
    }

    async fn on_response(&self, event: &mut ResponseEvent) -> ModuleAction {
        AuthenticationEngine::on_response(self, event);
        ModuleAction::Continue
    }

    fn on_idle(&self) {
        let removed = AuthenticationEngine::on_idle(self);
        if removed > 0 {
            debug!("Idle sweep removed {} nonces", removed);
        }
    }

    fn on_config_commit(&self, key: &str, config: &Config) -> Result<(), ConfigError> {
        AuthenticationEngine::on_config_commit(self, key, config)
    }
}

/// Realm of a request: the From host, else the request-URI host
fn realm_of(request: &SipRequest) -> Option<String> {
    request
        .from_uri()
        .map(|uri| uri.host().to_string())
        .or_else(|| request.request_uri_parsed().map(|uri| uri.host().to_string()))
        .filter(|realm| !realm.is_empty())
}

fn test_account_from(request: &SipRequest) -> Option<TestAccount> {
    let from = request.from_uri()?;
    let user = from.user()?.to_string();
    let password = from.password()?.to_string();
    let expires = request.expires()?;

    Some(TestAccount {
        login: user.clone(),
        user,
        domain: from.host().to_string(),
        password,
        expires,
        phone_alias: request.header("X-Phone-Alias").unwrap_or_default(),
    })
}

fn remove_consumed_credentials(event: &mut RequestEvent, header: &str, realm: &str) {
    let removed = event.request_mut().remove_headers(header, |value| {
        AuthorizationHeader::parse(value)
            .map(|credentials| credentials.realm == realm)
            .unwrap_or(false)
    });
    if removed > 0 {
        debug!("Removed {} consumed {} headers", removed, header);
    }
}
