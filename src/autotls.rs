//! Wires the ACME protocol core to a `rustls` certificate resolver: single-flight
//! provisioning on first handshake, a daily renewal check with "check now" semantics on
//! load, and OCSP stapling. The single-flight guard is grounded in the reference
//! `pingclair` `auto_https.rs`'s `processing: Arc<RwLock<HashSet<String>>>` pattern,
//! adapted to "busy fails the handshake" since `ResolvesServerCert::resolve` is
//! synchronous and cannot await an in-flight order. Shutdown follows the teacher's
//! `daemon.rs` `watch::channel(false)` broadcast.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::acme::signed_request::AcmeTransport;
use crate::acme::{Account, ChallengeStore, order};
use crate::certificate::Certificate;
use crate::config::Settings;
use crate::error::{AutoTlsError, AutoTlsResult};
use crate::identity::Identity;
use crate::ocsp::OcspResolver;

struct Shared {
    settings: Settings,
    domains: HashSet<String>,
    transport: AcmeTransport,
    account: Account,
    account_identity: Identity,
    certificate_identity: Identity,
    challenges: ChallengeStore,
    cached: RwLock<Option<Arc<Certificate>>>,
    provisioning: AtomicBool,
}

impl Shared {
    /// Returns the cached `CertifiedKey` iff a certificate is cached AND still
    /// unexpired. An expired cached certificate is evicted rather than served, so the
    /// invariant "now < notAfter at the moment a TLS context is returned" always holds
    /// (SPEC_FULL.md §8); eviction makes the next handshake attempt provisioning afresh.
    fn cached_key(&self) -> Option<Arc<CertifiedKey>> {
        let now = OffsetDateTime::now_utc();
        {
            let guard = self.cached.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            match guard.as_ref() {
                Some(cert) if cert.metadata().not_after > now => return Some(cert.certified_key()),
                None => return None,
                Some(_) => {}
            }
        }

        warn!("cached certificate has expired, evicting");
        *self.cached.write().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        None
    }

    fn needs_renewal(&self, renew_before: Duration) -> bool {
        self.cached
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .is_none_or(|cert| cert.metadata().needs_renewal(OffsetDateTime::now_utc(), renew_before))
    }

    async fn provision(self: Arc<Self>) {
        let backoffs = self.settings.retry.backoff_secs.clone();
        let mut attempt = 0usize;

        loop {
            match order::issue(
                &self.transport,
                &self.account,
                &self.account_identity,
                &self.certificate_identity,
                &self.settings.domains,
                &self.challenges,
            )
            .await
            {
                Ok(pem_chain) => {
                    self.install(pem_chain).await;
                    break;
                }
                Err(err) => {
                    let still_valid = self
                        .cached
                        .read()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .as_ref()
                        .is_some_and(|cert| cert.metadata().not_after > OffsetDateTime::now_utc());

                    if attempt >= backoffs.len() {
                        if still_valid {
                            error!(%err, "certificate renewal failed, serving stale certificate until it expires");
                        } else {
                            let renewal_err = AutoTlsError::RenewalFailed(err.to_string());
                            error!(error = %renewal_err, "certificate provisioning exhausted all retries past expiry");
                            *self.cached.write().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
                        }
                        break;
                    }

                    let delay = backoffs[attempt];
                    warn!(%err, attempt, delay_secs = delay, "certificate provisioning failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }

        self.provisioning.store(false, Ordering::SeqCst);
    }

    async fn install(&self, pem_chain: String) {
        match Certificate::from_pem_chain(pem_chain, &self.certificate_identity) {
            Ok(cert) => {
                if let Err(err) = cert.persist(&self.settings.certificate_path()).await {
                    error!(%err, "failed to persist issued certificate");
                }
                info!(serial = cert.serial(), "certificate provisioned");
                *self.cached.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::new(cert));
            }
            Err(err) => error!(%err, "failed to parse issued certificate chain"),
        }
    }

    fn try_begin_provisioning(self: &Arc<Self>) -> bool {
        self.provisioning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// `rustls::server::ResolvesServerCert` hook dispatching by SNI (spec.md §4.10).
struct CertResolver(Arc<Shared>);

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = client_hello.server_name() else {
            warn!("client hello carried no SNI name");
            return None;
        };

        if !self.0.domains.contains(name) {
            warn!(name, "SNIIgnoreUnsupportedDomainError: not served by this instance");
            return None;
        }

        if let Some(key) = self.0.cached_key() {
            return Some(key);
        }

        if self.0.try_begin_provisioning() {
            info!(name, "no cached certificate, starting provisioning");
            tokio::spawn(Arc::clone(&self.0).provision());
        } else {
            info!(name, "certificate provisioning already in flight, dropping handshake");
        }
        None
    }
}

/// Opportunistic ACME HTTP-01 TLS provisioning for a single domain set.
pub struct AutoTls {
    shared: Arc<Shared>,
    server_config: Arc<ServerConfig>,
    ocsp: Arc<OcspResolver>,
    shutdown_tx: watch::Sender<bool>,
    renewal_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AutoTls {
    /// Discovers the ACME directory, loads or registers the account, loads any
    /// previously issued certificate, and starts the renewal-check loop. The only
    /// public constructor.
    ///
    /// # Errors
    /// Returns an error if directory discovery, account registration, or loading an
    /// existing certificate fails.
    pub async fn bootstrap(settings: Settings) -> AutoTlsResult<Arc<Self>> {
        let transport = AcmeTransport::discover(settings.server.directory_url(), &settings.acme).await?;
        let account_identity = Identity::load_or_generate(&settings.account_identity_path()).await?;
        let account = Account::load_or_register(
            &settings.account_record_path(),
            &transport,
            &account_identity,
            settings.email.as_deref(),
        )
        .await?;
        let certificate_identity = Identity::load_or_generate(&settings.certificate_identity_path()).await?;
        let existing = Certificate::load(&settings.certificate_path(), &certificate_identity).await?;
        let domains: HashSet<String> = settings.domains.iter().cloned().collect();
        let challenges = crate::acme::challenge_responder::new_store();

        let shared = Arc::new(Shared {
            settings,
            domains,
            transport,
            account,
            account_identity,
            certificate_identity,
            challenges,
            cached: RwLock::new(existing.map(Arc::new)),
            provisioning: AtomicBool::new(false),
        });

        let ocsp = OcspResolver::wrap(Arc::new(CertResolver(Arc::clone(&shared))));
        let resolver: Arc<dyn ResolvesServerCert> = Arc::clone(&ocsp) as Arc<dyn ResolvesServerCert>;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| AutoTlsError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(resolver);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let renewal_task = spawn_renewal_task(Arc::clone(&shared), shutdown_rx);

        Ok(Arc::new(Self {
            shared,
            server_config: Arc::new(server_config),
            ocsp,
            shutdown_tx,
            renewal_task: tokio::sync::Mutex::new(Some(renewal_task)),
        }))
    }

    /// The `rustls::ServerConfig` to hand to a `tokio_rustls::TlsAcceptor`.
    #[must_use]
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// The challenge-token map HTTP-01 validation writes and the HTTP front door reads.
    #[must_use]
    pub fn challenges(&self) -> ChallengeStore {
        Arc::clone(&self.shared.challenges)
    }

    /// True while a certificate for the configured domain set is cached and servable.
    #[must_use]
    pub fn has_certificate(&self) -> bool {
        self.shared.cached_key().is_some()
    }

    /// Cancels the renewal timer, clears the OCSP stapling layer's cached responses
    /// and refresh state, and waits for any in-flight renewal check to observe the
    /// shutdown signal. Mandatory before process exit (spec.md §4.9, §4.12).
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.ocsp.clear();
        if let Some(handle) = self.renewal_task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

fn spawn_renewal_task(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let check_interval = shared
            .settings
            .check_interval()
            .unwrap_or(Duration::from_secs(24 * 60 * 60));
        let renew_before = shared
            .settings
            .renew_before()
            .unwrap_or(Duration::from_secs(30 * 24 * 60 * 60));

        maybe_renew(&shared, renew_before).await;

        loop {
            if *shutdown_rx.borrow() {
                info!("renewal task shutting down");
                return;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("renewal task shutting down");
                    return;
                }
                () = tokio::time::sleep(check_interval) => {
                    maybe_renew(&shared, renew_before).await;
                }
            }
        }
    })
}

async fn maybe_renew(shared: &Arc<Shared>, renew_before: Duration) {
    if !shared.needs_renewal(renew_before) {
        return;
    }
    if shared.try_begin_provisioning() {
        info!("certificate due for renewal, provisioning");
        Arc::clone(shared).provision().await;
    }
}
