//! OCSP stapling: wraps a `rustls` certificate resolver with `ocsp-stapler`'s
//! AIA-driven fetch/cache/refresh cycle rather than re-deriving OCSP request/response
//! ASN.1 encoding by hand (spec.md §4.12, §9). `OcspResolver` adds a thin, swappable
//! layer on top of the `Stapler` itself so AutoTLS's shutdown path has something to
//! clear — `ocsp-stapler` has no shutdown hook of its own, since it expects to live for
//! the process lifetime.

use std::sync::{Arc, RwLock};

use ocsp_stapler::Stapler;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::ParsedExtension;
use x509_parser::oid_registry::OID_PKIX_ACCESS_DESCR_OCSP;
use x509_parser::traits::FromDer;

/// Wraps a certificate resolver with OCSP stapling, and exposes `clear`/`refresh_now`
/// so AutoTLS can tear down (or force-refresh) the stapling layer's cached responses on
/// shutdown (SPEC_FULL.md §4.12: "All timers are clearable by AutoTLS on shutdown").
pub struct OcspResolver {
    inner: Arc<dyn ResolvesServerCert>,
    stapler: RwLock<Option<Arc<Stapler>>>,
}

impl OcspResolver {
    /// Wraps `inner` so every handshake that negotiates the `status_request` extension
    /// gets a fresh-enough stapled OCSP response, refreshed in the background as
    /// entries near their `nextUpdate`.
    #[must_use]
    pub fn wrap(inner: Arc<dyn ResolvesServerCert>) -> Arc<Self> {
        let stapler = Stapler::new(Arc::clone(&inner));
        Arc::new(Self {
            inner,
            stapler: RwLock::new(Some(stapler)),
        })
    }

    /// Drops the stapling layer's cached OCSP responses and whatever background
    /// refresh state `ocsp-stapler` holds for them. Handshakes after this point fall
    /// back to the unstapled inner resolver until [`Self::refresh_now`] is called.
    /// Called from `AutoTls::shutdown()`.
    pub fn clear(&self) {
        *self.stapler.write().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    /// Rebuilds the stapling layer from scratch around the same inner resolver,
    /// discarding any previously cached stapled response so the next handshake fetches
    /// a fresh one rather than serving something stale.
    pub fn refresh_now(&self) {
        let fresh = Stapler::new(Arc::clone(&self.inner));
        *self.stapler.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(fresh);
    }
}

impl ResolvesServerCert for OcspResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let guard = self.stapler.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        match guard.as_ref() {
            Some(stapler) => stapler.resolve(client_hello),
            None => self.inner.resolve(client_hello),
        }
    }
}

/// Extracts the OCSP responder URL from the leaf certificate's Authority Information
/// Access extension, for diagnostics only — `ocsp-stapler` does its own AIA parsing to
/// actually drive the request.
#[must_use]
pub fn aia_responder_url(leaf_der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(leaf_der).ok()?;
    cert.tbs_certificate.extensions().iter().find_map(|ext| {
        let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() else {
            return None;
        };
        aia.accessdescs.iter().find_map(|descr| {
            if descr.access_method != OID_PKIX_ACCESS_DESCR_OCSP {
                return None;
            }
            match &descr.access_location {
                x509_parser::extensions::GeneralName::URI(uri) => Some((*uri).to_string()),
                _ => None,
            }
        })
    })
}
