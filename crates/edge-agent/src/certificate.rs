//! Device client certificate

use edge_client::CertificateIssuer;
use edge_core::{AgentResult, Signer};
use tracing::{debug, info};

use crate::store::{StoreKind, TemplateStore};

/// Return the stored certificate, issuing and storing a new one when none
/// exists or `force` is set
pub async fn ensure_certificate(
    store: &TemplateStore,
    issuer: &CertificateIssuer,
    signer: &dyn Signer,
    csr_pem: &str,
    force: bool,
) -> AgentResult<String> {
    if !force {
        if let Some(pem) = store.read_text(StoreKind::Certificate)? {
            debug!("Using stored client certificate");
            return Ok(pem);
        }
    }

    let pem = issuer.issue(signer, csr_pem).await?;
    store.write_text(StoreKind::Certificate, &pem)?;
    info!(force, "Client certificate stored");
    Ok(pem)
}
