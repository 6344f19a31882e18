use rustls::{
    ClientConfig,
    RootCertStore,
};
use tokio_postgres_rustls::MakeRustlsConnect;

/// Builds the TLS connector used for `ssl = true` connections: native roots,
/// no client auth.
pub(crate) fn connector() -> anyhow::Result<MakeRustlsConnect> {
    let mut roots = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    anyhow::ensure!(
        native_certs.errors.is_empty(),
        "failed to load native certs: {:?}",
        native_certs.errors
    );
    for cert in native_certs.certs {
        roots.add(cert)?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(config))
}
