use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// PEM certificate chain and private key served to renters' and owners' clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsFiles {
    /// Pair up the two settings. Half a configuration is an error, not plaintext.
    pub fn pair(cert: Option<String>, key: Option<String>) -> io::Result<Option<Self>> {
        match (cert, key) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => Ok(Some(Self {
                cert: cert.into(),
                key: key.into(),
            })),
            (Some(_), None) => Err(half_configured("KEYTURN_TLS_KEY")),
            (None, Some(_)) => Err(half_configured("KEYTURN_TLS_CERT")),
        }
    }

    pub fn acceptor(&self) -> io::Result<TlsAcceptor> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.read_chain()?, self.read_key()?)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    fn read_chain(&self) -> io::Result<Vec<CertificateDer<'static>>> {
        let chain = rustls_pemfile::certs(&mut BufReader::new(File::open(&self.cert)?))
            .collect::<Result<Vec<_>, _>>()?;
        if chain.is_empty() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("no certificates in {}", self.cert.display()),
            ));
        }
        Ok(chain)
    }

    fn read_key(&self) -> io::Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut BufReader::new(File::open(&self.key)?))?.ok_or_else(|| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("no private key in {}", self.key.display()),
            )
        })
    }
}

fn half_configured(missing: &str) -> io::Error {
    io::Error::new(
        ErrorKind::InvalidInput,
        format!("TLS is half configured: {missing} is not set"),
    )
}
