//! TLS 配置
//!
//! 为 wss、gRPC 与 QUIC 构造 rustls 客户端/服务端配置。
//! 客户端默认使用 webpki 根证书，可追加自定义 CA、提供客户端证书，或在 `insecure` 时跳过校验。

use super::TransportError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// TLS 选项
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub enable: bool,
    /// SNI，同时用于校验服务端证书
    pub hostname: String,
    /// 自定义 CA（客户端用于校验服务端，服务端用于校验客户端）
    pub ca_path: String,
    pub cert_path: String,
    pub key_path: String,
    /// 跳过服务端证书校验
    pub insecure: bool,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn open(path: &str) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("open {}: {}", path, e)))
}

/// 读取 PEM 证书链
pub fn load_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?).collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no certificate found in {}", path),
        ));
    }
    Ok(certs)
}

/// 读取 PEM 私钥（PKCS#1 / PKCS#8 / SEC1）
pub fn load_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("no private key found in {}", path))
    })
}

fn load_roots(path: &str) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(format!("bad ca {}: {}", path, e)))?;
    }
    Ok(roots)
}

/// 构造客户端配置
pub fn client_config(opts: &TlsOptions, alpn: &[&[u8]]) -> Result<ClientConfig, TransportError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if !opts.ca_path.is_empty() {
        roots.roots.extend(load_roots(&opts.ca_path)?.roots);
    }

    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots);
    let mut config = if !opts.cert_path.is_empty() && !opts.key_path.is_empty() {
        builder
            .with_client_auth_cert(load_certs(&opts.cert_path)?, load_key(&opts.key_path)?)
            .map_err(|e| TransportError::Tls(e.to_string()))?
    } else {
        builder.with_no_client_auth()
    };
    if opts.insecure {
        config.dangerous().set_certificate_verifier(Arc::new(NoVerify));
    }
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// 构造服务端配置，配置了 CA 时要求客户端证书
pub fn server_config(opts: &TlsOptions, alpn: &[&[u8]]) -> Result<ServerConfig, TransportError> {
    if opts.cert_path.is_empty() || opts.key_path.is_empty() {
        return Err(TransportError::InvalidOption(
            "tls server requires cert_path and key_path".to_string(),
        ));
    }
    let certs = load_certs(&opts.cert_path)?;
    let key = load_key(&opts.key_path)?;

    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let builder = if opts.ca_path.is_empty() {
        builder.with_no_client_auth()
    } else {
        let verifier = WebPkiClientVerifier::builder_with_provider(
            Arc::new(load_roots(&opts.ca_path)?),
            provider(),
        )
        .build()
        .map_err(|e| TransportError::Tls(e.to_string()))?;
        builder.with_client_cert_verifier(verifier)
    };
    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// 握手使用的服务器名：优先 `hostname`，否则取拨号地址中的主机部分
pub fn server_name(opts: &TlsOptions, addr: &str) -> Result<ServerName<'static>, TransportError> {
    let host = if !opts.hostname.is_empty() {
        opts.hostname.clone()
    } else {
        host_of(addr).to_string()
    };
    ServerName::try_from(host.clone())
        .map_err(|_| TransportError::InvalidOption(format!("invalid tls server name {}", host)))
}

/// 取 `host:port` 中的主机部分，兼容 `[v6]:port`
pub fn host_of(addr: &str) -> &str {
    let host = match addr.rfind(':') {
        Some(i) if !addr[..i].is_empty() => &addr[..i],
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

pub fn connector(opts: &TlsOptions, alpn: &[&[u8]]) -> Result<TlsConnector, TransportError> {
    Ok(TlsConnector::from(Arc::new(client_config(opts, alpn)?)))
}

pub fn acceptor(opts: &TlsOptions, alpn: &[&[u8]]) -> Result<TlsAcceptor, TransportError> {
    Ok(TlsAcceptor::from(Arc::new(server_config(opts, alpn)?)))
}

/// 不校验服务端证书
#[derive(Debug)]
pub struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
