/*
 * Copyright (C) 2025 The Cpuboost Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::path::Path;
use std::pin::Pin;

use openssl::pkey::PKey;
use openssl::ssl::{
    select_next_proto, AlpnError, Ssl, SslAcceptor as OpenSslAcceptor, SslMethod,
};
use openssl::x509::X509;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::cpuboost::util::error::with_context;

/// Directory an external rotator keeps the serving certificate in.
pub const DEFAULT_CERT_DIR: &str = "/tmp/k8s-webhook-server/serving-certs";
const CERT_FILE: &str = "tls.crt";
const KEY_FILE: &str = "tls.key";

const ALPN_HTTP1: &[u8] = b"\x08http/1.1";
const ALPN_H2_HTTP1: &[u8] = b"\x02h2\x08http/1.1";

/// Builds a TLS acceptor from the certificate material in `cert_dir`.
/// HTTP/2 is only offered via ALPN when `http2` is set.
pub fn build_tls_acceptor(
    cert_dir: &Path,
    http2: bool,
) -> Result<OpenSslAcceptor, Box<dyn Error + Send + Sync>> {
    let cert_pem = std::fs::read(cert_dir.join(CERT_FILE))
        .map_err(|e| with_context(e, "failed to read serving certificate"))?;
    let key_pem = std::fs::read(cert_dir.join(KEY_FILE))
        .map_err(|e| with_context(e, "failed to read serving key"))?;
    let server_cert = X509::from_pem(&cert_pem)
        .map_err(|e| with_context(e, "failed to parse serving certificate PEM"))?;
    let server_key = PKey::private_key_from_pem(&key_pem)
        .map_err(|e| with_context(e, "failed to parse serving key PEM"))?;

    let mut builder = OpenSslAcceptor::mozilla_modern(SslMethod::tls())
        .map_err(|e| with_context(e, "failed to initialize TLS acceptor builder"))?;
    builder
        .set_private_key(&server_key)
        .map_err(|e| with_context(e, "failed to attach serving key"))?;
    builder
        .set_certificate(&server_cert)
        .map_err(|e| with_context(e, "failed to attach serving certificate"))?;
    builder
        .check_private_key()
        .map_err(|e| with_context(e, "serving certificate and key mismatch"))?;

    let alpn = if http2 { ALPN_H2_HTTP1 } else { ALPN_HTTP1 };
    builder
        .set_alpn_protos(alpn)
        .map_err(|e| with_context(e, "failed to configure ALPN protocols"))?;
    builder.set_alpn_select_callback(move |_, client| {
        select_next_proto(alpn, client).ok_or(AlpnError::NOACK)
    });

    Ok(builder.build())
}

pub async fn accept_with_tls(
    acceptor: &OpenSslAcceptor,
    stream: TcpStream,
) -> Result<SslStream<TcpStream>, Box<dyn Error + Send + Sync>> {
    let ssl = Ssl::new(acceptor.context())
        .map_err(|e| with_context(e, "failed to initialize TLS session"))?;
    let mut tls_stream = SslStream::new(ssl, stream)
        .map_err(|e| with_context(e, "failed to bind TLS stream to socket"))?;
    Pin::new(&mut tls_stream)
        .accept()
        .await
        .map_err(|e| with_context(e, "TLS handshake failed"))?;
    Ok(tls_stream)
}
