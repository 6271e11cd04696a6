// Copyright 2020-2022 The NATS Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;

use tokio_rustls::rustls::{self, Certificate, OwnedTrustAnchor, RootCertStore};

use crate::options::ConnectOptions;

/// Builds a rustls client configuration from the connect options.
///
/// When a full configuration was supplied through
/// [`ConnectOptions::tls_client_config`] it is used verbatim. Otherwise the
/// webpki root set is loaded and any PEM files added with
/// [`ConnectOptions::add_root_certificates`] are appended.
pub(crate) fn config_tls(options: &ConnectOptions) -> io::Result<rustls::ClientConfig> {
    if let Some(config) = &options.tls_client_config {
        return Ok(config.clone());
    }

    let mut root_store = RootCertStore::empty();
    root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    for path in &options.certificates {
        for cert in load_certs(path)? {
            root_store.add(&cert).map_err(|err| {
                io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("failed to add root certificate: {}", err),
                )
            })?;
        }
    }

    Ok(rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

fn load_certs(path: &Path) -> io::Result<Vec<Certificate>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates found in {}", path.display()),
        ));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}
