//! Certificate/key references
//!
//! Named records pointing at PEM files on disk, referenced by tcp-lb
//! listeners. Parsing and loading the material belongs to the TLS layer in
//! front of this core; here the paths are only checked to exist so a typo
//! fails the create instead of a later reload.

use crate::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug)]
pub struct CertKey {
    name: String,
    certs: Vec<PathBuf>,
    key: PathBuf,
}

impl CertKey {
    pub fn new(name: &str, certs: Vec<PathBuf>, key: PathBuf) -> Result<Self> {
        if certs.is_empty() {
            return Err(Error::invalid_argument("cert-key needs at least one cert"));
        }
        for cert in &certs {
            if !cert.exists() {
                return Err(Error::invalid_argument(format!(
                    "cert file {} does not exist",
                    cert.display()
                )));
            }
        }
        if !key.exists() {
            return Err(Error::invalid_argument(format!(
                "key file {} does not exist",
                key.display()
            )));
        }
        Ok(CertKey {
            name: name.to_string(),
            certs,
            key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn certs(&self) -> &[PathBuf] {
        &self.certs
    }

    pub fn key(&self) -> &PathBuf {
        &self.key
    }

    pub fn info(&self) -> CertKeyInfo {
        CertKeyInfo {
            name: self.name.clone(),
            certs: self
                .certs
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            key: self.key.display().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CertKeyInfo {
    pub name: String,
    pub certs: Vec<String>,
    pub key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("passage-certkey-test-{}", name));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "-----BEGIN TEST-----").unwrap();
        path
    }

    #[test]
    fn test_missing_files_rejected() {
        let err = CertKey::new(
            "ck0",
            vec![PathBuf::from("/nonexistent/cert.pem")],
            PathBuf::from("/nonexistent/key.pem"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_existing_files_accepted() {
        let cert = temp_file("cert.pem");
        let key = temp_file("key.pem");
        let ck = CertKey::new("ck0", vec![cert.clone()], key.clone()).unwrap();
        assert_eq!(ck.name(), "ck0");
        assert_eq!(ck.info().certs.len(), 1);
        let _ = std::fs::remove_file(cert);
        let _ = std::fs::remove_file(key);
    }

    #[test]
    fn test_empty_cert_list_rejected() {
        assert!(CertKey::new("ck0", Vec::new(), PathBuf::from("/tmp/x")).is_err());
    }
}
