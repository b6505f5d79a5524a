//! Directory-backed [`ContextResolver`] with polling hot-reload.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use crate::error::GateError;
use crate::resolver::ContextResolver;
use crate::security_context::SecurityContext;

/// Loads `<directory>/<hostname>/{fullchain.pem,privkey.pem}` pairs and
/// republishes the whole map atomically on a polling interval.
///
/// Each reload builds an entirely new map and swaps it in with one
/// `ArcSwap::store`, so a lookup never observes a partially-updated set of
/// hostnames.
pub struct FileResolver {
    map: Arc<ArcSwap<HashMap<String, Arc<SecurityContext>>>>,
}

impl FileResolver {
    /// Perform an initial synchronous load, then spawn a background task
    /// that reloads every `poll_interval`.
    pub async fn watch(directory: PathBuf, poll_interval: Duration) -> Result<Self, GateError> {
        let initial = load_directory(&directory)?;
        let map = Arc::new(ArcSwap::from_pointee(initial));

        let map_for_task = Arc::clone(&map);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                match load_directory(&directory) {
                    Ok(fresh) => {
                        debug!(
                            hostnames = fresh.len(),
                            "reloaded file-backed security contexts"
                        );
                        map_for_task.store(Arc::new(fresh));
                    }
                    Err(e) => warn!(error = %e, "failed to reload security context directory"),
                }
            }
        });

        Ok(Self { map })
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.map.load().keys().cloned().collect()
    }
}

impl ContextResolver for FileResolver {
    fn resolve(&self, hostname: Option<&str>) -> Option<Arc<SecurityContext>> {
        let hostname = hostname?;
        self.map.load().get(hostname).cloned()
    }
}

fn load_directory(directory: &PathBuf) -> Result<HashMap<String, Arc<SecurityContext>>, GateError> {
    let mut map = HashMap::new();
    let entries = fs::read_dir(directory).map_err(|e| {
        GateError::InvalidSecurityContext(format!(
            "failed to read security context directory {}: {e}",
            directory.display()
        ))
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| {
            GateError::InvalidSecurityContext(format!("failed to read directory entry: {e}"))
        })?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let hostname = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        let cert_path = entry.path().join("fullchain.pem");
        let key_path = entry.path().join("privkey.pem");
        if !cert_path.is_file() || !key_path.is_file() {
            continue;
        }
        let cert_pem = fs::read(&cert_path).map_err(|e| {
            GateError::InvalidSecurityContext(format!("reading {}: {e}", cert_path.display()))
        })?;
        let key_pem = fs::read(&key_path).map_err(|e| {
            GateError::InvalidSecurityContext(format!("reading {}: {e}", key_path.display()))
        })?;
        let ctx = SecurityContext::from_pem(&cert_pem, &key_pem)?;
        map.insert(hostname, Arc::new(ctx));
    }

    info!(hostnames = map.len(), directory = %directory.display(), "loaded security context directory");
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pair(dir: &std::path::Path, hostname: &str) {
        let cert = rcgen::generate_simple_self_signed([hostname.to_string()]).unwrap();
        let host_dir = dir.join(hostname);
        fs::create_dir_all(&host_dir).unwrap();
        fs::write(host_dir.join("fullchain.pem"), cert.cert.pem()).unwrap();
        fs::write(host_dir.join("privkey.pem"), cert.key_pair.serialize_pem()).unwrap();
    }

    #[tokio::test]
    async fn loads_hostname_directories() {
        let tmp = tempdir();
        write_pair(&tmp, "a.example.com");
        write_pair(&tmp, "b.example.com");

        let resolver = FileResolver::watch(tmp.clone(), Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(resolver.resolve(Some("a.example.com")).is_some());
        assert!(resolver.resolve(Some("b.example.com")).is_some());
        assert!(resolver.resolve(Some("missing.example.com")).is_none());
        assert!(resolver.resolve(None).is_none());

        let _ = fs::remove_dir_all(tmp);
    }

    #[tokio::test]
    async fn ignores_incomplete_directories() {
        let tmp = tempdir();
        fs::create_dir_all(tmp.join("incomplete")).unwrap();
        fs::write(tmp.join("incomplete").join("fullchain.pem"), b"not a cert").unwrap();

        let resolver = FileResolver::watch(tmp.clone(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(resolver.resolve(Some("incomplete")).is_none());

        let _ = fs::remove_dir_all(tmp);
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sni-gate-file-resolver-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }
}
