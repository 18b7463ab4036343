//! Template resolver
//!
//! Keeps the PID template, device settings and optional signal database in
//! sync with the configuration service. The URLs record is fetched first;
//! when its `{version, pidUrl}` matches the cache nothing else is
//! downloaded. Any failure falls back to the cached bundle when there is one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edge_client::{ClientError, ConfigApiClient};
use edge_core::{DeviceSettings, TemplatePids, TemplateUrls};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ResolveError;
use crate::store::{StoreKind, TemplateStore};

/// Where template pieces come from
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn fetch_urls(&self, key: &str) -> Result<TemplateUrls, ClientError>;
    async fn fetch_pids(&self, url: &str) -> Result<TemplatePids, ClientError>;
    async fn fetch_settings(&self, url: &str) -> Result<DeviceSettings, ClientError>;
    async fn fetch_dbc(&self, url: &str) -> Result<String, ClientError>;
}

#[async_trait]
impl TemplateSource for ConfigApiClient {
    async fn fetch_urls(&self, key: &str) -> Result<TemplateUrls, ClientError> {
        ConfigApiClient::fetch_urls(self, key).await
    }

    async fn fetch_pids(&self, url: &str) -> Result<TemplatePids, ClientError> {
        ConfigApiClient::fetch_pids(self, url).await
    }

    async fn fetch_settings(&self, url: &str) -> Result<DeviceSettings, ClientError> {
        ConfigApiClient::fetch_settings(self, url).await
    }

    async fn fetch_dbc(&self, url: &str) -> Result<String, ClientError> {
        ConfigApiClient::fetch_dbc(self, url).await
    }
}

/// Everything the scheduler and listener need for one vehicle
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateBundle {
    pub urls: TemplateUrls,
    pub pids: TemplatePids,
    pub settings: DeviceSettings,
    /// Signal database text, when the template has one
    pub dbc: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleOrigin {
    /// Downloaded and persisted during this call
    Fetched,
    /// Served from the template store
    Cached,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub bundle: TemplateBundle,
    pub origin: BundleOrigin,
}

pub struct TemplateResolver {
    source: Arc<dyn TemplateSource>,
    store: Arc<TemplateStore>,
}

impl TemplateResolver {
    pub fn new(source: Arc<dyn TemplateSource>, store: Arc<TemplateStore>) -> Self {
        Self { source, store }
    }

    /// Resolve the template for `key` (a VIN, or the device address)
    pub async fn resolve(&self, key: &str) -> Result<Resolution, ResolveError> {
        let cached = self.cached_bundle();

        let urls = match self.source.fetch_urls(key).await {
            Ok(urls) => urls,
            Err(e) => return self.fallback(cached, e, key),
        };

        if let Some(cached) = cached.as_ref() {
            if cached.urls.same_template(&urls) {
                debug!(version = %urls.version, "Template unchanged");
                return Ok(Resolution {
                    bundle: cached.clone(),
                    origin: BundleOrigin::Cached,
                });
            }
        }

        let bundle = match self.fetch_bundle(urls, cached.as_ref()).await {
            Ok(bundle) => bundle,
            Err(e) => return self.fallback(cached, e, key),
        };
        self.persist(&bundle)?;

        info!(
            version = %bundle.urls.version,
            template = %bundle.pids.template_name,
            requests = bundle.pids.requests.len(),
            dbc = bundle.dbc.is_some(),
            "Template updated"
        );
        Ok(Resolution {
            bundle,
            origin: BundleOrigin::Fetched,
        })
    }

    /// The cached bundle, if a complete one is stored
    pub fn cached_bundle(&self) -> Option<TemplateBundle> {
        let urls = self.store.read_urls()?;
        let pids = self.store.read_pids()?;
        Some(TemplateBundle {
            urls,
            pids,
            settings: self.store.read_device_settings().unwrap_or_default(),
            dbc: self.store.read_text(StoreKind::SignalDatabase).ok().flatten(),
        })
    }

    async fn fetch_bundle(
        &self,
        urls: TemplateUrls,
        cached: Option<&TemplateBundle>,
    ) -> Result<TemplateBundle, ClientError> {
        let pids = self.source.fetch_pids(&urls.pid_url).await?;

        let settings = match urls.device_settings_url.as_deref() {
            Some(url) => self.source.fetch_settings(url).await?,
            None => cached.map(|c| c.settings.clone()).unwrap_or_default(),
        };

        let dbc = match urls.dbc_url.as_deref() {
            Some(url) => Some(self.source.fetch_dbc(url).await?),
            None => None,
        };

        Ok(TemplateBundle {
            urls,
            pids,
            settings,
            dbc,
        })
    }

    /// Persist each piece; the URLs record goes last so an interrupted
    /// write is retried on the next resolve
    fn persist(&self, bundle: &TemplateBundle) -> Result<(), ResolveError> {
        self.store.write(StoreKind::PidSettings, &bundle.pids)?;
        self.store.write(StoreKind::DeviceSettings, &bundle.settings)?;
        match bundle.dbc.as_deref() {
            Some(text) => self.store.write_text(StoreKind::SignalDatabase, text)?,
            None => self.store.remove(StoreKind::SignalDatabase)?,
        }
        self.store.write(StoreKind::TemplateUrls, &bundle.urls)?;
        Ok(())
    }

    fn fallback(
        &self,
        cached: Option<TemplateBundle>,
        error: ClientError,
        key: &str,
    ) -> Result<Resolution, ResolveError> {
        match cached {
            Some(bundle) => {
                warn!(key, error = %error, "Using cached template");
                Ok(Resolution {
                    bundle,
                    origin: BundleOrigin::Cached,
                })
            }
            None => Err(ResolveError::Api(error)),
        }
    }

    /// Re-resolve every `interval` and push changed templates to the scheduler
    pub async fn run_refresh_loop(
        self: Arc<Self>,
        key: String,
        interval: Duration,
        templates: watch::Sender<TemplatePids>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            match self.resolve(&key).await {
                Ok(resolution) if resolution.origin == BundleOrigin::Fetched => {
                    let pids = resolution.bundle.pids;
                    templates.send_if_modified(|current| {
                        if current.version == pids.version {
                            false
                        } else {
                            *current = pids;
                            true
                        }
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Template refresh failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use edge_core::PidRequest;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct FakeService {
        urls: Mutex<Option<TemplateUrls>>,
        pids_version: Mutex<String>,
        fail_pids: Mutex<bool>,
        calls: AtomicUsize,
    }

    impl FakeService {
        fn serve(&self, version: &str, dbc: bool) {
            *self.urls.lock() = Some(TemplateUrls {
                version: version.to_string(),
                pid_url: format!("/pids/{}", version),
                device_settings_url: Some("/settings".to_string()),
                dbc_url: dbc.then(|| "/dbc".to_string()),
            });
            *self.pids_version.lock() = version.to_string();
        }
    }

    #[async_trait]
    impl TemplateSource for FakeService {
        async fn fetch_urls(&self, key: &str) -> Result<TemplateUrls, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls
                .lock()
                .clone()
                .ok_or_else(|| ClientError::NotFound(key.to_string()))
        }

        async fn fetch_pids(&self, _url: &str) -> Result<TemplatePids, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail_pids.lock() {
                return Err(ClientError::server_error(503, "busy"));
            }
            Ok(TemplatePids {
                version: self.pids_version.lock().clone(),
                template_name: "default-ice".to_string(),
                requests: vec![PidRequest {
                    name: "speed".to_string(),
                    header: 0x7DF,
                    mode: 1,
                    pid: 0x0D,
                    interval_seconds: 10,
                    formula: "dbc: 31|8@0+ (1,0) [0|255] \"km/h\"".to_string(),
                    protocol: None,
                    can_flow_control_id_pair: None,
                    can_flow_control_clear: false,
                }],
            })
        }

        async fn fetch_settings(&self, _url: &str) -> Result<DeviceSettings, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DeviceSettings {
                min_voltage_obd_loggers: 12.6,
                ..DeviceSettings::default()
            })
        }

        async fn fetch_dbc(&self, _url: &str) -> Result<String, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("BO_ 1201 WheelSpeeds: 8 ECU\n".to_string())
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<FakeService>, Arc<TemplateStore>, TemplateResolver) {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeService::default());
        let store = Arc::new(TemplateStore::open(dir.path()).unwrap());
        let resolver = TemplateResolver::new(service.clone(), store.clone());
        (dir, service, store, resolver)
    }

    #[tokio::test]
    async fn test_fetch_then_cache_hit() {
        let (_dir, service, store, resolver) = setup();
        service.serve("v1", true);

        let first = resolver.resolve("1FTEW1CP3NKE68593").await.unwrap();
        assert_eq!(first.origin, BundleOrigin::Fetched);
        assert_eq!(first.bundle.settings.min_voltage_obd_loggers, 12.6);
        assert!(first.bundle.dbc.is_some());
        assert_eq!(service.calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.read_pids().unwrap().version, "v1");

        let second = resolver.resolve("1FTEW1CP3NKE68593").await.unwrap();
        assert_eq!(second.origin, BundleOrigin::Cached);
        assert_eq!(second.bundle, first.bundle);
        // Only the URLs record was fetched
        assert_eq!(service.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_version_change_refetches() {
        let (_dir, service, store, resolver) = setup();
        service.serve("v1", true);
        resolver.resolve("vin").await.unwrap();

        service.serve("v2", false);
        let resolution = resolver.resolve("vin").await.unwrap();
        assert_eq!(resolution.origin, BundleOrigin::Fetched);
        assert_eq!(resolution.bundle.pids.version, "v2");
        assert_eq!(resolution.bundle.dbc, None);
        assert_eq!(store.read_text(StoreKind::SignalDatabase).unwrap(), None);
    }

    #[tokio::test]
    async fn test_failures_fall_back_to_cache() {
        let (_dir, service, _store, resolver) = setup();
        service.serve("v1", false);
        resolver.resolve("vin").await.unwrap();

        service.serve("v2", false);
        *service.fail_pids.lock() = true;
        let resolution = resolver.resolve("vin").await.unwrap();
        assert_eq!(resolution.origin, BundleOrigin::Cached);
        assert_eq!(resolution.bundle.pids.version, "v1");

        *service.urls.lock() = None;
        let resolution = resolver.resolve("vin").await.unwrap();
        assert_eq!(resolution.bundle.pids.version, "v1");
    }

    #[tokio::test]
    async fn test_no_cache_propagates() {
        let (_dir, _service, _store, resolver) = setup();
        let err = resolver.resolve("vin").await.unwrap_err();
        assert!(matches!(err, ResolveError::Api(ClientError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_pushes_new_versions() {
        let (_dir, service, _store, resolver) = setup();
        service.serve("v1", false);
        let initial = resolver.resolve("vin").await.unwrap().bundle.pids;

        let (tx, mut rx) = watch::channel(initial);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let resolver = Arc::new(resolver);
        let task = tokio::spawn(resolver.run_refresh_loop(
            "vin".to_string(),
            Duration::from_secs(3600),
            tx,
            shutdown_rx,
        ));

        service.serve("v2", false);
        tokio::time::sleep(Duration::from_secs(3601)).await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().version, "v2");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
