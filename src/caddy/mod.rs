use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::CaddyConfig;
use crate::engine::{ContainerEngine, Mount, RunSpec};
use crate::error::{Error, Result};
use crate::resource::LABEL_SYSTEM;

mod caddyfile;
pub use caddyfile::Route;
pub(crate) use caddyfile::{render, routes, RenderOptions};

/// Fixed name of the reverse-proxy container.
pub const CONTAINER_NAME: &str = "simplify-caddy";

const CADDYFILE: &str = "Caddyfile";
const STOP_TIMEOUT_SECS: i64 = 10;

/// Owns the reverse-proxy container and its configuration file. Never
/// lists or diffs engine state itself: the reconciler supplies the route
/// set and decides when a reload is due.
pub struct CaddyManager {
    engine: Arc<dyn ContainerEngine>,
    config: CaddyConfig,
    api_port: u16,
    client: hyper::Client<hyper::client::HttpConnector>,
}

impl CaddyManager {
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>, config: CaddyConfig, api_port: u16) -> Self {
        Self {
            engine,
            config,
            api_port,
            client: hyper::Client::new(),
        }
    }

    fn data_dir(&self) -> &Path {
        Path::new(&self.config.data_dir)
    }

    fn caddyfile_path(&self) -> PathBuf {
        self.data_dir().join(CADDYFILE)
    }

    fn render_options(&self) -> RenderOptions {
        RenderOptions {
            admin_port: self.config.admin_port,
            api_upstream: Some(format!("127.0.0.1:{}", self.api_port)),
            site_root: "/srv/www".to_owned(),
        }
    }

    /// Bring the proxy container up from scratch: prepare the data
    /// directories, write an empty-route configuration, replace any prior
    /// container of the same name, and attach the dedicated proxy network
    /// after start so the container keeps bridge egress while reaching
    /// application containers by name.
    pub async fn ensure_running(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let data_dir = self.data_dir();
        for dir in [
            data_dir.to_path_buf(),
            data_dir.join("caddy_data"),
            data_dir.join("caddy_config"),
            data_dir.join("www"),
        ] {
            tokio::fs::create_dir_all(&dir).await.map_err(|err| {
                Error::internal(format!("failed to create {}", dir.display())).with_source(err)
            })?;
        }

        let initial = render(&[], &self.render_options());
        self.write_caddyfile(&initial).await?;

        let networks = self.engine.list_networks().await?;
        if !networks.iter().any(|n| n.name == self.config.proxy_network) {
            info!(network = %self.config.proxy_network, "creating proxy network");
            self.engine.create_network(&self.config.proxy_network).await?;
        }

        if let Err(error) = self.engine.remove(CONTAINER_NAME, true).await {
            debug!(%error, "no prior proxy container to replace");
        }

        let frontend = if self.config.frontend_path.is_empty() {
            Mount {
                source: data_dir.join("www").display().to_string(),
                target: "/srv/www".to_owned(),
                read_only: false,
            }
        } else {
            Mount {
                source: self.config.frontend_path.clone(),
                target: "/srv/www".to_owned(),
                read_only: true,
            }
        };

        self.engine
            .run(RunSpec {
                name: CONTAINER_NAME.to_owned(),
                image: self.config.image.clone(),
                ports: BTreeMap::from([
                    (self.config.http_port.to_string(), "80".to_owned()),
                    (self.config.https_port.to_string(), "443".to_owned()),
                    (
                        self.config.admin_port.to_string(),
                        self.config.admin_port.to_string(),
                    ),
                ]),
                labels: BTreeMap::from([(LABEL_SYSTEM.to_owned(), "caddy".to_owned())]),
                mounts: vec![
                    Mount {
                        source: self.caddyfile_path().display().to_string(),
                        target: "/etc/caddy/Caddyfile".to_owned(),
                        read_only: true,
                    },
                    Mount {
                        source: data_dir.join("caddy_data").display().to_string(),
                        target: "/data".to_owned(),
                        read_only: false,
                    },
                    Mount {
                        source: data_dir.join("caddy_config").display().to_string(),
                        target: "/config".to_owned(),
                        read_only: false,
                    },
                    frontend,
                ],
                expose_external: true,
                ..RunSpec::default()
            })
            .await?;

        self.engine
            .connect_network(&self.config.proxy_network, CONTAINER_NAME)
            .await?;
        info!(container = CONTAINER_NAME, "proxy container running");
        Ok(())
    }

    /// Re-render the configuration for the given routes, persist it, and
    /// hot-reload the proxy through its admin endpoint.
    pub async fn reload(&self, routes: &[Route]) -> Result<()> {
        let rendered = render(routes, &self.render_options());
        self.write_caddyfile(&rendered).await?;

        let uri = format!("http://127.0.0.1:{}/load", self.config.admin_port);
        let request = hyper::Request::post(uri.as_str())
            .header(hyper::header::CONTENT_TYPE, "text/caddyfile")
            .body(hyper::Body::from(rendered))
            .map_err(|err| Error::internal("failed to build proxy reload request").with_source(err))?;
        let response = self.client.request(request).await.map_err(|err| {
            Error::internal("proxy admin endpoint unreachable").with_source(err)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .unwrap_or_default();
            return Err(Error::internal(format!(
                "proxy reload failed ({status}): {}",
                String::from_utf8_lossy(&body)
            )));
        }
        Ok(())
    }

    /// Graceful stop of the proxy container.
    pub async fn stop(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.engine.stop(CONTAINER_NAME, STOP_TIMEOUT_SECS).await
    }
}

impl CaddyManager {
    async fn write_caddyfile(&self, rendered: &str) -> Result<()> {
        tokio::fs::write(self.caddyfile_path(), rendered)
            .await
            .map_err(|err| {
                Error::internal(format!(
                    "failed to write {}",
                    self.caddyfile_path().display()
                ))
                .with_source(err)
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use warp::Filter;

    use super::*;
    use crate::engine::fake::FakeEngine;

    fn config(dir: &Path, admin_port: u16) -> CaddyConfig {
        CaddyConfig {
            enabled: true,
            data_dir: dir.display().to_string(),
            admin_port,
            ..CaddyConfig::default()
        }
    }

    #[tokio::test]
    async fn ensure_running_prepares_dirs_container_and_network() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let manager = CaddyManager::new(engine.clone(), config(dir.path(), 2019), 8080);

        manager.ensure_running().await.unwrap();

        for sub in ["caddy_data", "caddy_config", "www"] {
            assert!(dir.path().join(sub).is_dir(), "{sub} missing");
        }
        let caddyfile = std::fs::read_to_string(dir.path().join(CADDYFILE)).unwrap();
        assert!(caddyfile.contains("admin 0.0.0.0:2019"));

        let container = engine.container(CONTAINER_NAME).expect("proxy container");
        assert_eq!(container.label(LABEL_SYSTEM), Some("caddy"));
        // External bindings, not loopback.
        assert_eq!(
            container.ports.get("80/tcp").map(String::as_str),
            Some("0.0.0.0:80")
        );
        assert_eq!(
            container.ports.get("2019/tcp").map(String::as_str),
            Some("0.0.0.0:2019")
        );
        assert!(container.networks.iter().any(|n| n == "simplify-proxy"));
    }

    #[tokio::test]
    async fn ensure_running_is_a_noop_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let mut cfg = config(dir.path(), 2019);
        cfg.enabled = false;
        let manager = CaddyManager::new(engine.clone(), cfg, 8080);

        manager.ensure_running().await.unwrap();

        assert!(engine.container(CONTAINER_NAME).is_none());
        assert!(!dir.path().join(CADDYFILE).exists());
    }

    #[tokio::test]
    async fn reload_posts_the_rendered_config_to_the_admin_endpoint() {
        let received: Arc<Mutex<Option<(String, String)>>> = Arc::new(Mutex::new(None));
        let sink = received.clone();
        let admin = warp::post()
            .and(warp::path("load"))
            .and(warp::header::<String>("content-type"))
            .and(warp::body::bytes())
            .map(move |content_type: String, body: hyper::body::Bytes| {
                *sink.lock().unwrap() =
                    Some((content_type, String::from_utf8_lossy(&body).into_owned()));
                warp::reply()
            });
        let (addr, server) = warp::serve(admin).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let manager = CaddyManager::new(engine, config(dir.path(), addr.port()), 8080);

        let routes = vec![
            Route {
                hostname: "a.example".to_owned(),
                upstream: "a:3000".to_owned(),
            },
            Route {
                hostname: "b.example".to_owned(),
                upstream: "b:8080".to_owned(),
            },
        ];
        manager.reload(&routes).await.unwrap();

        let (content_type, body) = received.lock().unwrap().clone().expect("admin hit");
        assert_eq!(content_type, "text/caddyfile");
        assert!(body.contains("a.example {\n\treverse_proxy a:3000\n}"));
        assert!(body.contains("b.example {\n\treverse_proxy b:8080\n}"));
        assert!(body.find("a.example").unwrap() < body.find("b.example").unwrap());

        let persisted = std::fs::read_to_string(dir.path().join(CADDYFILE)).unwrap();
        assert_eq!(persisted, body);
    }

    #[tokio::test]
    async fn stop_is_graceful_and_skipped_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let manager = CaddyManager::new(engine.clone(), config(dir.path(), 2019), 8080);
        manager.ensure_running().await.unwrap();

        manager.stop().await.unwrap();
        assert_eq!(engine.container(CONTAINER_NAME).unwrap().status, "exited");

        let mut disabled_cfg = config(dir.path(), 2019);
        disabled_cfg.enabled = false;
        let disabled = CaddyManager::new(engine, disabled_cfg, 8080);
        disabled.stop().await.unwrap();
    }

    #[tokio::test]
    async fn reload_surfaces_non_2xx_with_the_body() {
        let admin = warp::post().and(warp::path("load")).map(|| {
            warp::reply::with_status("adapting config: bad syntax", warp::http::StatusCode::BAD_REQUEST)
        });
        let (addr, server) = warp::serve(admin).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let manager = CaddyManager::new(engine, config(dir.path(), addr.port()), 8080);

        let err = manager.reload(&[]).await.unwrap_err();
        assert!(err.to_string().contains("bad syntax"));
    }
}
