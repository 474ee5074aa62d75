use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::caddy::{self, CaddyManager, Route};
use crate::engine::{ContainerEngine, ContainerInfo, RunSpec};
use crate::error::Result;
use crate::resource::{Application, Network, Pod, LABEL_APP_ID, LABEL_MANAGED, LEGACY_NAME_PREFIX};
use crate::store::{self, Store};

pub(crate) mod names;
pub(crate) mod ports;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Ceiling on the deploy backoff, in ticks.
const MAX_BACKOFF_TICKS: u64 = 16;

/// Everything one reconciliation pass needs.
pub struct Context {
    pub store: Store,
    pub engine: Arc<dyn ContainerEngine>,
    pub caddy: Option<Arc<CaddyManager>>,
    pub interval: Duration,
}

/// Run the reconciliation loop until the shutdown signal fires.
///
/// One pass per tick, never two in flight. A failed pass is logged and
/// the loop carries on; the next tick retries from a fresh snapshot.
pub async fn run(ctx: Context, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(ctx.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state = PassState::default();
    info!(interval_secs = ctx.interval.as_secs(), "reconciler started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(error) = pass(&ctx, &mut state).await {
                    warn!(%error, "reconciliation pass failed");
                }
            }
            _ = shutdown.changed() => {
                debug!("reconciler stopping");
                return;
            }
        }
    }
}

/// State carried between passes: the tick counter driving per-application
/// deploy backoff, and the route set last applied to the proxy.
#[derive(Default)]
struct PassState {
    tick: u64,
    backoff: HashMap<String, Backoff>,
    routes: Vec<Route>,
}

struct Backoff {
    failures: u32,
    retry_at: u64,
}

impl PassState {
    fn in_backoff(&self, app_id: &str) -> bool {
        self.backoff
            .get(app_id)
            .map_or(false, |backoff| self.tick < backoff.retry_at)
    }

    fn record_failure(&mut self, app_id: &str) {
        let entry = self
            .backoff
            .entry(app_id.to_owned())
            .or_insert(Backoff { failures: 0, retry_at: 0 });
        entry.failures += 1;
        // One tick after the first failure, doubling per consecutive
        // failure, capped: 1, 2, 4, 8, 16, 16, ...
        let delay = (1_u64 << (entry.failures - 1).min(4)).min(MAX_BACKOFF_TICKS);
        entry.retry_at = self.tick + delay;
    }

    fn clear_backoff(&mut self, app_id: &str) {
        self.backoff.remove(app_id);
    }
}

#[tracing::instrument(skip_all, level = "debug")]
async fn pass(ctx: &Context, state: &mut PassState) -> Result<()> {
    state.tick += 1;
    let apps: Vec<Application> = ctx.store.list(store::APPLICATIONS)?;
    let containers = ctx.engine.list(true).await?;

    let managed: Vec<&ContainerInfo> = containers.iter().filter(|c| is_managed(c)).collect();
    let mut by_app_id: HashMap<String, &ContainerInfo> = HashMap::new();
    for container in &managed {
        if let Some(owner) = owner_id(container) {
            by_app_id.insert(owner, *container);
        }
    }
    let managed_names: BTreeSet<String> = managed.iter().map(|c| c.name.clone()).collect();

    // Names accounted for by a desired application this pass; everything
    // else carrying the managed label is an orphan.
    let mut kept: BTreeSet<String> = BTreeSet::new();
    for app in &apps {
        match reconcile_app(ctx, state, app, &by_app_id).await {
            Ok(Some(name)) => {
                kept.insert(name);
            }
            Ok(None) => {}
            Err(error) => {
                warn!(app = %app.name, %error, "failed to reconcile application");
            }
        }
    }

    for name in managed_names.difference(&kept) {
        info!(container = %name, "removing orphaned container");
        if let Err(error) = ctx.engine.remove(name, true).await {
            warn!(container = %name, %error, "failed to remove orphan");
        }
    }

    if let Err(error) = reconcile_pods(ctx).await {
        warn!(%error, "failed to reconcile pods");
    }
    if let Err(error) = reconcile_networks(ctx).await {
        warn!(%error, "failed to reconcile networks");
    }

    refresh_routes(ctx, state, &apps).await;
    Ok(())
}

/// Converge one application. Returns the container name this application
/// accounts for, so the garbage collector leaves it alone.
#[tracing::instrument(skip_all, fields(app = %app.name), level = "trace")]
async fn reconcile_app(
    ctx: &Context,
    state: &mut PassState,
    app: &Application,
    by_app_id: &HashMap<String, &ContainerInfo>,
) -> Result<Option<String>> {
    if app.replicas == 0 {
        // Nothing desired; any leftover container is collected as an orphan.
        return Ok(None);
    }

    let Some(existing) = by_app_id.get(app.id.as_str()) else {
        if state.in_backoff(&app.id) {
            debug!(app = %app.name, "deploy backing off");
            return Ok(None);
        }
        let name = names::container_name(app);
        return match deploy(ctx, app, &name).await {
            Ok(container_id) => {
                state.clear_backoff(&app.id);
                info!(app = %app.name, container = %container_id, "deployed application");
                Ok(Some(name))
            }
            Err(error) => {
                state.record_failure(&app.id);
                Err(error)
            }
        };
    };

    if !existing.is_running() {
        info!(
            app = %app.name,
            container = %existing.name,
            status = %existing.status,
            "removing stopped container for replacement"
        );
        ctx.engine.remove(&existing.name, true).await?;
        // Accounted for: the next tick recreates it.
        return Ok(Some(existing.name.clone()));
    }

    if !ports::matches(&app.ports, &existing.ports) {
        info!(
            app = %app.name,
            container = %existing.name,
            "port bindings drifted, removing container for replacement"
        );
        ctx.engine.remove(&existing.name, true).await?;
        return Ok(Some(existing.name.clone()));
    }

    Ok(Some(existing.name.clone()))
}

async fn deploy(ctx: &Context, app: &Application, name: &str) -> Result<String> {
    ctx.engine
        .run(RunSpec {
            name: name.to_owned(),
            image: app.image.clone(),
            ports: app.ports.clone(),
            env: app.env.clone(),
            labels: app.labels(),
            ..RunSpec::default()
        })
        .await
}

/// Desired pods materialise lazily as engine pods; engine pods with no
/// desired counterpart are removed.
async fn reconcile_pods(ctx: &Context) -> Result<()> {
    let desired: Vec<Pod> = ctx.store.list(store::PODS)?;
    let existing: BTreeSet<String> = ctx
        .engine
        .list_pods()
        .await?
        .into_iter()
        .map(|pod| pod.name)
        .collect();

    let mut desired_names = BTreeSet::new();
    for pod in &desired {
        let name = names::sanitize(&pod.name);
        if name.is_empty() {
            continue;
        }
        if !existing.contains(&name) {
            debug!(pod = %pod.name, "creating pod");
            if let Err(error) = ctx.engine.create_pod(&name).await {
                warn!(pod = %pod.name, %error, "failed to create pod");
            }
        }
        desired_names.insert(name);
    }
    for name in existing.difference(&desired_names) {
        info!(pod = %name, "removing undesired pod");
        if let Err(error) = ctx.engine.remove_pod(name).await {
            warn!(pod = %name, %error, "failed to remove pod");
        }
    }
    Ok(())
}

/// Desired networks are created when missing. Removal is left to the API
/// delete path; the engine also hosts networks we do not own.
async fn reconcile_networks(ctx: &Context) -> Result<()> {
    let desired: Vec<Network> = ctx.store.list(store::NETWORKS)?;
    let existing: BTreeSet<String> = ctx
        .engine
        .list_networks()
        .await?
        .into_iter()
        .map(|network| network.name)
        .collect();

    for network in &desired {
        let name = names::sanitize(&network.name);
        if name.is_empty() || existing.contains(&name) {
            continue;
        }
        debug!(network = %network.name, "creating network");
        if let Err(error) = ctx.engine.create_network(&name).await {
            warn!(network = %network.name, %error, "failed to create network");
        }
    }
    Ok(())
}

/// Re-render the proxy route set and reload when it changed.
async fn refresh_routes(ctx: &Context, state: &mut PassState, apps: &[Application]) {
    let Some(manager) = &ctx.caddy else { return };
    let routes = caddy::routes(apps);
    if routes == state.routes {
        return;
    }
    match manager.reload(&routes).await {
        Ok(()) => {
            info!(routes = routes.len(), "reloaded proxy configuration");
            state.routes = routes;
        }
        Err(error) => {
            warn!(%error, "failed to reload proxy configuration");
        }
    }
}

fn is_managed(container: &ContainerInfo) -> bool {
    container.label(LABEL_MANAGED) == Some("true")
}

/// Owning application id: the `app.id` label, or the legacy name scheme
/// `simplify-<id>` for containers created before labels carried it.
fn owner_id(container: &ContainerInfo) -> Option<String> {
    if let Some(id) = container.label(LABEL_APP_ID) {
        return Some(id.to_owned());
    }
    container
        .name
        .strip_prefix(LEGACY_NAME_PREFIX)
        .map(str::to_owned)
}
