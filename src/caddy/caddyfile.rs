use crate::controller::names;
use crate::resource::Application;

const DEFAULT_UPSTREAM_PORT: u16 = 80;

/// One virtual host handed to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub hostname: String,
    pub upstream: String,
}

/// Derive the route list from the application set.
///
/// Proxy-disabled applications and empty hostnames are skipped; input
/// order is preserved so the rendered configuration is stable.
pub(crate) fn routes(apps: &[Application]) -> Vec<Route> {
    apps.iter()
        .filter_map(|app| {
            let proxy = app.proxy.as_ref()?;
            if !proxy.enabled || proxy.hostname.is_empty() {
                return None;
            }
            let port = if proxy.port == 0 {
                DEFAULT_UPSTREAM_PORT
            } else {
                proxy.port
            };
            Some(Route {
                hostname: proxy.hostname.clone(),
                upstream: format!("{}:{port}", names::container_name(app)),
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub(crate) struct RenderOptions {
    pub admin_port: u16,
    /// Upstream for `/api/*`, `/healthz` and `/readyz` on the
    /// control-plane site. `None` renders no control-plane site.
    pub api_upstream: Option<String>,
    /// Static frontend root inside the proxy container.
    pub site_root: String,
}

/// Render the complete Caddyfile. Pure: identical inputs produce
/// byte-identical output.
pub(crate) fn render(routes: &[Route], options: &RenderOptions) -> String {
    let mut out = String::new();
    out.push_str("{\n");
    out.push_str(&format!("\tadmin 0.0.0.0:{}\n", options.admin_port));
    out.push_str("}\n");

    if let Some(api) = &options.api_upstream {
        out.push_str("\n:80 {\n");
        for path in ["/healthz", "/readyz", "/api/*"] {
            out.push_str(&format!("\thandle {path} {{\n\t\treverse_proxy {api}\n\t}}\n"));
        }
        out.push_str("\thandle {\n");
        out.push_str(&format!("\t\troot * {}\n", options.site_root));
        out.push_str("\t\ttry_files {path} /index.html\n");
        out.push_str("\t\tfile_server\n");
        out.push_str("\t}\n");
        out.push_str("}\n");
    }

    for route in routes {
        out.push_str(&format!(
            "\n{} {{\n\treverse_proxy {}\n}}\n",
            route.hostname, route.upstream
        ));
    }
    out
}
