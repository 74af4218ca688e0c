//! Request dispatch against a single routing index entry.
//!
//! Dynamic routers walk `routes` in declaration order and run the first
//! match. Simple routers map the request path straight onto a file under
//! `serve_folder`.

use spacegrid_core::{ExecuteOptions, HttpContext, Runtime, SpaceResponse};
use spacegrid_state::{Route, RouteType, RouterType, StateStore};
use tracing::debug;

use crate::error::{RouteError, RouteResult};
use crate::index::RoutingIndexEntry;
use crate::matcher::find_route;

/// Serve `ctx` from the space described by `entry`.
///
/// `ctx.path` is the path inside the space. Path parameters bound by the
/// matched route are written into `ctx.params` before any handler runs.
pub async fn serve(
    entry: &RoutingIndexEntry,
    store: &StateStore,
    runtime: &dyn Runtime,
    ctx: &mut HttpContext,
) -> RouteResult<SpaceResponse> {
    match entry.route_option.router_type {
        RouterType::Dynamic => serve_dynamic(entry, store, runtime, ctx).await,
        RouterType::Simple => serve_simple(entry, store, &ctx.path),
    }
}

async fn serve_dynamic(
    entry: &RoutingIndexEntry,
    store: &StateStore,
    runtime: &dyn Runtime,
    ctx: &mut HttpContext,
) -> RouteResult<SpaceResponse> {
    let Some((route, params)) = find_route(&entry.route_option.routes, &ctx.method, &ctx.path)
    else {
        return Err(RouteError::RouteNotFound {
            method: ctx.method.clone(),
            path: ctx.path.clone(),
        });
    };
    ctx.params = params;

    debug!(
        namespace = %entry.namespace_key,
        route = %route.path,
        route_type = ?route.route_type,
        "route matched"
    );

    match route.route_type {
        RouteType::Static => {
            let file = if route.file.is_empty() {
                ctx.path.as_str()
            } else {
                route.file.as_str()
            };
            let path = join_path(&entry.route_option.serve_folder, file)?;
            let body = read_file(entry, store, &path)?.ok_or(RouteError::FileNotFound(path.clone()))?;
            Ok(SpaceResponse::new(200, content_type(&path), body))
        }
        RouteType::Template => {
            execute(entry, runtime, route, ctx).await?;
            let name = route.file.trim_start_matches('/');
            let rendered = entry.templates.render(name, &ctx.template_model())?;

            let mut response = std::mem::take(&mut ctx.response);
            response.body = rendered.into();
            response.set_header("content-type", "text/html; charset=utf-8");
            Ok(response)
        }
        RouteType::Api => {
            execute(entry, runtime, route, ctx).await?;
            Ok(std::mem::take(&mut ctx.response))
        }
    }
}

fn serve_simple(entry: &RoutingIndexEntry, store: &StateStore, request_path: &str) -> RouteResult<SpaceResponse> {
    let folder = &entry.route_option.serve_folder;
    let mut file = request_path.trim_start_matches('/').to_string();
    if file.is_empty() || file.ends_with('/') {
        file.push_str("index.html");
    }

    let path = join_path(folder, &file)?;
    if let Some(body) = read_file(entry, store, &path)? {
        return Ok(SpaceResponse::new(200, content_type(&path), body));
    }

    if let Some(fallback) = &entry.route_option.on_not_found_file {
        let path = join_path(folder, fallback)?;
        if let Some(body) = read_file(entry, store, &path)? {
            debug!(namespace = %entry.namespace_key, %path, "serving not-found fallback");
            return Ok(SpaceResponse::new(200, content_type(&path), body));
        }
    }

    Err(RouteError::FileNotFound(path))
}

async fn execute(
    entry: &RoutingIndexEntry,
    runtime: &dyn Runtime,
    route: &Route,
    ctx: &mut HttpContext,
) -> RouteResult<()> {
    let opts = ExecuteOptions {
        package_name: entry.package_name.clone(),
        package_version_id: entry.package_version_id,
        installed_id: entry.installed_id,
        space_id: entry.space_id,
        handler_name: route.handler.clone(),
        params: ctx.params.clone(),
    };
    runtime.execute_http(opts, ctx).await?;
    Ok(())
}

/// Read a package file, falling back to the overlaid space's package.
fn read_file(entry: &RoutingIndexEntry, store: &StateStore, path: &str) -> RouteResult<Option<Vec<u8>>> {
    if let Some(bytes) = store.read_package_file(entry.package_version_id, path)? {
        return Ok(Some(bytes));
    }
    if entry.overlay_for_space_id == 0 {
        return Ok(None);
    }
    match store.get_space(entry.overlay_for_space_id)? {
        Some(base) => Ok(store.read_package_file(base.package_version_id, path)?),
        None => Ok(None),
    }
}

/// Join a folder and a request path into a package-relative file path.
///
/// `.` and empty segments are dropped; `..` is rejected outright.
pub(crate) fn join_path(folder: &str, file: &str) -> RouteResult<String> {
    let mut parts = Vec::new();
    for segment in folder.split('/').chain(file.split('/')) {
        match segment {
            "" | "." => {}
            ".." => return Err(RouteError::InvalidPath(file.to_string())),
            s => parts.push(s),
        }
    }
    Ok(parts.join("/"))
}

pub(crate) fn content_type(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "application/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}
