//! Placing the proxy at the end of a host's handler chain

use crate::host::{DevServerHandle, HookConfig, SetupFn, SetupMiddlewares};
use crate::middleware::{Layer, Middleware};
use crate::proxy::ProxyHandler;
use std::sync::Arc;

/// Wrap `dev.setup_middlewares` so the proxy is pushed after everything the
/// user's own functions add.
///
/// The user's function (or list of functions) runs first, in order, with the
/// same arguments; it never sees the proxy.
pub fn merge_setup_middlewares(config: HookConfig, proxy: Arc<ProxyHandler>) -> HookConfig {
    let HookConfig { mut dev, server } = config;
    let existing = dev.setup_middlewares.take();

    let merged: SetupFn = Arc::new(move |middlewares: &mut Vec<Arc<dyn Middleware>>, handle: &DevServerHandle| {
        if let Some(user) = &existing {
            user.apply(middlewares, handle);
        }
        middlewares.push(Arc::clone(&proxy) as Arc<dyn Middleware>);
    });

    dev.setup_middlewares = Some(SetupMiddlewares::One(merged));
    HookConfig { dev, server }
}

/// Where [`splice_before`] put the new layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceOutcome {
    /// Inserted at this index, directly before the anchor
    Before(usize),
    /// Anchor missing; pushed to the end
    Appended,
}

/// Insert `layer` immediately before the first layer named `anchor`
pub fn splice_before(stack: &mut Vec<Layer>, anchor: &str, layer: Layer) -> SpliceOutcome {
    match stack.iter().position(|existing| existing.name == anchor) {
        Some(index) => {
            stack.insert(index, layer);
            SpliceOutcome::Before(index)
        }
        None => {
            stack.push(layer);
            SpliceOutcome::Appended
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyOptions;
    use crate::filter::PathFilter;
    use crate::host::TracingLogger;
    use crate::middleware::testing::Fixed;
    use crate::proxy::PROXY_MIDDLEWARE_NAME;
    use crate::resolver::resolve_target;
    use crate::resolver::testing::FixedProbe;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    fn proxy() -> Arc<ProxyHandler> {
        let target = resolve_target("http://127.0.0.1:5000", &FixedProbe(None)).unwrap();
        Arc::new(
            ProxyHandler::new(
                target,
                PathFilter::new(None),
                &ProxyOptions::default(),
                Arc::new(TracingLogger::new("test")),
            )
            .unwrap(),
        )
    }

    fn server_handle() -> DevServerHandle {
        DevServerHandle {
            root: PathBuf::from("public"),
            hmr_path: None,
        }
    }

    fn layer(name: &'static str) -> Layer {
        Layer::new(Arc::new(Fixed { name, path: "/" }))
    }

    fn names(middlewares: &[Arc<dyn Middleware>]) -> Vec<String> {
        middlewares.iter().map(|m| m.name().to_string()).collect()
    }

    #[test]
    fn test_merge_without_user_setup() {
        let config = merge_setup_middlewares(HookConfig::default(), proxy());
        let mut middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(Fixed { name: "static", path: "/" })];
        config
            .dev
            .setup_middlewares
            .unwrap()
            .apply(&mut middlewares, &server_handle());

        assert_eq!(names(&middlewares), vec!["static", PROXY_MIDDLEWARE_NAME]);
    }

    #[test]
    fn test_merge_runs_user_setup_first_with_same_arguments() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_user = Arc::clone(&seen);
        let user: SetupFn = Arc::new(move |middlewares: &mut Vec<Arc<dyn Middleware>>, handle: &DevServerHandle| {
            seen_by_user.lock().push((names(middlewares), handle.root.clone()));
            middlewares.push(Arc::new(Fixed { name: "user", path: "/user" }));
        });

        let mut config = HookConfig::default();
        config.dev.setup_middlewares = Some(SetupMiddlewares::One(user));
        let config = merge_setup_middlewares(config, proxy());

        let mut middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(Fixed { name: "static", path: "/" })];
        config
            .dev
            .setup_middlewares
            .unwrap()
            .apply(&mut middlewares, &server_handle());

        assert_eq!(names(&middlewares), vec!["static", "user", PROXY_MIDDLEWARE_NAME]);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, vec!["static"]);
        assert_eq!(seen[0].1, PathBuf::from("public"));
    }

    #[test]
    fn test_merge_keeps_user_list_order() {
        let first: SetupFn = Arc::new(|middlewares: &mut Vec<Arc<dyn Middleware>>, _: &DevServerHandle| {
            middlewares.push(Arc::new(Fixed { name: "a", path: "/a" }))
        });
        let second: SetupFn = Arc::new(|middlewares: &mut Vec<Arc<dyn Middleware>>, _: &DevServerHandle| {
            middlewares.push(Arc::new(Fixed { name: "b", path: "/b" }))
        });

        let mut config = HookConfig::default();
        config.dev.setup_middlewares = Some(SetupMiddlewares::Many(vec![first, second]));
        config.server.html_fallback = false;
        let config = merge_setup_middlewares(config, proxy());
        assert!(!config.server.html_fallback);

        let mut middlewares = Vec::new();
        config
            .dev
            .setup_middlewares
            .unwrap()
            .apply(&mut middlewares, &server_handle());
        assert_eq!(names(&middlewares), vec!["a", "b", PROXY_MIDDLEWARE_NAME]);
    }

    #[test]
    fn test_splice_before_anchor() {
        let mut stack = vec![layer("hmr"), layer("static"), layer("not_found")];
        let outcome = splice_before(&mut stack, "not_found", layer("proxy"));

        assert_eq!(outcome, SpliceOutcome::Before(2));
        let order: Vec<_> = stack.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(order, vec!["hmr", "static", "proxy", "not_found"]);
    }

    #[test]
    fn test_splice_appends_when_anchor_missing() {
        let mut stack = vec![layer("hmr"), layer("static")];
        let outcome = splice_before(&mut stack, "not_found", layer("proxy"));

        assert_eq!(outcome, SpliceOutcome::Appended);
        let order: Vec<_> = stack.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(order, vec!["hmr", "static", "proxy"]);
    }
}
