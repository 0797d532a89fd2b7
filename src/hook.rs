//! Hooks: a filter chain plus an optional command, bound to a route

use axum::http::StatusCode;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info};

use crate::error::{HookError, Result};
use crate::filters::{Filter, FilterChain, Rejection};
use crate::request::HookRequest;
use crate::runner::{LaunchedProcess, Runner};
use crate::template::CommandTemplate;
use crate::webhook::{WebhookEvent, normalize};
use crate::{HookConfig, HooksConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: usize,
    pub window_secs: u64,
}

/// Outcome of running an accepted request.
#[derive(Debug)]
pub enum Accepted {
    /// No command configured; the request is acknowledged as-is.
    NoCommand(WebhookEvent),
    Launched(LaunchedProcess),
}

#[derive(Debug, Clone)]
pub struct Hook {
    name: String,
    route: String,
    chain: FilterChain,
    exec: Option<CommandTemplate>,
    exec_log: Option<CommandTemplate>,
    strict: bool,
    rate_limit: Option<RateLimit>,
    runner: Runner,
}

impl Hook {
    /// Build a hook, installing only the filters that have something to match.
    /// Order is ip, token, branch.
    pub fn from_config(config: &HookConfig, runner: &Runner) -> Result<Self> {
        validate_route(&config.route)?;

        let mut filters = Vec::new();
        if let Some(ips) = config.ips.clone().into_allow_list() {
            debug!("Adding ips filter: {:?}", ips);
            filters.push(Filter::ip(ips));
        }
        if let Some(token) = config.token.clone().and_then(|t| t.into_allow_list()) {
            debug!("Adding token filter on '{}'", config.get_token_key());
            filters.push(Filter::token(token, config.get_token_key()));
        }
        if let Some(branches) = config.branches.clone().and_then(|b| b.into_allow_list()) {
            debug!("Adding branches filter: {:?}", branches);
            filters.push(Filter::branch(branches));
        }
        let chain = FilterChain::new(filters).map_err(|e| match e {
            HookError::ConfigError(msg) => {
                HookError::ConfigError(format!("{} (route '{}')", msg, config.route))
            }
            other => other,
        })?;

        let exec = match config.exec.as_deref() {
            Some(exec) if exec.trim().is_empty() => {
                return Err(HookError::ConfigError(format!(
                    "hook '{}' has an empty exec command",
                    config.display_name()
                )));
            }
            Some(exec) => Some(CommandTemplate::new(exec)),
            None => None,
        };

        Ok(Self {
            name: config.display_name().to_string(),
            route: config.route.clone(),
            chain,
            exec,
            exec_log: config.get_exec_log().map(CommandTemplate::new),
            strict: config.strict,
            rate_limit: config.rate_limit.map(|max| RateLimit {
                max,
                window_secs: config.get_rate_limit_window(),
            }),
            runner: runner.clone(),
        })
    }

    /// Programmatic construction with an already built chain.
    pub fn new(name: impl Into<String>, route: impl Into<String>, chain: FilterChain) -> Self {
        Self {
            name: name.into(),
            route: route.into(),
            chain,
            exec: None,
            exec_log: None,
            strict: false,
            rate_limit: None,
            runner: Runner::default(),
        }
    }

    pub fn with_exec(mut self, exec: impl Into<String>) -> Self {
        self.exec = Some(CommandTemplate::new(exec));
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.rate_limit
    }

    pub fn check(&self, req: &HookRequest) -> std::result::Result<(), Rejection> {
        self.chain.check(req)
    }

    /// Normalize the body and launch the configured command, if any.
    pub async fn accept(&self, req: &HookRequest) -> Result<Accepted> {
        let event = normalize(&req.body);
        debug!("Hook '{}' accepted {} event", self.name, event.kind());

        let Some(exec) = &self.exec else {
            return Ok(Accepted::NoCommand(event));
        };

        let command = exec.resolve(&event)?;
        let log_path = match &self.exec_log {
            Some(template) => Some(render_log_path(template, &event)?),
            None => None,
        };

        let launched = self
            .runner
            .run(&self.name, &command, log_path.as_deref())
            .await?;
        Ok(Accepted::Launched(launched))
    }

    /// Run an accepted request and map the result to a response status.
    /// A launched child is handed off to supervision.
    pub async fn respond(&self, req: &HookRequest) -> Outcome {
        match self.accept(req).await {
            Ok(Accepted::NoCommand(_)) => Outcome {
                status: StatusCode::OK,
                launched: false,
            },
            Ok(Accepted::Launched(launched)) => {
                launched.supervise();
                Outcome {
                    status: StatusCode::OK,
                    launched: true,
                }
            }
            Err(e) => {
                error!("Hook '{}' failed: {}", self.name, e);
                Outcome {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    launched: false,
                }
            }
        }
    }
}

/// Status for the caller, and whether a command was started for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub status: StatusCode,
    pub launched: bool,
}

/// Routes are axum 0.8 paths: `{name}` captures and `{*rest}` wildcards.
/// Express-style `:name` / `*` segments and unbalanced braces would make
/// the router panic at startup, so they are refused here.
fn validate_route(route: &str) -> Result<()> {
    let invalid = |reason: &str| -> Result<()> {
        Err(HookError::ConfigError(format!(
            "hook route '{}' {}",
            route, reason
        )))
    };

    if !route.starts_with('/') {
        return invalid("must start with '/'");
    }
    for segment in route.split('/').skip(1) {
        if segment.starts_with(':') || segment.starts_with('*') {
            return invalid("uses ':name' or '*' segments; write '{name}' or '{*name}'");
        }

        let mut depth = 0usize;
        let mut capture = String::new();
        for c in segment.chars() {
            match c {
                '{' if depth == 0 => {
                    depth = 1;
                    capture.clear();
                }
                '}' if depth == 1 => {
                    let name = capture.trim_start_matches('*');
                    if name.is_empty() {
                        return invalid("has an empty '{}' capture");
                    }
                    depth = 0;
                }
                '{' | '}' => return invalid("has unbalanced braces"),
                _ if depth == 1 => capture.push(c),
                _ => {}
            }
        }
        if depth != 0 {
            return invalid("has unbalanced braces");
        }
    }
    Ok(())
}

/// Render the output log path. Substituted values may not climb out of the
/// directory the template names.
fn render_log_path(template: &CommandTemplate, event: &WebhookEvent) -> Result<PathBuf> {
    let rendered = PathBuf::from(template.render(event)?);
    if parent_dirs(&rendered) > parent_dirs(Path::new(template.source())) {
        return Err(HookError::UnsafeLogPath(rendered));
    }
    Ok(rendered)
}

fn parent_dirs(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::ParentDir))
        .count()
}

/// What the registry decided for one request.
#[derive(Debug, Clone, Copy)]
pub enum Decision<'a> {
    /// This hook passed all of its filters.
    Matched(&'a Hook),
    /// A strict hook rejected the request.
    Rejected(Rejection),
    /// No hook on the route took the request.
    NoMatch,
}

/// All hooks, grouped by route in declaration order.
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    routes: Vec<String>,
    hooks: HashMap<String, Vec<Hook>>,
}

impl HookRegistry {
    pub fn from_config(config: &HooksConfig) -> Result<Self> {
        let runner = Runner::new(config.sink_timeout());
        let mut registry = Self::default();
        for hook_config in &config.hook {
            registry.register(Hook::from_config(hook_config, &runner)?);
        }
        Ok(registry)
    }

    pub fn register(&mut self, hook: Hook) {
        let route = hook.route().to_string();
        if !self.hooks.contains_key(&route) {
            self.routes.push(route.clone());
        }
        info!("Registering hook '{}' on POST {}", hook.name(), route);
        self.hooks.entry(route).or_default().push(hook);
    }

    pub fn routes(&self) -> &[String] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// First hook on `route` whose filters pass. A failing non-strict hook
    /// passes the request on to the next hook of the same route.
    pub fn decide(&self, route: &str, req: &HookRequest) -> Decision<'_> {
        let Some(hooks) = self.hooks.get(route) else {
            return Decision::NoMatch;
        };
        for hook in hooks {
            match hook.check(req) {
                Ok(()) => return Decision::Matched(hook),
                Err(rejection) if hook.is_strict() => {
                    info!(
                        "Hook '{}' rejected request from {} ({} filter)",
                        hook.name(),
                        req.remote_addr,
                        rejection.filter
                    );
                    return Decision::Rejected(rejection);
                }
                Err(rejection) => {
                    debug!(
                        "Hook '{}' skipped request from {} ({} filter)",
                        hook.name(),
                        req.remote_addr,
                        rejection.filter
                    );
                }
            }
        }
        Decision::NoMatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{AllowListSetting, FilterKind};
    use serde_json::{Value, json};
    use std::net::{IpAddr, Ipv4Addr};

    fn config(route: &str) -> HookConfig {
        HookConfig {
            route: route.to_string(),
            name: None,
            ips: AllowListSetting::One("127.0.0.1".into()),
            token: None,
            token_key: None,
            branches: None,
            exec: None,
            exec_log: None,
            strict: false,
            rate_limit: None,
            rate_limit_window: None,
        }
    }

    fn local(body: Value) -> HookRequest {
        HookRequest::new(IpAddr::V4(Ipv4Addr::LOCALHOST), body)
    }

    fn push_body(reference: &str) -> Value {
        json!({
            "ref": reference,
            "before": "95790bf891e76fee5e1747ab589903a6a1f80f22",
            "after": "da1560886d4f094c3e6c9ef40349f7d38b5d27d7",
            "user_id": 4,
            "repository": { "name": "Diaspora" },
            "token": "keyboard cat"
        })
    }

    #[test]
    fn filters_are_installed_in_order() {
        let mut cfg = config("/hook");
        cfg.token = Some(AllowListSetting::One("keyboard cat".into()));
        cfg.branches = Some(AllowListSetting::Many(vec!["main".into()]));
        let hook = Hook::from_config(&cfg, &Runner::default()).unwrap();
        assert_eq!(
            hook.chain.kinds(),
            vec![FilterKind::Ip, FilterKind::Token, FilterKind::Branch]
        );
    }

    #[test]
    fn disabled_filters_are_not_installed() {
        let mut cfg = config("/hook");
        cfg.ips = AllowListSetting::Enabled(false);
        cfg.token = Some(AllowListSetting::One(String::new()));
        cfg.branches = Some(AllowListSetting::One("*".into()));
        let hook = Hook::from_config(&cfg, &Runner::default()).unwrap();
        assert_eq!(hook.chain.kinds(), vec![FilterKind::Branch]);
    }

    #[test]
    fn rejects_invalid_hooks() {
        let mut no_filters = config("/hook");
        no_filters.ips = AllowListSetting::Enabled(false);
        assert!(Hook::from_config(&no_filters, &Runner::default()).is_err());

        let bad_route = config("hook");
        assert!(Hook::from_config(&bad_route, &Runner::default()).is_err());

        let mut blank_exec = config("/hook");
        blank_exec.exec = Some("  ".into());
        assert!(Hook::from_config(&blank_exec, &Runner::default()).is_err());
    }

    #[test]
    fn non_strict_rejection_falls_through_to_next_hook() {
        let mut production = config("/hook");
        production.name = Some("production".into());
        production.branches = Some(AllowListSetting::One("production".into()));
        let mut staging = config("/hook");
        staging.name = Some("staging".into());
        staging.branches = Some(AllowListSetting::One("staging".into()));

        let registry = HookRegistry::from_config(&HooksConfig {
            sink_timeout_secs: None,
            trust_proxy: false,
            hook: vec![production, staging],
        })
        .unwrap();
        assert_eq!(registry.routes(), ["/hook"]);
        assert_eq!(registry.len(), 2);

        match registry.decide("/hook", &local(push_body("refs/heads/staging"))) {
            Decision::Matched(hook) => assert_eq!(hook.name(), "staging"),
            other => panic!("unexpected decision: {other:?}"),
        }
        assert!(matches!(
            registry.decide("/hook", &local(push_body("refs/heads/dev"))),
            Decision::NoMatch
        ));
        assert!(matches!(
            registry.decide("/other", &local(push_body("refs/heads/staging"))),
            Decision::NoMatch
        ));
    }

    #[test]
    fn strict_rejection_stops_immediately() {
        let mut strict = config("/hook");
        strict.strict = true;
        strict.branches = Some(AllowListSetting::One("production".into()));
        let fallback = config("/hook");

        let registry = HookRegistry::from_config(&HooksConfig {
            sink_timeout_secs: None,
            trust_proxy: false,
            hook: vec![strict, fallback],
        })
        .unwrap();

        match registry.decide("/hook", &local(push_body("refs/heads/dev"))) {
            Decision::Rejected(rejection) => {
                assert_eq!(rejection.filter, FilterKind::Branch);
                assert_eq!(rejection.status(), StatusCode::FORBIDDEN);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[tokio::test]
    async fn accept_without_command_normalizes() {
        let hook = Hook::from_config(&config("/hook"), &Runner::default()).unwrap();
        match hook.accept(&local(push_body("refs/heads/main"))).await.unwrap() {
            Accepted::NoCommand(event) => assert_eq!(event.ref_name(), Some("main")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn accept_launches_templated_command() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let log = dir.path().join("{{branch}}.log");

        let mut cfg = config("/hook");
        cfg.exec = Some("echo {{branch}} {{user_id}}".into());
        cfg.exec_log = Some(log.display().to_string());
        let hook = Hook::from_config(&cfg, &Runner::default()).unwrap();

        let Accepted::Launched(launched) =
            hook.accept(&local(push_body("refs/heads/main"))).await.unwrap()
        else {
            panic!("expected a launched process");
        };
        assert_eq!(launched.dispatch.command, "echo main 4");
        launched.supervise().await.unwrap();

        let output = std::fs::read_to_string(dir.path().join("main.log")).unwrap();
        assert_eq!(output, "main 4\n");
    }

    #[tokio::test]
    async fn unresolvable_template_is_a_server_error() {
        let mut cfg = config("/hook");
        cfg.exec = Some("echo {{nonexistent.field}}".into());
        let hook = Hook::from_config(&cfg, &Runner::default()).unwrap();

        let outcome = hook.respond(&local(push_body("refs/heads/main"))).await;
        assert_eq!(outcome.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!outcome.launched);
    }

    #[test]
    fn axum_route_syntax_is_validated() {
        for route in ["/hook", "/hook/{token}", "/hooks/{project}/{*rest}"] {
            assert!(validate_route(route).is_ok(), "{route} should be valid");
        }
        for route in ["/hook/:name", "/hook/*", "/hook/{name", "/hook/name}", "/hook/{}"] {
            assert!(
                matches!(validate_route(route), Err(HookError::ConfigError(_))),
                "{route} should be refused"
            );
        }
    }

    #[test]
    fn exec_gets_the_default_log() {
        let mut cfg = config("/hook");
        cfg.exec = Some("true".into());
        let hook = Hook::from_config(&cfg, &Runner::default()).unwrap();
        assert_eq!(
            hook.exec_log.as_ref().map(CommandTemplate::source),
            Some("./logs/deploy.log")
        );

        cfg.exec_log = Some(String::new());
        let hook = Hook::from_config(&cfg, &Runner::default()).unwrap();
        assert!(hook.exec_log.is_none());
    }

    #[tokio::test]
    async fn log_path_values_cannot_climb_out() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let marker = dir.path().join("spawned");
        let mut cfg = config("/hook");
        cfg.exec = Some(format!("touch {}", marker.display()));
        cfg.exec_log = Some(format!("{}/logs/{{{{user_name}}}}.log", dir.path().display()));
        let hook = Hook::from_config(&cfg, &Runner::default()).unwrap();

        let mut body = push_body("refs/heads/main");
        body["user_name"] = json!("../../escaped");
        let err = hook.accept(&local(body)).await.unwrap_err();
        assert!(matches!(err, HookError::UnsafeLogPath(_)));
        assert!(!marker.exists());

        let mut parent = config("/hook");
        parent.exec = Some("true".into());
        parent.exec_log = Some(format!("{}/logs/../{{{{branch}}}}.log", dir.path().display()));
        let hook = Hook::from_config(&parent, &Runner::default()).unwrap();
        let Accepted::Launched(launched) =
            hook.accept(&local(push_body("refs/heads/main"))).await.unwrap()
        else {
            panic!("expected a launched process");
        };
        launched.supervise().await.unwrap();
    }
}
