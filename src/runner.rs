use std::io::Write;
use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use tracing::info;

use crate::asserter::Mismatch;
use crate::asserter::compare;
use crate::environment::Environment;
use crate::environment::response_variables;
use crate::executor::ExecuteError;
use crate::executor::Executor;
use crate::outputter::OutPutter;
use crate::parser::ApiQuest;
use crate::parser::Item;
use crate::parser::TestEntry;
use crate::substitute::SubstituteError;
use crate::substitute::shape;
use crate::substitute::substitute;
use crate::substitute::to_text;
use crate::template::ResolveError;
use crate::template::resolve;

pub const DEFAULT_HTTP_CODE: u16 = 200;

type CommandHandler = fn(&Value, &mut Environment) -> Result<(), CommandError>;

/// Recognized command keys, run in this order. Anything else in a block is ignored.
const COMMANDS: &[(&str, CommandHandler)] = &[("set", run_set)];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("command block must be a mapping, got {0}")]
    NotAMapping(String),

    #[error("`set` entry #{0} must be a mapping with `key` and `value`")]
    MalformedSet(usize),
}

/// Anything that stops the whole run, as opposed to a failed expectation.
#[derive(Error, Debug)]
pub enum TestError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Substitute(#[from] SubstituteError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("unknown request type: expected a request name or an inline request, got {0}")]
    UnknownRequestShape(String),

    #[error(transparent)]
    Execute(#[from] ExecuteError),
}

#[derive(Error, Debug)]
#[error("test `{test}` aborted the run: {source}")]
pub struct RunError {
    pub test: String,
    #[source]
    pub source: TestError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    /// The test has no `request`, so there was nothing to check.
    NoRequest,
    Failed(Mismatch),
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: Vec<(String, Mismatch)>,
    /// Name of the test that stopped the run, if one did.
    pub aborted: Option<String>,
}

impl RunSummary {
    pub fn executed(&self) -> usize {
        self.passed + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.aborted.is_none()
    }
}

pub struct Runner {
    config: Arc<ApiQuest>,
    test_items: Vec<Item>,
    environment: Environment,
    executor: Executor,
}

impl Runner {
    pub fn new(config: ApiQuest, environment: Environment, executor: Executor) -> Self {
        let test_items = config.test_items();

        Self {
            config: Arc::new(config),
            test_items,
            environment,
            executor,
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Runs every test in document order.
    ///
    /// A failed expectation is reported and the run moves on. Any other error is reported once
    /// against the test it happened in, and the remaining tests are skipped.
    pub async fn run_all<W: Write>(&mut self, out: &mut OutPutter<W>) -> RunSummary {
        let config = Arc::clone(&self.config);
        let mut summary = RunSummary {
            total: config.tests.len(),
            ..RunSummary::default()
        };

        for (index, entry) in config.tests.iter().enumerate() {
            let mut name = format!("Test #{}", index + 1);

            match self.run_test(entry, &mut name, out).await {
                Ok(outcome) => {
                    out.outcome(&name, &outcome);
                    match outcome {
                        Outcome::Passed | Outcome::NoRequest => summary.passed += 1,
                        Outcome::Failed(mismatch) => summary.failed.push((name, mismatch)),
                    }
                }
                Err(source) => {
                    let error = RunError { test: name, source };
                    info!(%error, "aborting run");
                    out.aborted(&error);
                    summary.aborted = Some(error.test);
                    break;
                }
            }
        }

        summary
    }

    /// `name` starts out as the positional default and is replaced once the test's own name
    /// is known, so errors can always be attributed.
    async fn run_test<W: Write>(
        &mut self,
        entry: &TestEntry,
        name: &mut String,
        out: &mut OutPutter<W>,
    ) -> Result<Outcome, TestError> {
        let test = match entry {
            TestEntry::Named(reference) => {
                *name = reference.clone();
                resolve(&self.test_items, reference)?
            }
            TestEntry::Inline(item) => item.clone(),
        };

        if let Some(raw_name) = test.get("name").filter(|n| !n.is_null()) {
            *name = to_text(&substitute(raw_name, &self.environment)?);
        }

        out.running(name);

        debug!(test = %name, "before");
        self.run_commands(test.get("before"), None)?;

        debug!(test = %name, "build request");
        let Some(raw_request) = test.get("request") else {
            debug!(test = %name, "no request, nothing to check");
            return Ok(Outcome::NoRequest);
        };
        let request = self.build_request(raw_request)?;

        debug!(test = %name, "send");
        let response = self.executor.execute(&request).await?;
        let fields = response.fields();

        debug!(test = %name, http_code = response.status.as_u16(), "compare");
        let expect = match test.get("expect").filter(|e| !e.is_null()) {
            Some(raw) => {
                let scope = self.environment.overlay(response_variables(&fields));
                substitute(raw, &scope)?
            }
            None => Value::Object(Map::new()),
        };
        let expect = with_default_http_code(expect);
        let verdict = compare(&expect, &Value::Object(fields.clone()), "expect");

        debug!(test = %name, "after");
        self.run_commands(test.get("after"), Some(&fields))?;

        Ok(match verdict {
            Ok(()) => Outcome::Passed,
            Err(mismatch) => Outcome::Failed(mismatch),
        })
    }

    /// A name is looked up in `requests`; an inline mapping is used as is. Either way the
    /// result has its placeholders filled in.
    fn build_request(&self, raw: &Value) -> Result<Map<String, Value>, TestError> {
        match substitute(raw, &self.environment)? {
            Value::String(reference) => {
                let resolved = resolve(&self.config.requests, &reference)?;
                match substitute(&Value::Object(resolved), &self.environment)? {
                    Value::Object(request) => Ok(request),
                    other => Err(TestError::UnknownRequestShape(shape(&other).into())),
                }
            }
            Value::Object(request) => Ok(request),
            other => Err(TestError::UnknownRequestShape(shape(&other).into())),
        }
    }

    /// Substitutes `block` (with the response's fields available, when there is one) and
    /// runs the commands in it.
    fn run_commands(
        &mut self,
        block: Option<&Value>,
        response: Option<&Map<String, Value>>,
    ) -> Result<(), TestError> {
        let Some(block) = block.filter(|b| !b.is_null()) else {
            return Ok(());
        };

        let block = match response {
            Some(fields) => {
                let scope = self.environment.overlay(response_variables(fields));
                substitute(block, &scope)?
            }
            None => substitute(block, &self.environment)?,
        };

        execute_commands(&block, &mut self.environment)?;
        Ok(())
    }
}

fn execute_commands(block: &Value, environment: &mut Environment) -> Result<(), CommandError> {
    let Value::Object(commands) = block else {
        return Err(CommandError::NotAMapping(shape(block).into()));
    };

    for (key, handler) in COMMANDS {
        if let Some(argument) = commands.get(*key) {
            handler(argument, environment)?;
        }
    }

    Ok(())
}

fn run_set(argument: &Value, environment: &mut Environment) -> Result<(), CommandError> {
    for (index, command) in ensure_list(argument).into_iter().enumerate() {
        let (Some(key), Some(value)) = (command.get("key"), command.get("value")) else {
            return Err(CommandError::MalformedSet(index));
        };

        debug!(key = %to_text(key), "set");
        environment.set(to_text(key), to_text(value));
    }

    Ok(())
}

fn ensure_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn with_default_http_code(expect: Value) -> Value {
    match expect {
        Value::Object(mut fields) => {
            if !fields.contains_key("http_code") {
                fields.insert("http_code".into(), Value::from(DEFAULT_HTTP_CODE));
            }
            Value::Object(fields)
        }
        other => other,
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use axum::Json;
    use axum::Router;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::routing::post;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::parser::Format;
    use crate::parser::parse;

    struct Stub {
        base: String,
        hits: Arc<AtomicUsize>,
    }

    async fn spawn_stub() -> Stub {
        let hits = Arc::new(AtomicUsize::new(0));

        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    "late"
                }),
            )
            .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "nope") }))
            .route(
                "/login",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({"token": "abc123", "user": body["user"]}))
                }),
            )
            .route(
                "/whoami",
                get(|headers: HeaderMap| async move {
                    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                        Some("Bearer abc123") => (StatusCode::OK, "alice"),
                        _ => (StatusCode::UNAUTHORIZED, "who?"),
                    }
                }),
            )
            .route(
                "/count",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "counted"
                }),
            )
            .with_state(hits.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Stub {
            base: format!("http://{addr}"),
            hits,
        }
    }

    async fn closed_port() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    async fn run(yaml: &str, seeds: &[(&str, &str)]) -> (RunSummary, Environment, String) {
        run_with(Executor::new(None).unwrap(), yaml, seeds).await
    }

    async fn run_with(
        executor: Executor,
        yaml: &str,
        seeds: &[(&str, &str)],
    ) -> (RunSummary, Environment, String) {
        let config = parse(yaml, Format::Yaml, "quest.yaml").unwrap();
        let environment = Environment::from_definitions(
            seeds.iter().map(|(k, v)| (k.to_string(), v.to_string())),
        );
        let mut runner = Runner::new(config, environment, executor);
        let mut out = OutPutter::new(Vec::new());

        let summary = runner.run_all(&mut out).await;
        let output = String::from_utf8(out.into_inner()).unwrap();

        (summary, runner.environment().clone(), output)
    }

    #[tokio::test]
    async fn default_http_code_applies_only_when_absent() {
        let stub = spawn_stub().await;
        let yaml = r#"
tests:
  - name: ok body
    request: { url: "{base}/health" }
    expect: { text: ok }
  - name: not found
    request: { url: "{base}/missing" }
    expect: { text: nope }
  - name: explicit code
    request: { url: "{base}/missing" }
    expect: { http_code: 404 }
"#;

        let (summary, _, output) = run(yaml, &[("base", stub.base.as_str())]).await;

        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "not found");
        assert_eq!(summary.failed[0].1.path(), "expect.http_code");
        assert!(output.contains("running test ok body"));
        assert!(output.contains("FAIL"));
    }

    #[tokio::test]
    async fn test_without_request_passes_without_a_call() {
        let stub = spawn_stub().await;
        let yaml = r#"
tests:
  - name: setup only
    before:
      set: { key: prepared, value: "yes" }
    after:
      set: { key: after_ran, value: "yes" }
"#;

        let (summary, env, _) = run(yaml, &[("base", stub.base.as_str())]).await;

        assert_eq!(summary.passed, 1);
        assert!(summary.is_success());
        assert_eq!(env.get("prepared"), Some("yes"));
        assert_eq!(env.get("after_ran"), None);
        assert_eq!(stub.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn set_commands_carry_across_tests_and_see_the_response() {
        let stub = spawn_stub().await;
        let yaml = r#"
requests:
  - name: login
    method: POST
    url: "{base}/login"
    payload: { user: "{user}" }
  - name: authed
    url: "{base}/whoami"
    headers:
      - { key: Authorization, value: "Bearer nothing" }
      - { key: Authorization, value: "Bearer {token}" }
tests:
  - name: log in
    before:
      set:
        - { key: user, value: alice }
    request: login
    expect:
      json: { user: "{user}" }
    after:
      set:
        - { key: token, value: "{json.token}" }
        - { key: echoed, value: "{user}" }
  - name: who am i
    request: authed
    expect: { text: "{user}" }
    after:
      set: { key: seen, value: "{text}-{http_code}" }
"#;

        let (summary, env, _) = run(yaml, &[("base", stub.base.as_str())]).await;

        assert!(summary.is_success(), "{summary:?}");
        assert_eq!(env.get("token"), Some("abc123"));
        assert_eq!(env.get("echoed"), Some("alice"));
        assert_eq!(env.get("seen"), Some("alice-200"));
    }

    #[tokio::test]
    async fn mutations_survive_a_failed_expectation() {
        let stub = spawn_stub().await;
        let yaml = r#"
tests:
  - name: failing
    before:
      set: { key: marker, value: set-before }
    request: { url: "{base}/health" }
    expect: { text: "something else" }
    after:
      set: { key: after_marker, value: "{text}" }
"#;

        let (summary, env, _) = run(yaml, &[("base", stub.base.as_str())]).await;

        assert_eq!(summary.failed.len(), 1);
        assert_eq!(env.get("marker"), Some("set-before"));
        assert_eq!(env.get("after_marker"), Some("ok"));
    }

    #[tokio::test]
    async fn transport_error_aborts_the_rest_but_mismatches_do_not() {
        let stub = spawn_stub().await;
        let dead = closed_port().await;
        let yaml = r#"
tests:
  - name: first
    request: { url: "{base}/missing" }
  - name: second
    request: { url: "{dead}/gone" }
  - name: third
    request: { url: "{base}/count" }
"#;

        let seeds = [("base", stub.base.as_str()), ("dead", dead.as_str())];
        let (summary, _, output) = run(yaml, &seeds).await;

        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.aborted.as_deref(), Some("second"));
        assert_eq!(summary.executed(), 1);
        assert!(!summary.is_success());
        assert_eq!(stub.hits.load(Ordering::SeqCst), 0);
        assert!(output.contains("running test second"));
        assert!(!output.contains("running test third"));
    }

    #[tokio::test]
    async fn timeout_aborts_the_remaining_tests() {
        let stub = spawn_stub().await;
        let yaml = r#"
tests:
  - name: slow
    request: { url: "{base}/slow" }
  - name: after slow
    request: { url: "{base}/count" }
"#;

        let executor = Executor::new(Some(Duration::from_millis(200))).unwrap();
        let seeds = [("base", stub.base.as_str())];
        let (summary, _, output) = run_with(executor, yaml, &seeds).await;

        assert_eq!(summary.aborted.as_deref(), Some("slow"));
        assert_eq!(summary.executed(), 0);
        assert_eq!(stub.hits.load(Ordering::SeqCst), 0);
        assert!(output.contains("request failed"));
        assert!(!output.contains("running test after slow"));
    }

    #[tokio::test]
    async fn undefined_variable_aborts_and_names_the_test() {
        let yaml = r#"
tests:
  - request: { url: "{nowhere}/x" }
  - name: never
"#;

        let (summary, env, output) = run(yaml, &[]).await;

        assert_eq!(summary.aborted.as_deref(), Some("Test #1"));
        assert_eq!(summary.executed(), 0);
        assert!(env.is_empty());
        assert!(output.contains("Test #1"));
        assert!(output.contains("undefined variable `nowhere`"));
        assert!(!output.contains("running test never"));
    }

    #[tokio::test]
    async fn unknown_request_shape_is_fatal() {
        let yaml = r#"
tests:
  - name: odd
    request: [1, 2]
"#;

        let (summary, _, output) = run(yaml, &[]).await;

        assert_eq!(summary.aborted.as_deref(), Some("odd"));
        assert!(output.contains("unknown request type"));
    }

    #[tokio::test]
    async fn missing_named_request_is_fatal() {
        let yaml = r#"
tests:
  - name: lost
    request: ghost
"#;

        let (summary, _, output) = run(yaml, &[]).await;

        assert_eq!(summary.aborted.as_deref(), Some("lost"));
        assert!(output.contains(r#"no item "ghost" found"#));
    }

    #[tokio::test]
    async fn requests_and_tests_inherit_by_name() {
        let stub = spawn_stub().await;
        let yaml = r#"
requests:
  - name: base
    method: GET
    url: "{base}/missing"
  - name: health
    inherit: base
    url: "{base}/health"
tests:
  - name: ping
    request: health
    expect: { text: ok }
  - name: pong
    inherit: ping
    expect: { text: nope }
  - ping
  - pong
"#;

        let (summary, _, output) = run(yaml, &[("base", stub.base.as_str())]).await;

        // The inline `pong` is run as written and has no request of its own; only the
        // reference by name goes through inheritance.
        assert_eq!(summary.passed, 3, "{output}");
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "pong");
        assert_eq!(summary.failed[0].1.path(), "expect.text");
    }

    #[tokio::test]
    async fn test_names_are_substituted() {
        let yaml = r#"
tests:
  - name: "check {who}"
"#;

        let (_, _, output) = run(yaml, &[("who", "alice")]).await;

        assert!(output.contains("running test check alice"));
    }

    #[test]
    fn set_accepts_a_single_pair_or_a_list() {
        let mut env = Environment::new();

        execute_commands(&json!({"set": {"key": "a", "value": "1"}}), &mut env).unwrap();
        execute_commands(
            &json!({"set": [{"key": "b", "value": "2"}, {"key": "a", "value": "3"}]}),
            &mut env,
        )
        .unwrap();

        assert_eq!(env.get("a"), Some("3"));
        assert_eq!(env.get("b"), Some("2"));
    }

    #[test]
    fn unknown_commands_are_ignored() {
        let mut env = Environment::new();

        execute_commands(&json!({"print": "hello"}), &mut env).unwrap();

        assert!(env.is_empty());
    }

    #[test]
    fn malformed_commands_are_errors() {
        let mut env = Environment::new();

        assert_eq!(
            execute_commands(&json!(["set"]), &mut env),
            Err(CommandError::NotAMapping("a sequence".into()))
        );
        assert_eq!(
            execute_commands(&json!({"set": [{"key": "a"}]}), &mut env),
            Err(CommandError::MalformedSet(0))
        );
    }

    #[test]
    fn default_http_code_never_overrides() {
        assert_eq!(
            with_default_http_code(json!({"text": "ok"})),
            json!({"text": "ok", "http_code": 200})
        );
        assert_eq!(
            with_default_http_code(json!({"http_code": "404"})),
            json!({"http_code": "404"})
        );
        assert_eq!(with_default_http_code(json!("ok")), json!("ok"));
    }
}
