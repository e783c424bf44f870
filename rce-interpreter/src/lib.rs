#![deny(missing_docs)]
//! The Interpreter Sandbox: a resource-capped Rhai engine used for
//! interpreter-backed reasoning steps (arithmetic, data shaping, short
//! procedural scratch-work) that don't warrant a full sub-completion.
//!
//! Every execution runs on a blocking-pool thread, raced against a deadline,
//! under an engine configured with hard operation/string/array/call-depth
//! ceilings and a module import allowlist. Nothing an interpreted script does
//! can escape as a panic or an unbounded loop into the Orchestrator: every
//! failure mode is folded into [`InterpreterError`].

use lru::LruCache;
use rce_core::SessionId;
use rhai::{Engine, ModuleResolver, Scope};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

const MAX_OUTPUT_BYTES: usize = 100 * 1024;
const MAX_OUTPUT_LINES: usize = 1000;

/// Errors from an interpreter execution.
///
/// None of these propagate to the Orchestrator as a hard failure of the
/// overall completion — a caller sees them as a normal tool result and may
/// choose to retry, rephrase, or give up on interpreter use for that turn.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum InterpreterError {
    /// The script itself raised an error, or failed to parse.
    #[error("execution error: {0}")]
    ExecutionError(String),

    /// The script did not finish within its profile's timeout.
    #[error("execution timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout {
        /// How long the script ran before being abandoned.
        elapsed_ms: u64,
        /// The profile's configured timeout.
        limit_ms: u64,
    },

    /// The script attempted to import a module outside the allowlist.
    #[error("import of module {module:?} is not permitted (allowed: {allowlist:?})")]
    SecurityViolation {
        /// The module path the script tried to import.
        module: String,
        /// The modules this sandbox permits.
        allowlist: Vec<String>,
    },

    /// The script's output exceeded the global size caps.
    #[error("output exceeded resource caps: {detail}")]
    ResourceExceeded {
        /// Which cap was exceeded and by how much.
        detail: String,
    },
}

/// A named resource profile for one execution.
///
/// Profiles trade isolation strictness for headroom: `Quick` suits a single
/// expression evaluation, `Extended` suits a short data-transformation
/// script that may need more operations and a longer clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProfile {
    /// A single expression or trivial calculation. Tightest caps.
    Quick,
    /// General-purpose scratch-work. The default when unspecified.
    Default,
    /// Larger data manipulation — more operations, more array/string headroom.
    Analysis,
    /// The longest-running, most permissive profile this sandbox offers.
    Extended,
}

impl Default for ExecutionProfile {
    fn default() -> Self {
        ExecutionProfile::Default
    }
}

/// The resolved limits for a profile.
#[derive(Debug, Clone, Copy)]
struct ProfileLimits {
    timeout: Duration,
    /// Advisory heap ceiling for this profile. Rhai has no hook for
    /// tracking raw allocated bytes, so this isn't enforced directly —
    /// `max_string_size`/`max_array_size`/`max_operations` are the actual
    /// enforced proxies for it (see DESIGN.md).
    #[allow(dead_code)]
    memory_cap_bytes: usize,
    max_operations: u64,
    max_string_size: usize,
    max_array_size: usize,
    max_call_levels: usize,
}

impl ExecutionProfile {
    fn limits(self) -> ProfileLimits {
        match self {
            ExecutionProfile::Quick => ProfileLimits {
                timeout: Duration::from_secs(5),
                memory_cap_bytes: 128 * 1024 * 1024,
                max_operations: 10_000,
                max_string_size: 8 * 1024,
                max_array_size: 256,
                max_call_levels: 16,
            },
            ExecutionProfile::Default => ProfileLimits {
                timeout: Duration::from_secs(30),
                memory_cap_bytes: 512 * 1024 * 1024,
                max_operations: 100_000,
                max_string_size: 64 * 1024,
                max_array_size: 4096,
                max_call_levels: 32,
            },
            ExecutionProfile::Analysis => ProfileLimits {
                timeout: Duration::from_secs(120),
                memory_cap_bytes: 2 * 1024 * 1024 * 1024,
                max_operations: 500_000,
                max_string_size: 256 * 1024,
                max_array_size: 16_384,
                max_call_levels: 48,
            },
            ExecutionProfile::Extended => ProfileLimits {
                timeout: Duration::from_secs(300),
                memory_cap_bytes: 4 * 1024 * 1024 * 1024,
                max_operations: 2_000_000,
                max_string_size: 512 * 1024,
                max_array_size: 65_536,
                max_call_levels: 64,
            },
        }
    }
}

/// The result of one successful execution.
#[derive(Debug, Clone)]
pub struct InterpreterResult {
    /// The script's final expression value, as JSON.
    pub output: Value,
    /// Anything written via `print`/`debug` during execution, newline-joined.
    pub stdout: String,
    /// Wall-clock duration of the execution.
    pub duration_ms: u64,
    /// Set when `stdout`/`output` were cut down to the global size caps.
    pub truncated: bool,
    /// Peak resident memory observed during execution, when available.
    pub peak_memory_bytes: Option<u64>,
    /// CPU time consumed during execution, when available.
    pub cpu_time_ms: Option<u64>,
}

/// A module resolver that rejects any import not on the configured allowlist.
///
/// Rhai consults this before resolving an `import "path" as m;` statement;
/// returning `Err` here is how the sandbox turns an import attempt into a
/// [`InterpreterError::SecurityViolation`] instead of ever loading a module.
struct AllowlistResolver {
    allowlist: Vec<String>,
}

impl ModuleResolver for AllowlistResolver {
    fn resolve(
        &self,
        _engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: rhai::Position,
    ) -> Result<rhai::Shared<rhai::Module>, Box<rhai::EvalAltResult>> {
        if self.allowlist.iter().any(|allowed| allowed == path) {
            return Ok(rhai::Shared::new(rhai::Module::new()));
        }
        Err(Box::new(rhai::EvalAltResult::ErrorModuleNotFound(
            path.to_string(),
            pos,
        )))
    }
}

/// Key for the result memo cache: the script text plus a hash of the
/// session variable snapshot it was run against.
type CacheKey = (String, u64);

/// A sandboxed interpreter bound to the allowlist and cache it was built with.
///
/// One `InterpreterSandbox` is shared across sessions; the memo cache is
/// keyed by `(code, session variable snapshot hash)` so identical scratch
/// computations against identical state are never re-executed.
pub struct InterpreterSandbox {
    allowlist: Vec<String>,
    cache: Mutex<LruCache<CacheKey, InterpreterResult>>,
}

impl InterpreterSandbox {
    /// Build a sandbox with the given module allowlist and memo cache capacity.
    pub fn new(allowlist: Vec<String>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            allowlist,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Execute `code` in the given session's scope under `profile`'s limits.
    ///
    /// `context_overrides` seeds the Rhai scope with caller-supplied
    /// variables before the script runs (e.g. prior interpreter results
    /// carried over from the same session).
    pub async fn execute(
        &self,
        code: &str,
        session_id: &SessionId,
        profile: ExecutionProfile,
        context_overrides: serde_json::Map<String, Value>,
    ) -> Result<InterpreterResult, InterpreterError> {
        let cache_key = (code.to_string(), hash_overrides(&context_overrides));
        if let Some(hit) = self.cache.lock().unwrap().get(&cache_key).cloned() {
            tracing::debug!(session_id = %session_id, "interpreter cache hit");
            return Ok(hit);
        }

        let limits = profile.limits();
        let code = code.to_string();
        let overrides = context_overrides;
        let allowlist = self.allowlist.clone();

        let start = Instant::now();
        let run = tokio::task::spawn_blocking(move || run_script(&code, &overrides, limits, &allowlist));

        let outcome = match tokio::time::timeout(limits.timeout, run).await {
            Ok(join_result) => join_result
                .map_err(|e| InterpreterError::ExecutionError(format!("interpreter task panicked: {e}")))?,
            Err(_) => {
                return Err(InterpreterError::Timeout {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    limit_ms: limits.timeout.as_millis() as u64,
                });
            }
        };

        let mut result = outcome?;
        result.duration_ms = start.elapsed().as_millis() as u64;
        enforce_output_caps(&mut result);

        self.cache.lock().unwrap().put(cache_key, result.clone());
        Ok(result)
    }
}

fn hash_overrides(overrides: &serde_json::Map<String, Value>) -> u64 {
    let mut hasher = DefaultHasher::new();
    // BTreeMap iteration order is unstable across a plain serde_json::Map
    // (it's IndexMap/BTreeMap depending on feature flags); sort keys so the
    // cache key is stable regardless of insertion order.
    let mut keys: Vec<&String> = overrides.keys().collect();
    keys.sort();
    for key in keys {
        key.hash(&mut hasher);
        overrides[key].to_string().hash(&mut hasher);
    }
    hasher.finish()
}

fn run_script(
    code: &str,
    overrides: &serde_json::Map<String, Value>,
    limits: ProfileLimits,
    allowlist: &[String],
) -> Result<InterpreterResult, InterpreterError> {
    let mut engine = Engine::new();
    engine.set_max_operations(limits.max_operations);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_module_resolver(AllowlistResolver {
        allowlist: allowlist.to_vec(),
    });

    let output_buf = std::sync::Arc::new(Mutex::new(Vec::<String>::new()));
    let print_buf = output_buf.clone();
    let debug_buf = output_buf.clone();
    engine.on_print(move |s| print_buf.lock().unwrap().push(s.to_string()));
    engine.on_debug(move |s, _src, _pos| debug_buf.lock().unwrap().push(s.to_string()));

    let mut scope = Scope::new();
    for (key, value) in overrides {
        scope.push(key.clone(), json_to_dynamic(value));
    }

    let result = engine.eval_with_scope::<rhai::Dynamic>(&mut scope, code);

    match result {
        Ok(dynamic) => {
            let output = dynamic_to_json(&dynamic);
            Ok(InterpreterResult {
                output,
                stdout: output_buf.lock().unwrap().join("\n"),
                duration_ms: 0,
                truncated: false,
                peak_memory_bytes: None,
                cpu_time_ms: None,
            })
        }
        Err(err) => {
            match &*err {
                rhai::EvalAltResult::ErrorModuleNotFound(module, _) => Err(InterpreterError::SecurityViolation {
                    module: module.clone(),
                    allowlist: allowlist.to_vec(),
                }),
                rhai::EvalAltResult::ErrorTooManyOperations(_)
                | rhai::EvalAltResult::ErrorDataTooLarge(_, _)
                | rhai::EvalAltResult::ErrorStackOverflow(_) => Err(InterpreterError::ResourceExceeded { detail: err.to_string() }),
                _ => Err(InterpreterError::ExecutionError(err.to_string())),
            }
        }
    }
}

/// Cuts `stdout`/`output` down to the global size caps in place, marking
/// `truncated` rather than failing the execution — the caller still gets a
/// usable (if partial) result to react to.
fn enforce_output_caps(result: &mut InterpreterResult) {
    let mut truncated = false;

    let lines: Vec<&str> = result.stdout.lines().collect();
    if lines.len() > MAX_OUTPUT_LINES {
        result.stdout = lines[..MAX_OUTPUT_LINES].join("\n");
        truncated = true;
    }
    if result.stdout.len() > MAX_OUTPUT_BYTES {
        let boundary = floor_char_boundary(&result.stdout, MAX_OUTPUT_BYTES);
        result.stdout.truncate(boundary);
        truncated = true;
    }

    let serialized = result.output.to_string();
    if serialized.len() > MAX_OUTPUT_BYTES {
        let boundary = floor_char_boundary(&serialized, MAX_OUTPUT_BYTES);
        result.output = Value::String(serialized[..boundary].to_string());
        truncated = true;
    }

    result.truncated = truncated;
}

/// The largest index `<= index` that lands on a UTF-8 character boundary.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn json_to_dynamic(value: &Value) -> rhai::Dynamic {
    match value {
        Value::Null => rhai::Dynamic::UNIT,
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else {
                n.as_f64().unwrap_or(0.0).into()
            }
        }
        Value::String(s) => s.clone().into(),
        Value::Array(items) => {
            let arr: rhai::Array = items.iter().map(json_to_dynamic).collect();
            arr.into()
        }
        Value::Object(map) => {
            let mut rhai_map = rhai::Map::new();
            for (k, v) in map {
                rhai_map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            rhai_map.into()
        }
    }
}

fn dynamic_to_json(value: &rhai::Dynamic) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::new("test-session")
    }

    #[tokio::test]
    async fn evaluates_a_simple_expression() {
        let sandbox = InterpreterSandbox::new(vec![], 16);
        let result = sandbox
            .execute("2 + 2", &session(), ExecutionProfile::Quick, Default::default())
            .await
            .unwrap();
        assert_eq!(result.output, serde_json::json!(4));
    }

    #[tokio::test]
    async fn sums_to_n_via_a_loop() {
        let sandbox = InterpreterSandbox::new(vec![], 16);
        let result = sandbox
            .execute(
                "let total = 0; for i in 1..=10 { total += i; } total",
                &session(),
                ExecutionProfile::Default,
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.output, serde_json::json!(55));
    }

    #[tokio::test]
    async fn seeds_scope_from_context_overrides() {
        let sandbox = InterpreterSandbox::new(vec![], 16);
        let mut overrides = serde_json::Map::new();
        overrides.insert("x".to_string(), serde_json::json!(21));
        let result = sandbox
            .execute("x * 2", &session(), ExecutionProfile::Quick, overrides)
            .await
            .unwrap();
        assert_eq!(result.output, serde_json::json!(42));
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let sandbox = InterpreterSandbox::new(vec![], 16);
        let err = sandbox
            .execute(
                "let x = 0; loop { x += 1; }",
                &session(),
                ExecutionProfile::Quick,
                Default::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InterpreterError::Timeout { .. } | InterpreterError::ExecutionError(_)
        ));
    }

    #[tokio::test]
    async fn disallowed_import_is_a_security_violation() {
        let sandbox = InterpreterSandbox::new(vec!["math".to_string()], 16);
        let err = sandbox
            .execute(
                r#"import "os" as os; 1"#,
                &session(),
                ExecutionProfile::Default,
                Default::default(),
            )
            .await
            .unwrap_err();
        match err {
            InterpreterError::SecurityViolation { module, allowlist } => {
                assert_eq!(module, "os");
                assert_eq!(allowlist, vec!["math".to_string()]);
            }
            other => panic!("expected SecurityViolation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn allowlisted_import_succeeds() {
        let sandbox = InterpreterSandbox::new(vec!["math".to_string()], 16);
        let result = sandbox
            .execute(r#"import "math" as m; 1"#, &session(), ExecutionProfile::Default, Default::default())
            .await
            .unwrap();
        assert_eq!(result.output, serde_json::json!(1));
    }

    #[tokio::test]
    async fn stdout_past_the_line_cap_is_truncated_not_errored() {
        let sandbox = InterpreterSandbox::new(vec![], 16);
        let result = sandbox
            .execute(
                r#"for i in 0..1500 { print(i); } 0"#,
                &session(),
                ExecutionProfile::Default,
                Default::default(),
            )
            .await
            .unwrap();
        assert!(result.truncated);
        assert_eq!(result.stdout.lines().count(), MAX_OUTPUT_LINES);
    }

    #[tokio::test]
    async fn identical_code_and_context_is_served_from_cache() {
        let sandbox = InterpreterSandbox::new(vec![], 16);
        let first = sandbox
            .execute("40 + 2", &session(), ExecutionProfile::Quick, Default::default())
            .await
            .unwrap();
        let second = sandbox
            .execute("40 + 2", &session(), ExecutionProfile::Quick, Default::default())
            .await
            .unwrap();
        assert_eq!(first.output, second.output);
    }

    #[tokio::test]
    async fn syntax_error_is_an_execution_error_not_a_panic() {
        let sandbox = InterpreterSandbox::new(vec![], 16);
        let err = sandbox
            .execute("let x = ;;;", &session(), ExecutionProfile::Quick, Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, InterpreterError::ExecutionError(_)));
    }
}
