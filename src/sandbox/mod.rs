//! Sandbox executor
//!
//! Runs untrusted user scripts in isolated Python worker subprocesses.
//! Workers are pooled and speak newline-delimited JSON over stdio: one
//! job line in, one result line out. Isolation is OS-level:
//!
//! - `resource.setrlimit` caps CPU seconds and resident memory at worker
//!   start;
//! - a per-job SIGALRM watchdog inside the worker converts wall-clock
//!   overruns of interpretable code into a structured `Timeout`;
//! - the parent enforces the same wall-clock budget with a hard kill, so
//!   a worker stuck in native code cannot stall the tick;
//! - imports go through a whitelist-enforcing loader and builtins are
//!   restricted; `print` is rebound to stderr so user output cannot
//!   corrupt the protocol stream.
//!
//! Workers are recycled after a configurable invocation count to bound
//! memory growth. Concurrency is capped by a semaphore with FIFO
//! fairness; requests above the ceiling queue.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::registry::ALLOWED_MODULES;

/// Structured failure classes a script invocation can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Timeout,
    MemoryLimit,
    InvalidReturn,
    RuntimeException,
    ImportDenied,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Timeout => "Timeout",
            FailureKind::MemoryLimit => "MemoryLimit",
            FailureKind::InvalidReturn => "InvalidReturn",
            FailureKind::RuntimeException => "RuntimeException",
            FailureKind::ImportDenied => "ImportDenied",
        };
        f.write_str(name)
    }
}

/// A failed invocation: kind, human-readable message, truncated trace.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct SandboxFailure {
    pub kind: FailureKind,
    pub message: String,
    pub trace: String,
}

/// One script invocation.
#[derive(Debug, Clone)]
pub struct ScriptJob {
    pub code: String,
    /// Fresh value invalidates any worker-side compilation cache.
    pub code_version: String,
    /// Trimmed context delivered to `generate_decisions`.
    pub context: Value,
}

pub type SandboxResult = Result<Value, SandboxFailure>;

/// Python worker loop. Applies resource limits once, then serves jobs
/// until recycled. Kept as source so the executor has no on-disk
/// artifacts to manage.
const WORKER_SOURCE: &str = r#"
import builtins, json, os, signal, sys, traceback

try:
    import resource
    mem = int(os.environ.get("SANDBOX_MEM_MB", "256")) * 1024 * 1024
    cpu = int(os.environ.get("SANDBOX_CPU_S", "1"))
    try:
        resource.setrlimit(resource.RLIMIT_AS, (mem, mem))
    except (ValueError, OSError):
        pass
    try:
        resource.setrlimit(resource.RLIMIT_CPU, (cpu, cpu))
    except (ValueError, OSError):
        pass
except ImportError:
    pass

ALLOWED_NAMES = [
    "abs", "all", "any", "bool", "dict", "divmod", "enumerate", "filter",
    "float", "int", "isinstance", "issubclass", "iter", "len", "list",
    "map", "max", "min", "next", "object", "pow", "range", "repr",
    "round", "set", "sorted", "str", "sum", "tuple", "type", "zip",
    "Exception", "ValueError", "TypeError", "RuntimeError",
    "NotImplementedError", "StopIteration", "KeyError", "IndexError",
]

class _ImportDenied(ImportError):
    pass

class _JobTimeout(Exception):
    pass

def _on_alarm(signum, frame):
    raise _JobTimeout()

signal.signal(signal.SIGALRM, _on_alarm)

def _stderr_print(*args, **kwargs):
    kwargs.pop("file", None)
    print(*args, file=sys.stderr, **kwargs)

def _safe_builtins(allowed):
    safe = {}
    for name in ALLOWED_NAMES:
        if hasattr(builtins, name):
            safe[name] = getattr(builtins, name)
    safe["__build_class__"] = builtins.__build_class__
    safe["print"] = _stderr_print
    real_import = builtins.__import__
    def safe_import(name, globals=None, locals=None, fromlist=(), level=0):
        if level != 0:
            raise _ImportDenied("relative imports are forbidden")
        ok = any(name == m or name.startswith(m + ".") for m in allowed)
        if not ok:
            raise _ImportDenied("module %r is not in the import whitelist" % name)
        return real_import(name, globals, locals, fromlist, level)
    safe["__import__"] = safe_import
    return safe

def _reply(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

def _fail(kind, message, trace=""):
    _reply({"err": {"kind": kind, "message": message, "trace": trace[-2000:]}})

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    try:
        job = json.loads(line)
    except ValueError:
        _fail("RuntimeException", "malformed job envelope")
        continue
    timeout = float(job.get("timeout", 0.75))
    try:
        signal.setitimer(signal.ITIMER_REAL, timeout)
        env = {"__builtins__": _safe_builtins(set(job.get("allowed_modules", [])))}
        exec(job.get("code", ""), env, env)
        fn = env.get("generate_decisions")
        if not callable(fn):
            _fail("RuntimeException", "script does not define generate_decisions")
            continue
        result = fn(job.get("context", {}))
        if result is None:
            result = {}
        try:
            payload = json.dumps({"ok": result})
        except (TypeError, ValueError):
            _fail("InvalidReturn", "return value is not serializable")
            continue
        sys.stdout.write(payload + "\n")
        sys.stdout.flush()
    except _JobTimeout:
        _fail("Timeout", "wall-clock limit of %.2fs exceeded" % timeout)
    except _ImportDenied as exc:
        _fail("ImportDenied", str(exc))
    except MemoryError:
        _fail("MemoryLimit", "memory limit exceeded")
    except BaseException as exc:
        _fail("RuntimeException", str(exc) or type(exc).__name__,
              traceback.format_exc())
    finally:
        signal.setitimer(signal.ITIMER_REAL, 0)
"#;

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    invocations: u64,
}

impl Worker {
    async fn spawn(config: &SandboxConfig) -> Result<Self, SandboxFailure> {
        let mut child = Command::new(&config.python_bin)
            .arg("-c")
            .arg(WORKER_SOURCE)
            .env("SANDBOX_MEM_MB", config.script_memory_limit_mb.to_string())
            .env("SANDBOX_CPU_S", config.script_cpu_limit_seconds.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxFailure {
                kind: FailureKind::RuntimeException,
                message: format!("failed to spawn worker: {e}"),
                trace: String::new(),
            })?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
        Ok(Self {
            child,
            stdin,
            stdout,
            invocations: 0,
        })
    }

    async fn kill(mut self) {
        let _ = self.child.kill().await;
    }
}

/// The executor: bounded worker pool plus concurrency gate.
pub struct SandboxExecutor {
    config: SandboxConfig,
    idle: Mutex<VecDeque<Worker>>,
    permits: Semaphore,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        let permits = config
            .script_execution_concurrency
            .min(config.worker_pool_size.max(1));
        Self {
            config,
            idle: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(permits.max(1)),
        }
    }

    /// Execute one script invocation.
    ///
    /// Every failure mode maps onto a `SandboxFailure`; the orchestrator
    /// absorbs these into fallback decisions and never aborts the tick.
    pub async fn execute(&self, job: &ScriptJob) -> SandboxResult {
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("sandbox semaphore closed");

        let mut worker = match self.checkout().await {
            Some(worker) => worker,
            None => Worker::spawn(&self.config).await?,
        };

        let envelope = serde_json::json!({
            "code": job.code,
            "code_version": job.code_version,
            "context": job.context,
            "allowed_modules": ALLOWED_MODULES,
            "timeout": self.config.script_timeout_seconds,
        });
        let mut line = envelope.to_string();
        line.push('\n');

        let wall_budget =
            Duration::from_secs_f64(self.config.script_timeout_seconds) + Duration::from_millis(250);

        let outcome: Result<SandboxResult, SandboxFailure> = async {
            worker.stdin.write_all(line.as_bytes()).await.map_err(|e| SandboxFailure {
                kind: FailureKind::RuntimeException,
                message: format!("worker rejected job: {e}"),
                trace: String::new(),
            })?;
            let mut response = String::new();
            let read = tokio::time::timeout(wall_budget, worker.stdout.read_line(&mut response))
                .await
                .map_err(|_| SandboxFailure {
                    kind: FailureKind::Timeout,
                    message: format!(
                        "wall-clock limit of {:.2}s exceeded",
                        self.config.script_timeout_seconds
                    ),
                    trace: String::new(),
                })?;
            match read {
                Ok(0) => Err(SandboxFailure {
                    // worker died mid-job: an OS resource limit fired
                    kind: FailureKind::Timeout,
                    message: "worker terminated by resource limit".to_string(),
                    trace: String::new(),
                }),
                Ok(_) => Ok(parse_response(&response)),
                Err(e) => Err(SandboxFailure {
                    kind: FailureKind::RuntimeException,
                    message: format!("worker protocol error: {e}"),
                    trace: String::new(),
                }),
            }
        }
        .await;

        match outcome {
            Ok(result) => {
                worker.invocations += 1;
                self.checkin(worker).await;
                result
            }
            Err(failure) => {
                // the worker is in an unknown state; replace it
                debug!(kind = %failure.kind, "discarding sandbox worker");
                worker.kill().await;
                Err(failure)
            }
        }
    }

    async fn checkout(&self) -> Option<Worker> {
        let mut idle = self.idle.lock().await;
        idle.pop_front()
    }

    async fn checkin(&self, worker: Worker) {
        if worker.invocations >= self.config.worker_max_invocations {
            debug!(
                invocations = worker.invocations,
                "recycling sandbox worker at invocation cap"
            );
            worker.kill().await;
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() >= self.config.worker_pool_size {
            drop(idle);
            worker.kill().await;
            return;
        }
        idle.push_back(worker);
    }

    /// Kill every pooled worker (shutdown hook).
    pub async fn shutdown(&self) {
        let mut idle = self.idle.lock().await;
        while let Some(worker) = idle.pop_front() {
            worker.kill().await;
        }
    }
}

fn parse_response(raw: &str) -> SandboxResult {
    let value: Value = match serde_json::from_str(raw.trim()) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "unparseable sandbox response");
            return Err(SandboxFailure {
                kind: FailureKind::RuntimeException,
                message: format!("unparseable worker response: {e}"),
                trace: String::new(),
            });
        }
    };
    if let Some(ok) = value.get("ok") {
        return Ok(ok.clone());
    }
    if let Some(err) = value.get("err") {
        let kind = match err.get("kind").and_then(Value::as_str) {
            Some("Timeout") => FailureKind::Timeout,
            Some("MemoryLimit") => FailureKind::MemoryLimit,
            Some("InvalidReturn") => FailureKind::InvalidReturn,
            Some("ImportDenied") => FailureKind::ImportDenied,
            _ => FailureKind::RuntimeException,
        };
        return Err(SandboxFailure {
            kind,
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown failure")
                .to_string(),
            trace: err
                .get("trace")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        });
    }
    Err(SandboxFailure {
        kind: FailureKind::RuntimeException,
        message: "worker response missing ok/err".to_string(),
        trace: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ok_response() {
        let result = parse_response(r#"{"ok": {"firm": {"price": 12.0}}}"#);
        assert_eq!(result.unwrap()["firm"]["price"], 12.0);
    }

    #[test]
    fn test_parse_err_response_kinds() {
        let raw = r#"{"err": {"kind": "ImportDenied", "message": "module 'os'", "trace": ""}}"#;
        let failure = parse_response(raw).unwrap_err();
        assert_eq!(failure.kind, FailureKind::ImportDenied);
        assert!(failure.message.contains("os"));
    }

    #[test]
    fn test_parse_garbage_response() {
        let failure = parse_response("not json").unwrap_err();
        assert_eq!(failure.kind, FailureKind::RuntimeException);
    }
}
