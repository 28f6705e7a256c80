use flowgate_core::config::{AppConfig, StoreBackend};
use flowgate_nodes::NodeRegistry;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

pub fn run_doctor(config: &AppConfig) {
    let checks = vec![
        // 1. Backing store reachable
        check_store(config),
        // 2. Handler directories and manifests
        check_handlers(config),
        // 3. Engine limits
        check_engine(config),
        // 4. Circuit breaker thresholds
        check_circuit_breaker(config),
        // 5. Worker queues and heartbeat
        check_worker(config),
        // 6. Credentials fully expanded
        check_credentials(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn check_store(config: &AppConfig) -> CheckResult {
    match config.store.backend {
        StoreBackend::Memory => CheckResult {
            label: "Store".into(),
            ok: true,
            detail: "In-memory (state is not shared between processes)".into(),
        },
        StoreBackend::Sqlite => {
            let path = config.store_path();
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return CheckResult {
                        label: "Store".into(),
                        ok: false,
                        detail: format!("{} (cannot create directory: {})", path.display(), e),
                    };
                }
            }
            match flowgate_store::SqliteStore::open(&path) {
                Ok(_) => CheckResult {
                    label: "Store".into(),
                    ok: true,
                    detail: format!("{}", path.display()),
                },
                Err(e) => CheckResult {
                    label: "Store".into(),
                    ok: false,
                    detail: format!("{}: {}", path.display(), e),
                },
            }
        }
    }
}

fn check_handlers(config: &AppConfig) -> CheckResult {
    let dirs = config.handler_dirs();
    let missing: Vec<String> = dirs
        .iter()
        .filter(|d| !d.is_dir())
        .map(|d| d.display().to_string())
        .collect();

    let mut registry = NodeRegistry::with_builtins();
    let builtins = registry.len();
    let report = registry.discover(&dirs);

    let detail = format!(
        "{} built-in, {} discovered, {} skipped",
        builtins, report.loaded, report.skipped
    );
    if report.skipped > 0 {
        CheckResult {
            label: "Handlers".into(),
            ok: false,
            detail: format!("{} (see logs for skipped manifests)", detail),
        }
    } else if !missing.is_empty() {
        CheckResult {
            label: "Handlers".into(),
            ok: true,
            detail: format!("{}; missing dirs: {}", detail, missing.join(", ")),
        }
    } else {
        CheckResult {
            label: "Handlers".into(),
            ok: true,
            detail,
        }
    }
}

fn check_engine(config: &AppConfig) -> CheckResult {
    let engine = &config.engine;
    if engine.default_timeout_secs == 0 {
        return CheckResult {
            label: "Engine".into(),
            ok: false,
            detail: "default_timeout_secs is 0; every handler would time out".into(),
        };
    }
    CheckResult {
        label: "Engine".into(),
        ok: engine.max_parallel_iterations > 0,
        detail: format!(
            "timeout {}s, {} parallel iterations",
            engine.default_timeout_secs,
            engine.max_parallel_iterations.max(1)
        ),
    }
}

fn check_circuit_breaker(config: &AppConfig) -> CheckResult {
    let cb = &config.circuit_breaker;
    if cb.failure_threshold == 0 || cb.half_open_max_calls == 0 {
        return CheckResult {
            label: "Circuit breaker".into(),
            ok: false,
            detail: format!(
                "failure_threshold ({}) and half_open_max_calls ({}) must be at least 1",
                cb.failure_threshold, cb.half_open_max_calls
            ),
        };
    }
    CheckResult {
        label: "Circuit breaker".into(),
        ok: true,
        detail: format!(
            "open after {} failures, recover after {}s",
            cb.failure_threshold, cb.recovery_timeout_secs
        ),
    }
}

fn check_worker(config: &AppConfig) -> CheckResult {
    let worker = &config.worker;
    if worker.queues.is_empty() {
        return CheckResult {
            label: "Worker".into(),
            ok: false,
            detail: "No queues configured".into(),
        };
    }
    if worker.heartbeat_interval_secs == 0 {
        return CheckResult {
            label: "Worker".into(),
            ok: false,
            detail: "heartbeat_interval_secs is 0".into(),
        };
    }
    CheckResult {
        label: "Worker".into(),
        ok: true,
        detail: format!(
            "type '{}', queues {}",
            worker.worker_type,
            worker.queues.join(" > ")
        ),
    }
}

fn check_credentials(config: &AppConfig) -> CheckResult {
    let unresolved: Vec<String> = config
        .credentials
        .iter()
        .flat_map(|(key, fields)| {
            fields
                .iter()
                .filter(|(_, v)| v.starts_with("${"))
                .map(move |(field, _)| format!("{}.{}", key, field))
        })
        .collect();

    if unresolved.is_empty() {
        CheckResult {
            label: "Credentials".into(),
            ok: true,
            detail: format!("{} configured", config.credentials.len()),
        }
    } else {
        CheckResult {
            label: "Credentials".into(),
            ok: false,
            detail: format!("Unset environment variables for {}", unresolved.join(", ")),
        }
    }
}
