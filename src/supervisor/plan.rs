use std::path::PathBuf;

use indexmap::IndexMap;

use crate::error::{AppError, Result};
use crate::graph::DependencyGraph;
use crate::manifest::{Language, Project, ServiceKind, ServiceSpec};
use crate::ports::PortBroker;

/// Debug-port bases per language; the Nth debug-enabled service in plan
/// order gets base + N.
const NODE_DEBUG_BASE: u16 = 9229;
const PYTHON_DEBUG_BASE: u16 = 5678;
const GO_DEBUG_BASE: u16 = 40000;
const DOTNET_DEBUG_BASE: u16 = 4020;

/// The active, resolved plan for one service. Immutable until restart.
#[derive(Debug, Clone)]
pub struct ServiceRuntime {
    pub spec: ServiceSpec,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Service-specific environment; the parent environment is inherited at
    /// spawn time.
    pub env: IndexMap<String, String>,
    pub port: u16,
    pub debug_port: Option<u16>,
}

impl ServiceRuntime {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn rendered_command(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Force debug mode for these services (empty = manifest-driven).
    pub debug_services: Vec<String>,
    pub wait_for_debugger: bool,
    /// Persist OS-assigned ports back through the manifest collaborator.
    pub persist_ports: bool,
    /// Extra environment applied to every service (`--env-file`).
    pub extra_env: IndexMap<String, String>,
}

#[derive(Debug)]
pub struct Plan {
    /// Runtimes in start order.
    pub runtimes: Vec<ServiceRuntime>,
}

/// Plan phase: order services, assign primary and debug ports
/// deterministically, resolve argv and environment. Nothing is spawned here.
pub fn plan(
    project: &Project,
    selected: Option<&[String]>,
    broker: &PortBroker,
    opts: &PlanOptions,
) -> Result<Plan> {
    let graph = DependencyGraph::build(&project.services)?;
    let order: Vec<String> = match selected {
        Some(names) => {
            for n in names {
                if !project.services.contains_key(n) {
                    return Err(AppError::UnknownService(n.clone()));
                }
            }
            graph.closure(&project.services, names)
        }
        None => graph.start_order().to_vec(),
    };

    // First pass: ports. Deterministic order makes both port probing and
    // debug-port counting reproducible.
    let mut ports: IndexMap<String, u16> = IndexMap::new();
    let mut debug_ports: IndexMap<String, u16> = IndexMap::new();
    let mut debug_idx: u16 = 0;
    for name in &order {
        let spec = &project.services[name];
        let port = broker.acquire(name, &spec.requested_ports)?;
        ports.insert(name.clone(), port);

        if wants_debug(spec, opts) {
            if let Some(base) = debug_base(spec) {
                let dbg = broker.acquire(name, &[base + debug_idx])?;
                debug_ports.insert(name.clone(), dbg);
                debug_idx += 1;
            }
        }
    }

    // Second pass: argv + env, now that every sibling port is known.
    let mut runtimes = Vec::with_capacity(order.len());
    for name in &order {
        let spec = &project.services[name];
        let port = ports[name];
        let runtime = build_runtime(
            project,
            spec,
            port,
            debug_ports.get(name).copied(),
            &ports,
            opts,
        )?;

        if opts.persist_ports && spec.requested_ports.first() != Some(&port) {
            let manifest_path = project.dir.join(crate::manifest::MANIFEST_NAME);
            if let Err(e) = crate::manifest::update_service_port(&manifest_path, name, port) {
                tracing::warn!("[{name}] could not persist port {port}: {e}");
            }
        }
        runtimes.push(runtime);
    }

    Ok(Plan { runtimes })
}

fn wants_debug(spec: &ServiceSpec, opts: &PlanOptions) -> bool {
    opts.debug_services.iter().any(|n| n == &spec.name)
        || spec.debug.as_ref().is_some_and(|d| d.enabled)
}

fn debug_base(spec: &ServiceSpec) -> Option<u16> {
    match &spec.kind {
        ServiceKind::Container { .. } => None,
        ServiceKind::Process { language, .. } => match language {
            Language::Node => Some(NODE_DEBUG_BASE),
            Language::Python => Some(PYTHON_DEBUG_BASE),
            Language::Go => Some(GO_DEBUG_BASE),
            Language::Dotnet => Some(DOTNET_DEBUG_BASE),
            Language::Other(_) => None,
        },
    }
}

/// Resolve one service's final command, argv, and environment.
pub fn build_runtime(
    project: &Project,
    spec: &ServiceSpec,
    port: u16,
    debug_port: Option<u16>,
    sibling_ports: &IndexMap<String, u16>,
    opts: &PlanOptions,
) -> Result<ServiceRuntime> {
    let wait = opts.wait_for_debugger
        || spec.debug.as_ref().is_some_and(|d| d.wait_for_debugger);

    let mut env: IndexMap<String, String> = IndexMap::new();
    env.extend(opts.extra_env.clone());
    env.extend(spec.env.clone());
    env.insert("PORT".into(), port.to_string());
    env.insert("HOST".into(), "127.0.0.1".into());
    for (sibling, &sport) in sibling_ports {
        let key = env_name(sibling);
        env.insert(format!("SERVICE_{key}_PORT"), sport.to_string());
        env.insert(
            format!("SERVICE_{key}_URL"),
            format!("http://127.0.0.1:{sport}"),
        );
    }

    let (program, args) = match &spec.kind {
        ServiceKind::Container {
            image,
            container_port,
        } => container_argv(project, spec, image, port, *container_port, &env),
        ServiceKind::Process {
            language,
            framework,
        } => {
            let mut parts = match &spec.command {
                Some(cmd) => split_cmd(cmd),
                None => default_command(spec, language, framework)?,
            };
            parts.extend(framework_port_args(&parts, port));
            apply_debug(&mut parts, &mut env, language, debug_port, wait);
            let program = parts
                .first()
                .cloned()
                .ok_or_else(|| AppError::Config(format!("service '{}' has an empty command", spec.name)))?;
            (program, parts[1..].to_vec())
        }
    };

    Ok(ServiceRuntime {
        spec: spec.clone(),
        program,
        args,
        working_dir: spec.working_dir.clone(),
        env,
        port,
        debug_port,
    })
}

pub fn env_name(service: &str) -> String {
    service.to_ascii_uppercase().replace('-', "_")
}

pub fn container_name(project: &Project, service: &str) -> String {
    format!("azd-app-{}-{}", project.name, service)
}

fn container_argv(
    project: &Project,
    spec: &ServiceSpec,
    image: &str,
    port: u16,
    container_port: Option<u16>,
    env: &IndexMap<String, String>,
) -> (String, Vec<String>) {
    let inner = container_port.unwrap_or(port);
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container_name(project, &spec.name),
        "-p".to_string(),
        format!("127.0.0.1:{port}:{inner}"),
    ];
    for (k, v) in env {
        args.push("-e".to_string());
        args.push(format!("{k}={v}"));
    }
    args.push(image.to_string());
    ("docker".to_string(), args)
}

fn default_command(
    spec: &ServiceSpec,
    language: &Language,
    framework: &Option<String>,
) -> Result<Vec<String>> {
    let fw = framework.as_deref().unwrap_or("").to_ascii_lowercase();
    let parts: Vec<&str> = match language {
        Language::Node => match fw.as_str() {
            "vite" | "next" | "astro" | "nuxt" | "remix" => vec!["npm", "run", "dev"],
            _ => vec!["npm", "start"],
        },
        Language::Python => match fw.as_str() {
            "fastapi" | "uvicorn" => vec!["uvicorn", "main:app"],
            "flask" => vec!["flask", "run"],
            _ => vec!["python", "main.py"],
        },
        Language::Go => vec!["go", "run", "."],
        Language::Dotnet => vec!["dotnet", "run"],
        Language::Other(name) => {
            return Err(AppError::Config(format!(
                "service '{}' (language '{name}') needs an explicit command",
                spec.name
            )))
        }
    };
    Ok(parts.into_iter().map(str::to_string).collect())
}

/// Inject the language-conventional debugger flags.
fn apply_debug(
    parts: &mut Vec<String>,
    env: &mut IndexMap<String, String>,
    language: &Language,
    debug_port: Option<u16>,
    wait: bool,
) {
    let Some(dbg) = debug_port else { return };
    match language {
        Language::Node => {
            // NODE_OPTIONS reaches node even behind npm/npx wrappers.
            let flag = if wait { "--inspect-brk" } else { "--inspect" };
            env.insert("NODE_OPTIONS".into(), format!("{flag}=127.0.0.1:{dbg}"));
        }
        Language::Python => {
            if parts
                .first()
                .is_some_and(|p| p == "python" || p == "python3")
            {
                let mut prefix = vec![
                    parts[0].clone(),
                    "-m".to_string(),
                    "debugpy".to_string(),
                    "--listen".to_string(),
                    format!("127.0.0.1:{dbg}"),
                ];
                if wait {
                    prefix.push("--wait-for-client".to_string());
                }
                prefix.extend(parts.drain(1..));
                *parts = prefix;
            } else {
                env.insert("DEBUGPY_PORT".into(), dbg.to_string());
            }
        }
        Language::Go => {
            let rest: Vec<String> = parts.drain(..).collect();
            *parts = vec![
                "dlv".to_string(),
                "debug".to_string(),
                "--headless".to_string(),
                format!("--listen=127.0.0.1:{dbg}"),
                "--accept-multiclient".to_string(),
            ];
            if !wait {
                parts.push("--continue".to_string());
            }
            // `go run .` becomes `dlv debug .`; keep any package argument.
            if let Some(pkg) = rest.iter().skip_while(|p| *p != "run").nth(1) {
                parts.push(pkg.clone());
            }
        }
        Language::Dotnet => {
            env.insert("VSDBG_PORT".into(), dbg.to_string());
            if wait {
                env.insert("VSDBG_WAIT".into(), "1".into());
            }
        }
        Language::Other(_) => {}
    }
}

/// Shell-style command splitting: handles single/double quotes and backslash
/// escapes. e.g. `node server.js --title 'hello world'` →
/// ["node", "server.js", "--title", "hello world"]
pub fn split_cmd(cmd: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut chars = cmd.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(ch) = chars.next() {
        match ch {
            '\\' if !in_single => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ' ' | '\t' if !in_single && !in_double => {
                if !current.is_empty() {
                    args.push(current.clone());
                    current.clear();
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Detect framework from the command and inject `--port <port>` if needed.
/// Some dev servers ignore the PORT env var and require an explicit flag.
pub fn framework_port_args(parts: &[String], port: u16) -> Vec<String> {
    let p = port.to_string();
    let direct = ["vite", "next", "astro", "nuxt", "remix", "svelte-kit", "uvicorn", "flask"];
    let runners = ["npx", "pnpm", "yarn", "bunx"];

    let program = parts.first().map(String::as_str).unwrap_or("");
    let second = parts.get(1).map(String::as_str).unwrap_or("");

    let framework = if direct.contains(&program) {
        program
    } else if runners.contains(&program) {
        if second == "exec" || second == "run" || second == "dlx" {
            parts.get(2).map(String::as_str).unwrap_or("")
        } else {
            second
        }
    } else {
        ""
    };

    if direct.contains(&framework) {
        vec!["--port".into(), p]
    } else {
        vec![]
    }
}
